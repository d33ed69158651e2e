//! The trait boundary a scripting host implements to receive completions.

use crate::value::HostValue;
use std::fmt;

/// Opaque identifier for a host coroutine, supplied by the host when it
/// submits an operation and echoed back through [`HostContext::resume`].
///
/// Lunet never inspects the host's actual coroutine object. It only ever
/// carries this token around (in the coref registry, in the alive-set, in a
/// handle context's per-role waiter slot) so the host can be asked, later,
/// to resume the coroutine this id names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoroutineId(pub u64);

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "co#{}", self.0)
    }
}

/// The result pair every asynchronous primitive eventually resumes a
/// coroutine with: spec §6's `(result | nil, error | nil)` contract.
pub type Completion = Result<HostValue, String>;

/// What the host reports after a resume call, so lunet knows whether the
/// coroutine is still suspended (and must remain anchored in the alive-set)
/// or has terminated (and should be unanchored).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeStatus {
    /// The coroutine yielded again; it remains live and must stay anchored.
    Yielded,
    /// The coroutine ran to completion.
    Completed,
    /// The coroutine raised an unhandled error.
    Errored,
}

impl ResumeStatus {
    /// Whether this status implies the coroutine is still suspended and
    /// must remain in the alive-set.
    pub fn is_suspended(self) -> bool {
        matches!(self, ResumeStatus::Yielded)
    }
}

/// Implemented by the embedding scripting host.
///
/// Lunet calls `resume` from inside a completion callback, on the same
/// thread that drives script execution (the "script domain", spec §5).
/// Implementations must not block and must not re-enter the runtime
/// synchronously from within `resume` (no reentrant `listen`/`connect`
/// calls while still inside the callback) — schedule those for the next
/// script step instead.
pub trait HostContext: Send + Sync {
    /// Resume the coroutine named by `id` with the given completion value,
    /// returning whether it is still suspended afterward.
    fn resume(&self, id: CoroutineId, completion: Completion) -> ResumeStatus;

    /// Report an internal invariant violation (canary mismatch, use after
    /// free, refcount underflow). The default implementation is a no-op;
    /// hosts that want hard failures in debug builds should panic here.
    fn report_invariant_violation(&self, message: &str) {
        let _ = message;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    struct RecordingHost {
        last: Mutex<Option<(CoroutineId, Completion)>>,
        next_status: AtomicU64,
    }

    impl HostContext for RecordingHost {
        fn resume(&self, id: CoroutineId, completion: Completion) -> ResumeStatus {
            *self.last.lock().unwrap() = Some((id, completion));
            match self.next_status.load(Ordering::SeqCst) {
                0 => ResumeStatus::Yielded,
                1 => ResumeStatus::Completed,
                _ => ResumeStatus::Errored,
            }
        }
    }

    #[test]
    fn resume_status_suspended_only_for_yielded() {
        assert!(ResumeStatus::Yielded.is_suspended());
        assert!(!ResumeStatus::Completed.is_suspended());
        assert!(!ResumeStatus::Errored.is_suspended());
    }

    #[test]
    fn host_context_records_resume() {
        let host = RecordingHost {
            last: Mutex::new(None),
            next_status: AtomicU64::new(1),
        };
        let status = host.resume(CoroutineId(42), Ok(HostValue::Unit));
        assert_eq!(status, ResumeStatus::Completed);
        assert_eq!(host.last.lock().unwrap().as_ref().unwrap().0, CoroutineId(42));
    }

    #[test]
    fn coroutine_id_display() {
        assert_eq!(CoroutineId(7).to_string(), "co#7");
    }
}
