//! A minimal [`HostContext`] used to smoke-test a script argument when no
//! scripting VM is linked in. The scripting language's C API itself is out
//! of scope for this crate (spec §1's Non-goals); a real embedder replaces
//! this with a `HostContext` that resumes its own coroutine objects. This
//! one just records resumes so the CLI can report what happened and set
//! the process exit code from the last result observed.

use std::sync::Mutex;

use lunet_sdk::{Completion, CoroutineId, HostContext, ResumeStatus};

/// Records every `resume` call it receives, in order.
#[derive(Default)]
pub struct DemoHost {
    calls: Mutex<Vec<(CoroutineId, Completion)>>,
}

impl DemoHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `resume` observed so far, oldest first.
    pub fn calls(&self) -> Vec<(CoroutineId, Completion)> {
        self.calls.lock().unwrap().clone()
    }
}

impl HostContext for DemoHost {
    fn resume(&self, id: CoroutineId, completion: Completion) -> ResumeStatus {
        tracing::debug!(coroutine = %id, ok = completion.is_ok(), "demo host resume");
        self.calls.lock().unwrap().push((id, completion));
        ResumeStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lunet_sdk::HostValue;

    #[test]
    fn records_resumes_in_order() {
        let host = DemoHost::new();
        host.resume(CoroutineId(1), Ok(HostValue::Unit));
        host.resume(CoroutineId(2), Err("boom".to_string()));
        let calls = host.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, CoroutineId(1));
        assert!(calls[1].1.is_err());
    }
}
