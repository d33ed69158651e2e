//! Timer primitive: a one-shot suspend/resume operation with the exact same
//! lifecycle as the connection primitives (coref, closing flag, callback
//! guard), just without a transport underneath — grounded on the timer
//! path `coref_create_raw` is called out from in spec §4.3's contract
//! ("used when the event loop holds the host state but the callee
//! coroutine is not it, as in the timer path").

use std::sync::Arc;
use std::time::Duration;

use lunet_sdk::{CoroutineId, HostContext, HostValue, LunetError};

use crate::handle::HandleCtx;
use crate::runtime::Runtime;

struct TimerState {
    fired: bool,
}

/// A pending one-shot timer.
pub type TimerCtx = HandleCtx<TimerState>;

/// Start a timer that resumes `coroutine` after `delay_ms` milliseconds.
/// Returns the handle id script code uses to `cancel` it before it fires.
pub fn start(
    runtime: &Arc<Runtime>,
    host: Arc<dyn HostContext>,
    coroutine: CoroutineId,
    delay_ms: u64,
) -> u64 {
    let ctx = HandleCtx::new(TimerState { fired: false });
    let id = runtime.timers.insert(ctx.clone());
    let coref = runtime.coref_registry.create(coroutine);
    runtime.alive_set.mark_alive(coroutine);
    let runtime = Arc::clone(runtime);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        runtime.timer_trace.incr("timer_fire");
        finish(&runtime, &ctx, host.as_ref(), coref, id);
    });
    id
}

fn finish(runtime: &Runtime, ctx: &TimerCtx, host: &dyn HostContext, coref: crate::coref::CorefId, id: u64) {
    let fired = ctx.with_data(|state| state.fired = true);
    runtime.timers.remove(id);
    if fired.is_none() || ctx.is_closing() {
        runtime.coref_registry.release(coref);
        return;
    }
    let coroutine = runtime.coref_registry.release(coref);
    if let Some(coroutine) = coroutine {
        let status = host.resume(coroutine, Ok(HostValue::Unit));
        if !status.is_suspended() {
            runtime.alive_set.remove(coroutine);
        }
    }
}

/// Cancel a pending timer. Idempotent; a timer that has already fired is a
/// no-op to cancel.
pub fn cancel(runtime: &Arc<Runtime>, ctx: &TimerCtx) -> Result<(), LunetError> {
    ctx.mark_closing();
    let _ = runtime;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;
    use lunet_sdk::ResumeStatus;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingHost {
        calls: StdMutex<Vec<(CoroutineId, Result<HostValue, String>)>>,
    }

    impl HostContext for RecordingHost {
        fn resume(&self, id: CoroutineId, completion: Result<HostValue, String>) -> ResumeStatus {
            self.calls.lock().unwrap().push((id, completion));
            ResumeStatus::Completed
        }
    }

    #[tokio::test]
    async fn fires_after_the_delay_elapses() {
        let runtime = Arc::new(Runtime::new(RuntimeConfig::default(), 1 << 16));
        let recorder = Arc::new(RecordingHost::default());
        let host: Arc<dyn HostContext> = recorder.clone();

        let id = start(&runtime, host, CoroutineId(1), 5);
        assert_eq!(runtime.timers.len(), 1);
        let _ = id;

        tokio::time::sleep(Duration::from_millis(40)).await;

        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (CoroutineId(1), Ok(HostValue::Unit)));
        assert_eq!(runtime.timers.len(), 0);
    }

    #[tokio::test]
    async fn cancelling_before_fire_suppresses_the_resume() {
        let runtime = Arc::new(Runtime::new(RuntimeConfig::default(), 1 << 16));
        let recorder = Arc::new(RecordingHost::default());
        let host: Arc<dyn HostContext> = recorder.clone();

        let id = start(&runtime, host, CoroutineId(1), 20);
        let ctx = runtime.timers.get(id).unwrap();
        cancel(&runtime, &ctx).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(recorder.calls.lock().unwrap().is_empty());
    }
}
