//! Signal primitive: another one-shot suspend/resume operation sharing the
//! timer/connection lifecycle, this time backed by `tokio::signal::unix`
//! rather than a socket or a clock.

use std::sync::Arc;

use lunet_sdk::{CoroutineId, HostContext, HostValue, LunetError};

use crate::coref::CorefId;
use crate::handle::HandleCtx;
use crate::runtime::Runtime;

struct SignalState;

/// A pending signal wait.
pub type SignalCtx = HandleCtx<SignalState>;

/// Parse a signal name (`"SIGINT"`, `"SIGTERM"`, `"SIGHUP"`, `"SIGUSR1"`,
/// `"SIGUSR2"`) into a `tokio::signal::unix::SignalKind`. Unrecognised
/// names are an argument error rather than a platform-number guess (spec's
/// Non-goal: "cross-platform uniformity beyond what the underlying
/// event-loop library offers", so only libuv/tokio's own named set is
/// honoured).
fn parse_signal(name: &str) -> Result<tokio::signal::unix::SignalKind, LunetError> {
    use tokio::signal::unix::SignalKind;
    match name {
        "SIGINT" => Ok(SignalKind::interrupt()),
        "SIGTERM" => Ok(SignalKind::terminate()),
        "SIGHUP" => Ok(SignalKind::hangup()),
        "SIGUSR1" => Ok(SignalKind::user_defined1()),
        "SIGUSR2" => Ok(SignalKind::user_defined2()),
        other => Err(LunetError::ArgumentError(format!(
            "unrecognised signal name: {other}"
        ))),
    }
}

/// Wait for one delivery of `name`, resuming `coroutine` with the signal
/// name once it arrives. Returns the handle id used to `cancel` the wait.
pub fn wait(
    runtime: &Arc<Runtime>,
    host: Arc<dyn HostContext>,
    coroutine: CoroutineId,
    name: &str,
) -> Result<u64, LunetError> {
    let kind = parse_signal(name)?;
    let mut stream = tokio::signal::unix::signal(kind)
        .map_err(|e| LunetError::IoError(format!("signal({name}): {e}")))?;

    let ctx = HandleCtx::new(SignalState);
    let coref = runtime.coref_registry.create(coroutine);
    runtime.alive_set.mark_alive(coroutine);
    let signal_name = name.to_string();
    let handle_id = runtime.signals.insert(ctx.clone());
    let runtime = Arc::clone(runtime);
    tokio::spawn(async move {
        stream.recv().await;
        runtime.signal_trace.incr("signal_fire");
        finish(&runtime, &ctx, host.as_ref(), coref, handle_id, signal_name);
    });
    Ok(handle_id)
}

fn finish(
    runtime: &Runtime,
    ctx: &SignalCtx,
    host: &dyn HostContext,
    coref: CorefId,
    handle_id: u64,
    signal_name: String,
) {
    runtime.signals.remove(handle_id);
    if ctx.is_closing() {
        runtime.coref_registry.release(coref);
        return;
    }
    let coroutine = runtime.coref_registry.release(coref);
    if let Some(coroutine) = coroutine {
        let status = host.resume(coroutine, Ok(HostValue::Text(signal_name)));
        if !status.is_suspended() {
            runtime.alive_set.remove(coroutine);
        }
    }
}

/// Cancel a pending signal wait. Idempotent.
pub fn cancel(ctx: &SignalCtx) {
    ctx.mark_closing();
}
