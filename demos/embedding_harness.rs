//! A small standalone example showing how a scripting host embeds Lunet:
//! implement [`HostContext`], build a [`Runtime`], submit a couple of
//! primitives, and observe the completions come back.
//!
//! Run with `cargo run -p lunet-cli --example embedding_harness`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lunet_runtime::{timer, Runtime, RuntimeConfig};
use lunet_sdk::{Completion, CoroutineId, HostContext, ResumeStatus};

/// A toy host that hands out sequential coroutine ids and just prints
/// whatever it's resumed with. A real embedder would instead resume an
/// actual VM coroutine/fiber here.
struct PrintingHost {
    next_id: AtomicU64,
}

impl PrintingHost {
    fn new() -> Self {
        PrintingHost {
            next_id: AtomicU64::new(1),
        }
    }

    fn next_coroutine(&self) -> CoroutineId {
        CoroutineId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl HostContext for PrintingHost {
    fn resume(&self, id: CoroutineId, completion: Completion) -> ResumeStatus {
        match completion {
            Ok(value) => println!("{id} resumed with {value:?}"),
            Err(message) => println!("{id} resumed with error: {message}"),
        }
        ResumeStatus::Completed
    }
}

#[tokio::main]
async fn main() {
    let runtime = Arc::new(Runtime::new(RuntimeConfig::default(), 1 << 20));
    let host = Arc::new(PrintingHost::new());

    // Fire three one-shot timers with different delays; each resumes the
    // host once it fires.
    for delay_ms in [5, 15, 25] {
        let coroutine = host.next_coroutine();
        let host: Arc<dyn HostContext> = host.clone();
        timer::start(&runtime, host, coroutine, delay_ms);
    }

    // Give every spawned timer task a chance to fire before the process
    // exits (a real embedding drives this from its own event loop instead).
    tokio::time::sleep(std::time::Duration::from_millis(60)).await;

    runtime.log_shutdown_summary();
}
