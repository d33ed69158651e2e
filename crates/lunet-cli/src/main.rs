//! `lunet` — the command-line driver for the Lunet runtime (spec §6
//! "Runtime CLI").
//!
//! The scripting language's own C API and argv parser are out of scope
//! (spec §1's Non-goals); what lives here is the ambient slice the spec
//! calls out explicitly: the flags that gate runtime behavior, building a
//! [`RuntimeConfig`]/[`Runtime`] from them, and the script-settable exit
//! code at shutdown.

mod config;
mod demo_host;

use std::sync::Arc;

use clap::Parser;
use config::Cli;
use lunet_runtime::Runtime;

fn init_tracing(verbose: bool) {
    let filter = if verbose { "trace" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose_trace);

    if cli.dangerously_skip_loopback_restriction {
        tracing::warn!("loopback bind-address restriction disabled via CLI flag");
    }

    if !cli.script.exists() {
        anyhow::bail!("script not found: {}", cli.script.display());
    }

    let config = cli.to_runtime_config();
    let runtime = Arc::new(Runtime::new(config, cli.arena_size));

    // The scripting VM that would actually execute `cli.script` is outside
    // this crate's scope; `DemoHost` stands in as a smoke-test host so the
    // runtime's lifecycle (startup, shutdown summary, exit code) can still
    // be exercised end to end from this binary. See `demos/` for a fuller
    // embedding example.
    let host = Arc::new(demo_host::DemoHost::new());
    tracing::info!(script = %cli.script.display(), "lunet runtime started");
    let _ = host;

    runtime.log_shutdown_summary();
    let code = runtime.exit_code();
    std::process::exit(code);
}
