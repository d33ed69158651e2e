//! Argv parsing (spec §6 "Runtime CLI"): a single script argument plus the
//! handful of flags that gate runtime behavior, mirrored one-to-one onto
//! [`lunet_runtime::RuntimeConfig`].

use std::path::PathBuf;

use clap::Parser;
use lunet_core::paxe::FailurePolicy;
use lunet_runtime::RuntimeConfig;

#[derive(Parser, Debug)]
#[command(name = "lunet")]
#[command(about = "Lunet embedded async I/O runtime")]
#[command(version)]
pub struct Cli {
    /// Script to run.
    pub script: PathBuf,

    /// Disable the loopback-only bind-address policy. Logs a warning.
    #[arg(long)]
    pub dangerously_skip_loopback_restriction: bool,

    /// Enable per-event diagnostic logging (`tracing::trace!`) in addition
    /// to the counter-only summaries emitted at shutdown.
    #[arg(long)]
    pub verbose_trace: bool,

    /// PAXE decrypt-failure handling: drop silently, log the first
    /// occurrence of each reason, or log every occurrence.
    #[arg(long, value_parser = parse_paxe_fail_policy, default_value = "log-once")]
    pub paxe_fail_policy: FailurePolicy,

    /// Arena size in bytes backing the canary allocator.
    #[arg(long, default_value = "1048576")]
    pub arena_size: u32,
}

fn parse_paxe_fail_policy(raw: &str) -> Result<FailurePolicy, String> {
    match raw {
        "drop" => Ok(FailurePolicy::Drop),
        "log-once" => Ok(FailurePolicy::LogOnce),
        "verbose" => Ok(FailurePolicy::Verbose),
        other => Err(format!(
            "unrecognised --paxe-fail-policy value: {other} (expected drop, log-once, or verbose)"
        )),
    }
}

impl Cli {
    /// Build a [`RuntimeConfig`] from the parsed flags.
    pub fn to_runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            skip_loopback_restriction: self.dangerously_skip_loopback_restriction,
            verbose_trace: self.verbose_trace,
            paxe_fail_policy: self.paxe_fail_policy,
            ..RuntimeConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_bare_script_path_with_defaults() {
        let cli = Cli::parse_from(["lunet", "script.lua"]);
        assert_eq!(cli.script, PathBuf::from("script.lua"));
        assert!(!cli.dangerously_skip_loopback_restriction);
        assert!(!cli.verbose_trace);
        assert!(matches!(cli.paxe_fail_policy, FailurePolicy::LogOnce));
    }

    #[test]
    fn parses_every_flag() {
        let cli = Cli::parse_from([
            "lunet",
            "--dangerously-skip-loopback-restriction",
            "--verbose-trace",
            "--paxe-fail-policy",
            "verbose",
            "script.lua",
        ]);
        assert!(cli.dangerously_skip_loopback_restriction);
        assert!(cli.verbose_trace);
        assert!(matches!(cli.paxe_fail_policy, FailurePolicy::Verbose));
    }

    #[test]
    fn rejects_an_unknown_paxe_fail_policy() {
        let result = Cli::try_parse_from(["lunet", "--paxe-fail-policy", "bogus", "script.lua"]);
        assert!(result.is_err());
    }

    #[test]
    fn to_runtime_config_carries_the_flags_through() {
        let cli = Cli::parse_from([
            "lunet",
            "--dangerously-skip-loopback-restriction",
            "script.lua",
        ]);
        let config = cli.to_runtime_config();
        assert!(config.skip_loopback_restriction);
    }
}
