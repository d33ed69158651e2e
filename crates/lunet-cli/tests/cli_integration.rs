//! Integration tests for the `lunet` CLI's config-building path: binary
//! itself isn't exec'd here (no scripting VM to drive it with), but every
//! piece of argv → `RuntimeConfig` → `Runtime` wiring is exercised directly.

use lunet_core::paxe::FailurePolicy;
use lunet_runtime::{Runtime, RuntimeConfig};

#[test]
fn default_runtime_config_requires_loopback_and_logs_once() {
    let config = RuntimeConfig::default();
    assert!(!config.skip_loopback_restriction);
    assert!(matches!(config.paxe_fail_policy, FailurePolicy::LogOnce));

    let runtime = Runtime::new(config, 1 << 16);
    assert!(runtime.is_loopback_allowed("127.0.0.1"));
    assert!(!runtime.is_loopback_allowed("10.0.0.5"));
}

#[test]
fn skip_loopback_restriction_flag_threads_through_to_the_runtime() {
    let config = RuntimeConfig {
        skip_loopback_restriction: true,
        ..RuntimeConfig::default()
    };
    let runtime = Runtime::new(config, 1 << 16);
    assert!(runtime.is_loopback_allowed("10.0.0.5"));
}

#[test]
fn exit_code_defaults_to_zero() {
    let runtime = Runtime::new(RuntimeConfig::default(), 1 << 16);
    assert_eq!(runtime.exit_code(), 0);
    runtime.set_exit_code(7);
    assert_eq!(runtime.exit_code(), 7);
}
