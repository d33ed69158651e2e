//! Connection primitives: TCP/Unix (spec §4.5) and UDP (spec §4.6).

pub mod tcp_unix;
pub mod udp;

use lunet_sdk::LunetError;

use crate::runtime::Runtime;

/// Shared bind-address and port-range policy for both TCP and UDP (spec
/// §5's "Bind-address policy").
pub fn validate_bind(runtime: &Runtime, host: &str, port: u16) -> Result<(), LunetError> {
    if port == 0 {
        return Err(LunetError::ArgumentError("port must be in [1, 65535]".into()));
    }
    if !runtime.is_loopback_allowed(host) {
        return Err(LunetError::ArgumentError(format!(
            "host {host} is not a loopback address; pass --dangerously-skip-loopback-restriction to allow it"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;

    #[test]
    fn rejects_non_loopback_host_by_default() {
        let rt = Runtime::new(RuntimeConfig::default(), 1 << 16);
        assert!(validate_bind(&rt, "0.0.0.0", 8080).is_err());
    }

    #[test]
    fn accepts_loopback_host() {
        let rt = Runtime::new(RuntimeConfig::default(), 1 << 16);
        assert!(validate_bind(&rt, "127.0.0.1", 8080).is_ok());
    }

    #[test]
    fn rejects_port_zero() {
        let rt = Runtime::new(RuntimeConfig::default(), 1 << 16);
        assert!(validate_bind(&rt, "127.0.0.1", 0).is_err());
    }
}
