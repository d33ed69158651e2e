//! Error taxonomy for the Lunet runtime (spec §7).

/// Errors raised by the Lunet runtime.
///
/// Each variant corresponds to one row of the error taxonomy: invariant
/// violations are internal bugs surfaced for diagnostics, the rest are
/// expected conditions that cross the `(result, error)` completion boundary
/// as their [`std::fmt::Display`] string.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LunetError {
    /// A canary mismatch, refcount underflow, or closed-handle reuse was
    /// observed. Indicates a bug in the runtime or a use-after-free from a
    /// misbehaving caller, never an expected user-facing condition.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A caller supplied a malformed or out-of-range argument.
    #[error("argument error: {0}")]
    ArgumentError(String),

    /// A resource limit was hit (allocation failure, full queue, path too
    /// long).
    #[error("resource error: {0}")]
    ResourceError(String),

    /// The underlying event loop operation failed.
    #[error("I/O error: {0}")]
    IoError(String),

    /// A wire-format or protocol-level check failed (PAXE auth failure,
    /// length mismatch).
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The operation raced a close/shutdown of its owning handle.
    #[error("lifecycle error: {0}")]
    LifecycleError(String),
}

impl From<std::io::Error> for LunetError {
    fn from(e: std::io::Error) -> Self {
        LunetError::IoError(e.to_string())
    }
}

impl LunetError {
    /// True for errors that must never be returned to script code verbatim
    /// (e.g. PAXE decrypt failures, to avoid a decryption oracle). Callers
    /// at the protocol boundary should replace these with a generic message.
    pub fn is_oracle_sensitive(&self) -> bool {
        matches!(self, LunetError::ProtocolError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_taxonomy_row() {
        let e = LunetError::ArgumentError("bad port".into());
        assert_eq!(e.to_string(), "argument error: bad port");
    }

    #[test]
    fn protocol_errors_are_oracle_sensitive() {
        assert!(LunetError::ProtocolError("auth failed".into()).is_oracle_sensitive());
        assert!(!LunetError::IoError("eof".into()).is_oracle_sensitive());
    }

    #[test]
    fn io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let e: LunetError = io.into();
        assert!(matches!(e, LunetError::IoError(_)));
    }
}
