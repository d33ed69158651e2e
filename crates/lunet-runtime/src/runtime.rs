//! The `Runtime`: the single process-wide object owning every table spec
//! §9's "Global state" design note says used to be process-wide globals
//! (coref registry, alive-set, PAXE subsystem, trace counters, config).
//! `lunet-cli` constructs exactly one of these per process.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use lunet_core::{Arena, Backend, CanaryAllocator};
use lunet_core::paxe::{FailurePolicy, Keystore, PaxeDecoder, PaxeEncoder};
use parking_lot::Mutex as ArenaMutex;

use crate::coref::{AliveSet, CorefRegistry};
use crate::net::tcp_unix::{ConnCtx, ListenerCtx};
use crate::net::udp::UdpCtx;
use crate::registry::HandleRegistry;
use crate::signal::SignalCtx;
use crate::timer::TimerCtx;
use crate::trace::TraceCounters;

/// Loopback/PAXE/storage configuration built once at startup, normally by
/// `lunet-cli`'s `clap` parsing (spec §5, §AMBIENT-CONFIG).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// `--dangerously-skip-loopback-restriction`.
    pub skip_loopback_restriction: bool,
    /// `--verbose-trace`.
    pub verbose_trace: bool,
    /// `--paxe-fail-policy`.
    pub paxe_fail_policy: FailurePolicy,
    /// Whether the PAXE subsystem is enabled at all for UDP contexts that
    /// request it.
    pub paxe_enabled: bool,
    /// Accept-queue backlog bound (spec §9 "Queue of pending accepts").
    pub accept_backlog: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            skip_loopback_restriction: false,
            verbose_trace: false,
            paxe_fail_policy: FailurePolicy::LogOnce,
            paxe_enabled: false,
            accept_backlog: 128,
        }
    }
}

/// The process-wide runtime object: every table spec §9 calls out as
/// "global state" lives here as an explicit field instead.
pub struct Runtime {
    pub config: RuntimeConfig,
    pub coref_registry: CorefRegistry,
    pub alive_set: AliveSet,
    pub allocator: CanaryAllocator,
    pub paxe_keystore: Arc<Keystore>,
    pub paxe_decoder: PaxeDecoder,
    pub paxe_encoder: PaxeEncoder,
    pub net_trace: TraceCounters,
    pub timer_trace: TraceCounters,
    pub signal_trace: TraceCounters,
    pub storage_trace: TraceCounters,
    /// Numeric handle tables exposed to the host (spec §9's former global
    /// handle tables, one per resource kind, see [`crate::registry`]).
    pub tcp_listeners: HandleRegistry<ListenerCtx>,
    pub tcp_conns: HandleRegistry<ConnCtx>,
    pub udp_sockets: HandleRegistry<UdpCtx>,
    pub timers: HandleRegistry<TimerCtx>,
    pub signals: HandleRegistry<SignalCtx>,
    exit_code: AtomicI32,
}

impl Runtime {
    /// Build a runtime backed by a fresh arena of `arena_size` bytes for
    /// its canary allocator, and a zeroed PAXE KEK (callers register real
    /// keys via `paxe_keystore` before enabling DEK-mode traffic).
    pub fn new(config: RuntimeConfig, arena_size: u32) -> Self {
        let arena = Arc::new(ArenaMutex::new(Arena::new(arena_size)));
        let allocator = CanaryAllocator::new(Backend::Arena(arena));
        let keystore = Arc::new(Keystore::new());
        let paxe_decoder = PaxeDecoder::new(
            Arc::clone(&keystore),
            [0u8; 32],
            config.paxe_fail_policy,
        );
        let paxe_encoder = PaxeEncoder::new(Arc::clone(&keystore));

        Runtime {
            config,
            coref_registry: CorefRegistry::new(),
            alive_set: AliveSet::new(),
            allocator,
            paxe_keystore: keystore,
            paxe_decoder,
            paxe_encoder,
            net_trace: TraceCounters::new(),
            timer_trace: TraceCounters::new(),
            signal_trace: TraceCounters::new(),
            storage_trace: TraceCounters::new(),
            tcp_listeners: HandleRegistry::new(),
            tcp_conns: HandleRegistry::new(),
            udp_sockets: HandleRegistry::new(),
            timers: HandleRegistry::new(),
            signals: HandleRegistry::new(),
            exit_code: AtomicI32::new(0),
        }
    }

    /// `true` if `host` is one of the addresses that do not require
    /// `--dangerously-skip-loopback-restriction` (spec §5's bind-address
    /// policy).
    pub fn is_loopback_allowed(&self, host: &str) -> bool {
        self.config.skip_loopback_restriction
            || matches!(host, "127.0.0.1" | "::1" | "localhost")
    }

    /// The script-settable process exit code (`__lunet_exit_code` in the
    /// original, spec's "CLI's script-settable process exit code"
    /// supplemented feature).
    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::Relaxed);
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Relaxed)
    }

    /// Emit a shutdown summary across every subsystem's trace counters, the
    /// Rust-native replacement for `lunet_mem_summary`/`lunet_trace_dump`.
    pub fn log_shutdown_summary(&self) {
        let stats = self.allocator.stats();
        tracing::info!(
            alloc_count = stats.alloc_count,
            free_count = stats.free_count,
            live_bytes = stats.live_bytes,
            peak_bytes = stats.peak_bytes,
            "allocator summary"
        );
        for (name, count) in self.net_trace.snapshot() {
            tracing::info!(counter = name, count, "net trace");
        }
        for (name, count) in self.timer_trace.snapshot() {
            tracing::info!(counter = name, count, "timer trace");
        }
        for (name, count) in self.signal_trace.snapshot() {
            tracing::info!(counter = name, count, "signal trace");
        }
        for (name, count) in self.storage_trace.snapshot() {
            tracing::info!(counter = name, count, "storage trace");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_requires_loopback() {
        let config = RuntimeConfig::default();
        let rt = Runtime::new(config, 1 << 16);
        assert!(rt.is_loopback_allowed("127.0.0.1"));
        assert!(rt.is_loopback_allowed("localhost"));
        assert!(!rt.is_loopback_allowed("0.0.0.0"));
    }

    #[test]
    fn skip_loopback_restriction_allows_any_host() {
        let mut config = RuntimeConfig::default();
        config.skip_loopback_restriction = true;
        let rt = Runtime::new(config, 1 << 16);
        assert!(rt.is_loopback_allowed("0.0.0.0"));
    }

    #[test]
    fn exit_code_defaults_to_zero_and_is_settable() {
        let rt = Runtime::new(RuntimeConfig::default(), 1 << 16);
        assert_eq!(rt.exit_code(), 0);
        rt.set_exit_code(3);
        assert_eq!(rt.exit_code(), 3);
    }
}
