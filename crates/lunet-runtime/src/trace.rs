//! Per-module diagnostic counters (spec ambient "tiered trace counters").
//!
//! Every subsystem that can fail in an expected way (I/O, handle lifecycle,
//! storage unit) keeps a small set of atomic counters here instead of
//! logging every occurrence; `--verbose-trace` switches the accompanying
//! `tracing` calls from `debug!` to `info!` but the counters themselves are
//! always maintained so a shutdown summary can report them regardless of
//! log level.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one subsystem, named after the event they track.
#[derive(Debug, Default)]
pub struct TraceCounters {
    counters: dashmap::DashMap<&'static str, AtomicU64>,
}

impl TraceCounters {
    pub fn new() -> Self {
        TraceCounters {
            counters: dashmap::DashMap::new(),
        }
    }

    pub fn incr(&self, name: &'static str) {
        self.counters
            .entry(name)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, name: &'static str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Snapshot every counter that has been touched at least once, for a
    /// shutdown summary.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        self.counters
            .iter()
            .map(|entry| (*entry.key(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}
