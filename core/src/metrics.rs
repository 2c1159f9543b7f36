//! Hooks for per-call statistics.
//!
//! The transport only reports, collection and export belong to the application.

use crate::error::RpcErr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Outcome of a call as seen by the metrics sink
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CallOutcome {
    /// The response carried this `err_code`, 0 for success
    Code(u32),
    /// The call failed without a response
    Err(RpcErr),
}

impl CallOutcome {
    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, CallOutcome::Code(0))
    }
}

/// Receives one record per finished call.
///
/// Called on the hot path, implementations must not block.
pub trait MetricsSink: Send + Sync + 'static {
    fn on_call(&self, cmd: u32, latency: Duration, outcome: CallOutcome);
}

/// Discards every record
#[derive(Default, Clone, Copy, Debug)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    #[inline(always)]
    fn on_call(&self, _cmd: u32, _latency: Duration, _outcome: CallOutcome) {}
}

/// Lock-free counters, enough for tests and for a periodic dump
#[derive(Default, Debug)]
pub struct CallStats {
    calls: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    total_latency_us: AtomicU64,
    max_latency_us: AtomicU64,
}

#[derive(Default, Clone, Copy, Debug, PartialEq)]
pub struct CallStatsSnapshot {
    pub calls: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub avg_latency_us: u64,
    pub max_latency_us: u64,
}

impl CallStats {
    pub fn snapshot(&self) -> CallStatsSnapshot {
        let calls = self.calls.load(Ordering::Relaxed);
        let total = self.total_latency_us.load(Ordering::Relaxed);
        CallStatsSnapshot {
            calls,
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            avg_latency_us: if calls > 0 { total / calls } else { 0 },
            max_latency_us: self.max_latency_us.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for CallStats {
    fn on_call(&self, _cmd: u32, latency: Duration, outcome: CallOutcome) {
        let us = latency.as_micros() as u64;
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us.fetch_add(us, Ordering::Relaxed);
        self.max_latency_us.fetch_max(us, Ordering::Relaxed);
        match outcome {
            CallOutcome::Code(0) => {}
            CallOutcome::Err(RpcErr::Timeout) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
