//! Prometheus metrics (lock-free atomics, zero allocation on hot path).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::RelayError;

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    // --- Traffic ---
    pub requests_total: AtomicU64,
    pub relayed_success: AtomicU64,
    pub chain_rejected: AtomicU64,
    pub malformed: AtomicU64,
    pub pool_exhausted: AtomicU64,
    pub draining_rejected: AtomicU64,
    pub relay_failed: AtomicU64,

    // --- Retry controller ---
    pub retries: AtomicU64,
    pub nonce_refreshes: AtomicU64,
    pub timeouts: AtomicU64,

    // --- Latency (μs, updated via CAS) ---
    pub duration_us_sum: AtomicU64,
    pub duration_us_max: AtomicU64,

    // --- RPC ---
    pub rpc_failovers: AtomicU64,
    pub rpc_errors: AtomicU64,
}

impl Metrics {
    const fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            relayed_success: AtomicU64::new(0),
            chain_rejected: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            pool_exhausted: AtomicU64::new(0),
            draining_rejected: AtomicU64::new(0),
            relay_failed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            nonce_refreshes: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            duration_us_sum: AtomicU64::new(0),
            duration_us_max: AtomicU64::new(0),
            rpc_failovers: AtomicU64::new(0),
            rpc_errors: AtomicU64::new(0),
        }
    }

    /// Count a finished request under its error class.
    pub fn record_error(&self, err: &RelayError) {
        let counter = match err {
            RelayError::MalformedRequest(_) | RelayError::PayloadTooLarge { .. } => &self.malformed,
            RelayError::PoolExhausted => &self.pool_exhausted,
            RelayError::Draining => &self.draining_rejected,
            RelayError::ChainRejected { .. } => &self.chain_rejected,
            RelayError::NonceMismatch(_)
            | RelayError::TransientRpc(_)
            | RelayError::Timeout { .. }
            | RelayError::RelayerUnavailable(_) => &self.relay_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duration(&self, start: Instant) {
        let us = start.elapsed().as_micros() as u64;
        self.duration_us_sum.fetch_add(us, Ordering::Relaxed);
        self.duration_us_max.fetch_max(us, Ordering::Relaxed);
    }

    /// Render in Prometheus text exposition format.
    pub fn render(&self, pool_size: usize, pool_in_flight: usize, ready: bool) -> String {
        let requests = self.requests_total.load(Ordering::Relaxed);
        let success = self.relayed_success.load(Ordering::Relaxed);
        let rejected = self.chain_rejected.load(Ordering::Relaxed);
        let malformed = self.malformed.load(Ordering::Relaxed);
        let exhausted = self.pool_exhausted.load(Ordering::Relaxed);
        let draining = self.draining_rejected.load(Ordering::Relaxed);
        let failed = self.relay_failed.load(Ordering::Relaxed);
        let retries = self.retries.load(Ordering::Relaxed);
        let nonce_refreshes = self.nonce_refreshes.load(Ordering::Relaxed);
        let timeouts = self.timeouts.load(Ordering::Relaxed);
        let dur_sum = self.duration_us_sum.load(Ordering::Relaxed);
        let dur_max = self.duration_us_max.swap(0, Ordering::Relaxed);
        let rpc_failovers = self.rpc_failovers.load(Ordering::Relaxed);
        let rpc_errors = self.rpc_errors.load(Ordering::Relaxed);
        let ready = u8::from(ready);

        // Convert μs to seconds for Prometheus conventions
        let dur_sum_s = dur_sum as f64 / 1_000_000.0;
        let dur_max_s = dur_max as f64 / 1_000_000.0;

        format!(
            "\
# HELP relayer_requests_total Execute requests received.\n\
# TYPE relayer_requests_total counter\n\
relayer_requests_total {requests}\n\
# HELP relayer_relayed_total Requests that landed successfully.\n\
# TYPE relayer_relayed_total counter\n\
relayer_relayed_total {success}\n\
# HELP relayer_chain_rejected_total Requests the contract rejected.\n\
# TYPE relayer_chain_rejected_total counter\n\
relayer_chain_rejected_total {rejected}\n\
# HELP relayer_malformed_total Requests rejected by validation.\n\
# TYPE relayer_malformed_total counter\n\
relayer_malformed_total {malformed}\n\
# HELP relayer_pool_exhausted_total Requests that found no free key in time.\n\
# TYPE relayer_pool_exhausted_total counter\n\
relayer_pool_exhausted_total {exhausted}\n\
# HELP relayer_draining_rejected_total Requests refused while draining.\n\
# TYPE relayer_draining_rejected_total counter\n\
relayer_draining_rejected_total {draining}\n\
# HELP relayer_failed_total Requests that could not reach the chain.\n\
# TYPE relayer_failed_total counter\n\
relayer_failed_total {failed}\n\
# HELP relayer_retries_total Backoff retries.\n\
# TYPE relayer_retries_total counter\n\
relayer_retries_total {retries}\n\
# HELP relayer_nonce_refreshes_total Nonce re-reads after a mismatch.\n\
# TYPE relayer_nonce_refreshes_total counter\n\
relayer_nonce_refreshes_total {nonce_refreshes}\n\
# HELP relayer_timeouts_total Attempts with unknown outcome.\n\
# TYPE relayer_timeouts_total counter\n\
relayer_timeouts_total {timeouts}\n\
# HELP relayer_duration_seconds_sum Total handler time (seconds).\n\
# TYPE relayer_duration_seconds_sum counter\n\
relayer_duration_seconds_sum {dur_sum_s:.6}\n\
# HELP relayer_duration_seconds_max Max handler time since last scrape (seconds).\n\
# TYPE relayer_duration_seconds_max gauge\n\
relayer_duration_seconds_max {dur_max_s:.6}\n\
# HELP relayer_rpc_failovers_total RPC primary-to-fallback failovers.\n\
# TYPE relayer_rpc_failovers_total counter\n\
relayer_rpc_failovers_total {rpc_failovers}\n\
# HELP relayer_rpc_errors_total RPC errors.\n\
# TYPE relayer_rpc_errors_total counter\n\
relayer_rpc_errors_total {rpc_errors}\n\
# HELP relayer_key_pool_size Signing keys in the pool.\n\
# TYPE relayer_key_pool_size gauge\n\
relayer_key_pool_size {pool_size}\n\
# HELP relayer_key_pool_in_flight Keys currently leased.\n\
# TYPE relayer_key_pool_in_flight gauge\n\
relayer_key_pool_in_flight {pool_in_flight}\n\
# HELP relayer_ready Whether the instance passes its readiness probe.\n\
# TYPE relayer_ready gauge\n\
relayer_ready {ready}\n"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_gauges() {
        let m = Metrics::new();
        m.requests_total.fetch_add(3, Ordering::Relaxed);
        m.record_error(&RelayError::PoolExhausted);
        let text = m.render(4, 1, true);
        assert!(text.contains("relayer_requests_total 3\n"));
        assert!(text.contains("relayer_pool_exhausted_total 1\n"));
        assert!(text.contains("relayer_key_pool_size 4\n"));
        assert!(text.contains("relayer_key_pool_in_flight 1\n"));
        assert!(text.contains("relayer_ready 1\n"));
    }

    #[test]
    fn test_max_duration_resets_on_scrape() {
        let m = Metrics::new();
        m.duration_us_max.store(2_500_000, Ordering::Relaxed);
        assert!(m.render(1, 0, false).contains("relayer_duration_seconds_max 2.500000"));
        assert!(m.render(1, 0, false).contains("relayer_duration_seconds_max 0.000000"));
    }
}
