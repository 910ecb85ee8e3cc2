use std::sync::atomic::{AtomicU64, Ordering};

use crate::anti_entropy::ReconciliationStats;
use crate::convergence::ConvergenceStats;
use crate::directory::DirectoryStats;
use crate::dissemination::DisseminationStats;
use crate::failure::DetectorStats;

/// Counters recorded by the coordinator's inbound/outbound pipeline.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    envelopes_received: AtomicU64,
    envelopes_dropped: AtomicU64,
    sends_attempted: AtomicU64,
    sends_failed: AtomicU64,
    broadcasts: AtomicU64,
}

impl PipelineCounters {
    /// Count one inbound envelope entering the pipeline.
    pub fn record_received(&self) {
        self.envelopes_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one inbound envelope dropped as malformed or unroutable.
    pub fn record_dropped(&self) {
        self.envelopes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one attempted point-to-point send.
    pub fn record_send(&self) {
        self.sends_attempted.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one failed or timed-out send.
    pub fn record_send_failure(&self) {
        self.sends_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one locally originated broadcast.
    pub fn record_broadcast(&self) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            envelopes_received: self.envelopes_received.load(Ordering::Relaxed),
            envelopes_dropped: self.envelopes_dropped.load(Ordering::Relaxed),
            sends_attempted: self.sends_attempted.load(Ordering::Relaxed),
            sends_failed: self.sends_failed.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`PipelineCounters`].
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct PipelineStats {
    /// Envelopes accepted into the inbound pipeline.
    pub envelopes_received: u64,
    /// Envelopes dropped as malformed or unroutable.
    pub envelopes_dropped: u64,
    /// Point-to-point sends attempted.
    pub sends_attempted: u64,
    /// Sends that failed or timed out.
    pub sends_failed: u64,
    /// Locally originated broadcasts.
    pub broadcasts: u64,
}

/// Read-only snapshot across every subcomponent of one node.
///
/// Polled via [`crate::coordinator::Coordinator::metrics`]; nothing here is
/// pushed, and reading never perturbs protocol state.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CoordinatorMetrics {
    /// Coordinator pipeline counters.
    pub pipeline: PipelineStats,
    /// Epidemic dissemination counters.
    pub dissemination: DisseminationStats,
    /// Anti-entropy reconciliation counters.
    pub reconciliation: ReconciliationStats,
    /// Peer directory counts.
    pub directory: DirectoryStats,
    /// Failure detector counts.
    pub detector: DetectorStats,
    /// Convergence tracker statistics.
    pub convergence: ConvergenceStats,
    /// Live entries in the replicated store.
    pub store_entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_into_snapshots() {
        let counters = PipelineCounters::default();
        counters.record_received();
        counters.record_received();
        counters.record_dropped();
        counters.record_send();
        counters.record_send_failure();
        counters.record_broadcast();

        let stats = counters.snapshot();
        assert_eq!(stats.envelopes_received, 2);
        assert_eq!(stats.envelopes_dropped, 1);
        assert_eq!(stats.sends_attempted, 1);
        assert_eq!(stats.sends_failed, 1);
        assert_eq!(stats.broadcasts, 1);
    }

    #[test]
    fn aggregate_snapshot_serializes_for_operators() {
        let metrics = CoordinatorMetrics::default();
        let json = serde_json::to_value(metrics).unwrap_or_default();
        assert!(json.get("pipeline").is_some());
        assert!(json.get("convergence").is_some());
    }
}
