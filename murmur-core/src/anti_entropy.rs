use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::clock::VectorClock;
use crate::directory::{PeerDirectory, PeerRecord};
use crate::event::{EventBus, GossipEvent};
use crate::merkle::{DigestHash, MerkleSummary};
use crate::rumor::Envelope;
use crate::store::{ReplicatedStore, StateEntry};

/// An initiated round that never completed is abandoned after this long so a
/// lost response cannot wedge reconciliation permanently.
const ROUND_TIMEOUT: Duration = Duration::from_secs(30);

struct InFlightRound {
    peer_id: String,
    started: Instant,
}

/// Aggregate reconciliation counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ReconciliationStats {
    /// Rounds this node initiated.
    pub rounds_started: u64,
    /// Rounds that ran to completion (including digest-equal no-ops).
    pub rounds_completed: u64,
    /// Rounds abandoned after a send failure or timeout.
    pub rounds_failed: u64,
    /// Ticks skipped because a round was still outstanding.
    pub rounds_coalesced: u64,
    /// Rounds where digests differed and a tree walk was needed.
    pub digest_mismatches: u64,
    /// Remote entries that changed local state.
    pub entries_applied: u64,
}

/// Digest-based anti-entropy: guarantees eventual consistency even when
/// epidemic spread misses a node entirely.
///
/// One round is a conversation with a single random peer: compare Merkle
/// roots, walk the trees to the diverging leaf buckets, transfer only the
/// entries in those buckets, and merge them through the store's causal
/// path. The coordinator routes the envelopes; this type holds the round
/// state machine and keeps at most one initiated round outstanding.
pub struct Reconciler {
    local_id: String,
    store: Arc<ReplicatedStore>,
    directory: Arc<PeerDirectory>,
    events: EventBus,
    in_flight: Mutex<Option<InFlightRound>>,
    rounds_started: AtomicU64,
    rounds_completed: AtomicU64,
    rounds_failed: AtomicU64,
    rounds_coalesced: AtomicU64,
    digest_mismatches: AtomicU64,
    entries_applied: AtomicU64,
}

impl Reconciler {
    /// Create the protocol for the local node.
    #[must_use]
    pub fn new(
        local_id: impl Into<String>,
        store: Arc<ReplicatedStore>,
        directory: Arc<PeerDirectory>,
        events: EventBus,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            store,
            directory,
            events,
            in_flight: Mutex::new(None),
            rounds_started: AtomicU64::new(0),
            rounds_completed: AtomicU64::new(0),
            rounds_failed: AtomicU64::new(0),
            rounds_coalesced: AtomicU64::new(0),
            digest_mismatches: AtomicU64::new(0),
            entries_applied: AtomicU64::new(0),
        }
    }

    /// Start a round against one random healthy peer.
    ///
    /// Returns the digest request to send, or `None` when no peer is
    /// available or a previous round is still outstanding (the tick is
    /// coalesced, not queued).
    #[must_use]
    pub fn begin_round(&self, clock: VectorClock) -> Option<(PeerRecord, Envelope)> {
        let mut in_flight = self.in_flight.lock();
        if let Some(round) = in_flight.as_ref() {
            if round.started.elapsed() < ROUND_TIMEOUT {
                self.rounds_coalesced.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            warn!(peer = %round.peer_id, "abandoning stalled reconciliation round");
            self.rounds_failed.fetch_add(1, Ordering::Relaxed);
            *in_flight = None;
        }

        let peer = self.directory.select_random_peer()?;
        trace!(peer = %peer.id, "starting reconciliation round");
        *in_flight = Some(InFlightRound {
            peer_id: peer.id.clone(),
            started: Instant::now(),
        });
        drop(in_flight);
        self.rounds_started.fetch_add(1, Ordering::Relaxed);

        let request = Envelope::DigestRequest {
            from: self.local_id.clone(),
            clock,
        };
        Some((peer, request))
    }

    /// Abandon the outstanding round after a failed send.
    ///
    /// The next scheduled tick retries with a (possibly different) random
    /// peer.
    pub fn abort_round(&self, peer_id: &str) {
        let mut in_flight = self.in_flight.lock();
        if in_flight
            .as_ref()
            .is_some_and(|round| round.peer_id == peer_id)
        {
            *in_flight = None;
            self.rounds_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Serve a digest request with the local Merkle root.
    #[must_use]
    pub fn digest_response(&self, clock: VectorClock) -> Envelope {
        Envelope::DigestResponse {
            from: self.local_id.clone(),
            clock,
            root: self.store.digest().root(),
        }
    }

    /// Serve a tree request with the full local hash tree.
    #[must_use]
    pub fn tree_response(&self, clock: VectorClock) -> Envelope {
        Envelope::TreeResponse {
            from: self.local_id.clone(),
            clock,
            summary: self.store.digest(),
        }
    }

    /// Serve an entries request with the contents of the named buckets.
    #[must_use]
    pub fn entries_response(&self, buckets: &[u32], clock: VectorClock) -> Envelope {
        Envelope::EntriesResponse {
            from: self.local_id.clone(),
            clock,
            entries: self.store.entries_in_buckets(buckets),
        }
    }

    /// Continue the round after the peer reported its root hash.
    ///
    /// Equal digests complete the round as a no-op; otherwise the peer's
    /// full tree is requested for the divergence walk.
    #[must_use]
    pub fn on_digest_response(
        &self,
        from: &str,
        root: DigestHash,
        clock: VectorClock,
    ) -> Option<Envelope> {
        self.check_round_peer(from)?;
        if self.store.digest().root() == root {
            trace!(peer = %from, "digests match, round complete");
            self.complete_round();
            return None;
        }
        self.digest_mismatches.fetch_add(1, Ordering::Relaxed);
        Some(Envelope::TreeRequest {
            from: self.local_id.clone(),
            clock,
        })
    }

    /// Continue the round after the peer supplied its hash tree.
    #[must_use]
    pub fn on_tree_response(
        &self,
        from: &str,
        summary: &MerkleSummary,
        clock: VectorClock,
    ) -> Option<Envelope> {
        self.check_round_peer(from)?;
        let diverging = self.store.digest().diverging_leaves(summary);
        if diverging.is_empty() {
            // The stores converged between the digest exchange and now.
            self.complete_round();
            return None;
        }
        debug!(peer = %from, buckets = diverging.len(), "requesting diverging buckets");
        Some(Envelope::EntriesRequest {
            from: self.local_id.clone(),
            clock,
            buckets: diverging,
        })
    }

    /// Finish the round by merging the transferred entries.
    ///
    /// Every entry goes through the same causal-conflict path as a local
    /// write; the number of entries that changed local state is returned.
    pub fn on_entries_response(&self, from: &str, entries: Vec<StateEntry>) -> usize {
        if self.check_round_peer(from).is_none() {
            return 0;
        }
        let applied = entries
            .into_iter()
            .filter(|entry| self.store.merge_remote(entry.clone()).changed_state())
            .count();
        self.entries_applied
            .fetch_add(applied as u64, Ordering::Relaxed);
        self.complete_round();

        if applied > 0 {
            debug!(peer = %from, applied, "reconciliation applied remote entries");
            self.events.emit(GossipEvent::StateSynchronized {
                peer_id: from.to_string(),
                entries_applied: applied,
            });
        }
        applied
    }

    /// `true` while an initiated round is outstanding.
    #[must_use]
    pub fn round_in_flight(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// Aggregate counters for metrics.
    #[must_use]
    pub fn stats(&self) -> ReconciliationStats {
        ReconciliationStats {
            rounds_started: self.rounds_started.load(Ordering::Relaxed),
            rounds_completed: self.rounds_completed.load(Ordering::Relaxed),
            rounds_failed: self.rounds_failed.load(Ordering::Relaxed),
            rounds_coalesced: self.rounds_coalesced.load(Ordering::Relaxed),
            digest_mismatches: self.digest_mismatches.load(Ordering::Relaxed),
            entries_applied: self.entries_applied.load(Ordering::Relaxed),
        }
    }

    /// Responses from anyone but the round's peer are stale and ignored.
    fn check_round_peer(&self, from: &str) -> Option<()> {
        self.in_flight
            .lock()
            .as_ref()
            .filter(|round| round.peer_id == from)
            .map(|_| ())
    }

    fn complete_round(&self) {
        *self.in_flight.lock() = None;
        self.rounds_completed.fetch_add(1, Ordering::Relaxed);
    }
}
