use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use tracing::{debug, trace};

use crate::directory::{PeerDirectory, PeerRecord};
use crate::rumor::{MessageId, PullFilter, Rumor};

/// Deduplicating rumor storage with age-based eviction.
///
/// Purging is pure storage hygiene; the reconciliation protocol is the
/// durable-convergence backstop for anything evicted early.
#[derive(Default)]
pub struct RumorStore {
    rumors: DashMap<MessageId, Rumor>,
}

impl RumorStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a rumor, returning `false` when its id is already known.
    pub fn insert(&self, rumor: Rumor) -> bool {
        match self.rumors.entry(rumor.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(rumor);
                true
            }
        }
    }

    /// `true` when the id has been seen and not yet purged.
    #[must_use]
    pub fn contains(&self, id: MessageId) -> bool {
        self.rumors.contains_key(&id)
    }

    /// Stored rumor for `id`, if any.
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<Rumor> {
        self.rumors.get(&id).map(|entry| entry.value().clone())
    }

    /// Rumors no older than `max_age`, the push-eligible set.
    #[must_use]
    pub fn recent(&self, max_age: Duration) -> Vec<Rumor> {
        let now_ms = crate::unix_millis();
        self.rumors
            .iter()
            .filter(|entry| entry.value().age(now_ms) <= max_age)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Rumors matching a peer's pull filter.
    #[must_use]
    pub fn matching(&self, filter: &PullFilter) -> Vec<Rumor> {
        self.rumors
            .iter()
            .filter(|entry| {
                let rumor = entry.value();
                match filter {
                    PullFilter::Since { timestamp_ms } => rumor.timestamp_ms >= *timestamp_ms,
                    PullFilter::Pattern { prefix } => rumor.origin.starts_with(prefix.as_str()),
                    PullFilter::MissingIds { ids } => ids.contains(&rumor.id),
                }
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Drop rumors older than `max_age`, returning how many were purged.
    pub fn purge_expired(&self, max_age: Duration) -> usize {
        let now_ms = crate::unix_millis();
        let before = self.rumors.len();
        self.rumors.retain(|_, rumor| rumor.age(now_ms) <= max_age);
        before - self.rumors.len()
    }

    /// Number of stored rumors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rumors.len()
    }

    /// `true` when no rumors are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rumors.is_empty()
    }
}

/// Rumors selected for one peer in a push or forward step.
#[derive(Debug, Clone)]
pub struct PushAssignment {
    /// Peer the batch is addressed to.
    pub peer: PeerRecord,
    /// Rumors re-stamped for this hop.
    pub rumors: Vec<Rumor>,
}

/// Aggregate dissemination counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct DisseminationStats {
    /// Completed gossip rounds.
    pub rounds: u64,
    /// Rumors handed to the transport across all pushes and forwards.
    pub rumors_sent: u64,
    /// Fresh rumors accepted from peers.
    pub rumors_received: u64,
    /// Inbound rumors dropped as duplicates.
    pub duplicates_dropped: u64,
    /// Rumors evicted by age.
    pub rumors_purged: u64,
    /// Rumors currently stored.
    pub stored: usize,
}

/// Push/pull epidemic spread of recently created rumors.
///
/// This type plans rounds and applies the receive path; the coordinator owns
/// the transport and performs the actual sends so that per-peer concurrency
/// and timeouts live in one place.
pub struct Disseminator {
    local_id: String,
    store: RumorStore,
    directory: Arc<PeerDirectory>,
    rng: Mutex<SmallRng>,
    push_fanout: usize,
    pull_fanout: usize,
    max_message_age: Duration,
    max_rumor_age: Duration,
    retransmission_probability: f64,
    rounds: AtomicU64,
    rumors_sent: AtomicU64,
    rumors_received: AtomicU64,
    duplicates_dropped: AtomicU64,
    rumors_purged: AtomicU64,
}

impl Disseminator {
    /// Create the protocol for the local node.
    #[must_use]
    pub fn new(
        local_id: impl Into<String>,
        directory: Arc<PeerDirectory>,
        push_fanout: usize,
        pull_fanout: usize,
        max_message_age: Duration,
        max_rumor_age: Duration,
        retransmission_probability: f64,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            store: RumorStore::new(),
            directory,
            rng: Mutex::new(SmallRng::from_entropy()),
            push_fanout,
            pull_fanout,
            max_message_age,
            max_rumor_age,
            retransmission_probability,
            rounds: AtomicU64::new(0),
            rumors_sent: AtomicU64::new(0),
            rumors_received: AtomicU64::new(0),
            duplicates_dropped: AtomicU64::new(0),
            rumors_purged: AtomicU64::new(0),
        }
    }

    /// Store a locally originated rumor so the next round spreads it.
    ///
    /// Returns `false` when the id was already known (a replayed broadcast).
    pub fn originate(&self, rumor: Rumor) -> bool {
        self.store.insert(rumor)
    }

    /// Plan the push half of a gossip round.
    ///
    /// Up to `push_fanout` healthy peers each receive the recent rumor set,
    /// every rumor included independently with the retransmission
    /// probability. The coin is flipped per message per send, which damps
    /// redundant traffic as a rumor ages through the cluster.
    #[must_use]
    pub fn plan_push(&self) -> Vec<PushAssignment> {
        let recent = self.store.recent(self.max_message_age);
        if recent.is_empty() {
            return Vec::new();
        }

        let peers = self.directory.select_random_peers(self.push_fanout);
        let mut rng = self.rng.lock();
        let assignments: Vec<_> = peers
            .into_iter()
            .filter_map(|peer| {
                let rumors: Vec<_> = recent
                    .iter()
                    .filter(|_| rng.gen_bool(self.retransmission_probability))
                    .map(|rumor| rumor.forwarded_by(&self.local_id))
                    .collect();
                (!rumors.is_empty()).then(|| PushAssignment { peer, rumors })
            })
            .collect();
        drop(rng);

        self.rounds.fetch_add(1, Ordering::Relaxed);
        let sent: usize = assignments.iter().map(|plan| plan.rumors.len()).sum();
        self.rumors_sent.fetch_add(sent as u64, Ordering::Relaxed);
        assignments
    }

    /// Plan the pull half of a gossip round: requests, not data.
    ///
    /// Each selected peer is asked for everything newer than the push
    /// eligibility horizon, which is exactly the window this node may have
    /// missed while partitioned from it.
    #[must_use]
    pub fn plan_pull(&self) -> Vec<(PeerRecord, PullFilter)> {
        let horizon = crate::unix_millis().saturating_sub(self.max_message_age.as_millis() as u64);
        self.directory
            .select_random_peers(self.pull_fanout)
            .into_iter()
            .map(|peer| {
                (
                    peer,
                    PullFilter::Since {
                        timestamp_ms: horizon,
                    },
                )
            })
            .collect()
    }

    /// Answer a peer's pull request from the local store.
    ///
    /// Matches are re-stamped as relayed by this node; serving a pull is a
    /// hop like any other.
    #[must_use]
    pub fn answer_pull(&self, filter: &PullFilter) -> Vec<Rumor> {
        let matched: Vec<_> = self
            .store
            .matching(filter)
            .into_iter()
            .map(|rumor| rumor.forwarded_by(&self.local_id))
            .collect();
        self.rumors_sent
            .fetch_add(matched.len() as u64, Ordering::Relaxed);
        matched
    }

    /// Apply inbound rumors, returning only the ones not seen before.
    ///
    /// Duplicates are counted and dropped; fresh rumors are stored and
    /// handed back so the coordinator can surface them to the application
    /// and plan the infect-and-forward step.
    pub fn receive(&self, rumors: Vec<Rumor>) -> Vec<Rumor> {
        let mut fresh = Vec::new();
        for rumor in rumors {
            if self.store.insert(rumor.clone()) {
                trace!(id = %rumor.id, origin = %rumor.origin, "accepted rumor");
                self.rumors_received.fetch_add(1, Ordering::Relaxed);
                fresh.push(rumor);
            } else {
                self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        fresh
    }

    /// Plan the infect-and-forward step for freshly received rumors.
    ///
    /// The fanout excludes the immediate sender; it already has the rumors
    /// and forwarding them back would only burn bandwidth.
    #[must_use]
    pub fn plan_forward(&self, fresh: &[Rumor], sender: &str) -> Vec<PushAssignment> {
        if fresh.is_empty() {
            return Vec::new();
        }
        let peers = self
            .directory
            .select_random_peers_excluding(self.push_fanout, Some(sender));
        let assignments: Vec<_> = peers
            .into_iter()
            .map(|peer| PushAssignment {
                peer,
                rumors: fresh
                    .iter()
                    .map(|rumor| rumor.forwarded_by(&self.local_id))
                    .collect(),
            })
            .collect();
        let sent: usize = assignments.iter().map(|plan| plan.rumors.len()).sum();
        self.rumors_sent.fetch_add(sent as u64, Ordering::Relaxed);
        assignments
    }

    /// Evict rumors past the configured maximum age.
    pub fn purge_expired(&self) -> usize {
        let purged = self.store.purge_expired(self.max_rumor_age);
        if purged > 0 {
            debug!(purged, "purged expired rumors");
            self.rumors_purged
                .fetch_add(purged as u64, Ordering::Relaxed);
        }
        purged
    }

    /// Read access to the rumor store.
    #[must_use]
    pub const fn store(&self) -> &RumorStore {
        &self.store
    }

    /// Aggregate counters for metrics.
    #[must_use]
    pub fn stats(&self) -> DisseminationStats {
        DisseminationStats {
            rounds: self.rounds.load(Ordering::Relaxed),
            rumors_sent: self.rumors_sent.load(Ordering::Relaxed),
            rumors_received: self.rumors_received.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            rumors_purged: self.rumors_purged.load(Ordering::Relaxed),
            stored: self.store.len(),
        }
    }
}
