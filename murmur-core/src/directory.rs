use std::net::SocketAddr;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::{SeedableRng, rngs::SmallRng};
use tracing::{debug, warn};

use crate::event::{EventBus, GossipEvent};

/// Liveness classification derived from elapsed time since last contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerHealth {
    /// Contacted recently; eligible for gossip selection.
    Healthy,
    /// Past 70% of the peer timeout without contact.
    Suspicious,
    /// Past the full peer timeout; queued for eviction.
    Failed,
}

/// Why a peer was removed from the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Health check found the peer silent past the timeout.
    Timeout,
    /// Directory exceeded `max_peers` and dropped its oldest record.
    Eviction,
    /// The failure detector declared the peer failed.
    Failed,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Timeout => "timeout",
            Self::Eviction => "eviction",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Directory record for one known peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Stable peer identifier.
    pub id: String,
    /// Transport address the peer is reachable at.
    pub addr: SocketAddr,
    /// Current liveness classification.
    pub health: PeerHealth,
    /// When the peer entered the directory.
    pub added_at: Instant,
    /// Last successful communication in either direction.
    pub last_seen: Instant,
}

impl PeerRecord {
    /// Create a fresh healthy record.
    #[must_use]
    pub fn new(id: impl Into<String>, addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            addr,
            health: PeerHealth::Healthy,
            added_at: now,
            last_seen: now,
        }
    }
}

/// Aggregate directory counts for diagnostics.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct DirectoryStats {
    /// Peers currently classified healthy.
    pub healthy: usize,
    /// Peers currently classified suspicious.
    pub suspicious: usize,
    /// Total tracked peers.
    pub total: usize,
}

/// Membership bookkeeping: peer records, random selection, and liveness.
///
/// No lookup ever raises a hard error; unknown peer ids are no-ops.
pub struct PeerDirectory {
    local_id: String,
    peers: DashMap<String, PeerRecord>,
    rng: Mutex<SmallRng>,
    peer_timeout: std::time::Duration,
    max_peers: usize,
    min_peers: usize,
    events: EventBus,
}

impl PeerDirectory {
    /// Create a directory for the local node.
    #[must_use]
    pub fn new(
        local_id: impl Into<String>,
        peer_timeout: std::time::Duration,
        max_peers: usize,
        min_peers: usize,
        events: EventBus,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            peers: DashMap::new(),
            rng: Mutex::new(SmallRng::from_entropy()),
            peer_timeout,
            max_peers,
            min_peers,
            events,
        }
    }

    /// Add a peer, returning `false` when it was the local node or already
    /// known.
    pub fn add_peer(&self, id: impl Into<String>, addr: SocketAddr) -> bool {
        let id = id.into();
        if id == self.local_id || self.peers.contains_key(&id) {
            return false;
        }

        let record = PeerRecord::new(id.clone(), addr);
        debug!(peer = %id, %addr, "peer joined");
        self.peers.insert(id, record.clone());
        self.events.emit(GossipEvent::PeerJoined { peer: record });
        self.enforce_capacity();
        true
    }

    /// Remove a peer, returning its record when it existed.
    pub fn remove_peer(&self, id: &str, reason: RemovalReason) -> Option<PeerRecord> {
        let (_, record) = self.peers.remove(id)?;
        debug!(peer = %id, %reason, "peer removed");
        self.events.emit(GossipEvent::PeerLeft {
            peer_id: id.to_string(),
            reason,
        });
        if self.peers.len() < self.min_peers {
            warn!(
                peers = self.peers.len(),
                minimum = self.min_peers,
                "peer count below configured minimum"
            );
        }
        Some(record)
    }

    /// Refresh `last_seen` after a successful communication. Unknown ids are
    /// ignored.
    pub fn mark_alive(&self, id: &str) {
        if let Some(mut entry) = self.peers.get_mut(id) {
            let record = entry.value_mut();
            record.last_seen = Instant::now();
            record.health = PeerHealth::Healthy;
        }
    }

    /// Record for `id`, if known.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<PeerRecord> {
        self.peers.get(id).map(|entry| entry.value().clone())
    }

    /// Sample up to `n` healthy peers without replacement.
    #[must_use]
    pub fn select_random_peers(&self, n: usize) -> Vec<PeerRecord> {
        self.select_random_peers_excluding(n, None)
    }

    /// Sample up to `n` healthy peers, skipping `exclude` when given.
    #[must_use]
    pub fn select_random_peers_excluding(&self, n: usize, exclude: Option<&str>) -> Vec<PeerRecord> {
        let mut candidates: Vec<_> = self
            .peers
            .iter()
            .filter(|entry| entry.value().health == PeerHealth::Healthy)
            .filter(|entry| exclude != Some(entry.key().as_str()))
            .map(|entry| entry.value().clone())
            .collect();

        let mut rng = self.rng.lock();
        candidates.shuffle(&mut *rng);
        drop(rng);
        candidates.truncate(n);
        candidates
    }

    /// One random healthy peer, when any exists.
    #[must_use]
    pub fn select_random_peer(&self) -> Option<PeerRecord> {
        self.select_random_peers(1).into_iter().next()
    }

    /// Classify every peer by elapsed silence and evict those past the
    /// timeout.
    pub fn check_health(&self) {
        let now = Instant::now();
        let suspicious_after = self.peer_timeout.mul_f64(0.7);
        let mut expired = Vec::new();

        for mut entry in self.peers.iter_mut() {
            let record = entry.value_mut();
            let silence = now.saturating_duration_since(record.last_seen);
            if silence > self.peer_timeout {
                record.health = PeerHealth::Failed;
                expired.push(record.id.clone());
            } else if silence > suspicious_after {
                record.health = PeerHealth::Suspicious;
            } else {
                record.health = PeerHealth::Healthy;
            }
        }

        for id in expired {
            self.remove_peer(&id, RemovalReason::Timeout);
        }
    }

    /// Aggregate counts for metrics.
    #[must_use]
    pub fn stats(&self) -> DirectoryStats {
        let mut stats = DirectoryStats::default();
        for entry in &self.peers {
            stats.total += 1;
            match entry.value().health {
                PeerHealth::Healthy => stats.healthy += 1,
                PeerHealth::Suspicious => stats.suspicious += 1,
                PeerHealth::Failed => {}
            }
        }
        stats
    }

    /// Clones of every tracked record, for diagnostics.
    #[must_use]
    pub fn snapshots(&self) -> Vec<PeerRecord> {
        self.peers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of tracked peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// `true` when no peers are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Live cluster size estimate: healthy peers plus the local node.
    #[must_use]
    pub fn estimated_cluster_size(&self) -> usize {
        self.stats().healthy + 1
    }

    fn enforce_capacity(&self) {
        while self.peers.len() > self.max_peers {
            let oldest = self
                .peers
                .iter()
                .min_by_key(|entry| entry.value().added_at)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(id) => {
                    self.remove_peer(&id, RemovalReason::Eviction);
                }
                None => break,
            }
        }
    }
}
