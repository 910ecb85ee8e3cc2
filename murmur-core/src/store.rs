use std::collections::{BTreeMap, HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::clock::{CausalOrdering, VectorClock};
use crate::config::ConflictStrategy;
use crate::merkle::{MerkleSummary, bucket_for_key};

const HISTORY_LIMIT: usize = 100;

/// One versioned value in the replicated key/value state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    /// Key the entry is stored under.
    pub key: String,
    /// Application value.
    pub value: Value,
    /// Node that produced this revision.
    pub node_id: String,
    /// Vector clock snapshot taken when the revision was stamped.
    pub clock: VectorClock,
    /// Wall-clock write time in milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Per-key revision counter.
    pub version: u64,
    /// `true` when this revision was produced by conflict resolution.
    pub conflict_resolved: bool,
    /// Strategy that resolved the conflict, when one did.
    pub resolution_strategy: Option<ConflictStrategy>,
}

/// What [`ReplicatedStore::merge_remote`] did with a remote entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The remote entry causally dominated (or was new) and was stored.
    Applied,
    /// The entries were concurrent; the configured strategy picked a winner.
    Resolved,
    /// The local entry causally dominated; nothing changed.
    Ignored,
}

impl MergeOutcome {
    /// `true` when the merge altered local state.
    #[must_use]
    pub const fn changed_state(self) -> bool {
        !matches!(self, Self::Ignored)
    }
}

struct StoreInner {
    entries: BTreeMap<String, StateEntry>,
    history: HashMap<String, VecDeque<StateEntry>>,
    clock: VectorClock,
}

/// Vector-clocked key/value storage with causal conflict detection.
///
/// Every read-modify-write runs under one lock so the check-existing →
/// resolve-conflict → write sequence is a single atomic unit; interleaving
/// gossip and anti-entropy rounds cannot lose updates.
pub struct ReplicatedStore {
    node_id: String,
    strategy: ConflictStrategy,
    inner: RwLock<StoreInner>,
}

impl ReplicatedStore {
    /// Create an empty store owned by `node_id`.
    #[must_use]
    pub fn new(node_id: impl Into<String>, strategy: ConflictStrategy) -> Self {
        Self {
            node_id: node_id.into(),
            strategy,
            inner: RwLock::new(StoreInner {
                entries: BTreeMap::new(),
                history: HashMap::new(),
                clock: VectorClock::new(),
            }),
        }
    }

    /// Write a value locally, returning the stamped entry.
    ///
    /// The fresh entry carries the just-ticked store clock, which dominates
    /// every entry merged so far, so a local write never conflicts.
    pub fn set(&self, key: &str, value: Value) -> StateEntry {
        let mut inner = self.inner.write();
        inner.clock.tick(&self.node_id);
        let clock = inner.clock.clone();
        let previous = inner.entries.get(key).cloned();
        let version = previous.as_ref().map_or(1, |entry| entry.version + 1);
        let entry = StateEntry {
            key: key.to_string(),
            value,
            node_id: self.node_id.clone(),
            clock,
            timestamp_ms: crate::unix_millis(),
            version,
            conflict_resolved: false,
            resolution_strategy: None,
        };
        if let Some(previous) = previous {
            Self::push_history(&mut inner, previous);
        }
        inner.entries.insert(key.to_string(), entry.clone());
        entry
    }

    /// Current entry for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<StateEntry> {
        self.inner.read().entries.get(key).cloned()
    }

    /// Remove `key`, returning whether an entry existed.
    ///
    /// The clock is ticked even for an absent key so a concurrent re-create
    /// observed later still orders after the delete.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.write();
        inner.clock.tick(&self.node_id);
        if let Some(removed) = inner.entries.remove(key) {
            Self::push_history(&mut inner, removed);
            true
        } else {
            false
        }
    }

    /// Superseded revisions of `key`, oldest first, bounded at 100.
    #[must_use]
    pub fn history(&self, key: &str) -> Vec<StateEntry> {
        self.inner
            .read()
            .history
            .get(key)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Merge an entry received from a remote replica.
    pub fn merge_remote(&self, remote: StateEntry) -> MergeOutcome {
        let mut inner = self.inner.write();
        inner.clock.merge(&remote.clock);

        let Some(local) = inner.entries.get(&remote.key).cloned() else {
            trace!(key = %remote.key, from = %remote.node_id, "adopted remote entry");
            inner.entries.insert(remote.key.clone(), remote);
            return MergeOutcome::Applied;
        };

        match local.clock.compare(&remote.clock) {
            CausalOrdering::Less => {
                inner.entries.insert(remote.key.clone(), remote);
                Self::push_history(&mut inner, local);
                MergeOutcome::Applied
            }
            CausalOrdering::Greater | CausalOrdering::Equal => MergeOutcome::Ignored,
            CausalOrdering::Concurrent => {
                let resolved = resolve_conflict(&local, remote, self.strategy);
                trace!(
                    key = %resolved.key,
                    strategy = %self.strategy,
                    winner = %resolved.node_id,
                    "resolved concurrent write"
                );
                inner.entries.insert(resolved.key.clone(), resolved);
                Self::push_history(&mut inner, local);
                MergeOutcome::Resolved
            }
        }
    }

    /// Merkle summary over the current entries, iterated in key order.
    #[must_use]
    pub fn digest(&self) -> MerkleSummary {
        MerkleSummary::build(self.inner.read().entries.values())
    }

    /// Entries whose keys hash into any of the given leaf buckets.
    #[must_use]
    pub fn entries_in_buckets(&self, buckets: &[u32]) -> Vec<StateEntry> {
        self.inner
            .read()
            .entries
            .values()
            .filter(|entry| buckets.contains(&bucket_for_key(&entry.key)))
            .cloned()
            .collect()
    }

    /// Snapshot of the store's vector clock.
    #[must_use]
    pub fn clock(&self) -> VectorClock {
        self.inner.read().clock.clone()
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// `true` when no entries are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    fn push_history(inner: &mut StoreInner, entry: StateEntry) {
        let history = inner.history.entry(entry.key.clone()).or_default();
        history.push_back(entry);
        if history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
    }
}

/// Pick a deterministic winner between two causally concurrent entries.
///
/// The winner is re-stamped with the pointwise maximum of both clocks so it
/// dominates both inputs; replaying either input afterwards is a no-op and
/// reconciliation rounds stay idempotent.
fn resolve_conflict(
    local: &StateEntry,
    incoming: StateEntry,
    strategy: ConflictStrategy,
) -> StateEntry {
    let mut merged_clock = local.clock.clone();
    merged_clock.merge(&incoming.clock);
    let version = local.version.max(incoming.version);

    let mut winner = match strategy {
        ConflictStrategy::LastWriterWins => last_writer(local, incoming),
        ConflictStrategy::HighestVersion => {
            if incoming.version > local.version {
                incoming
            } else if local.version > incoming.version {
                local.clone()
            } else {
                last_writer(local, incoming)
            }
        }
        ConflictStrategy::NodePriority => {
            if incoming.node_id >= local.node_id {
                incoming
            } else {
                local.clone()
            }
        }
        ConflictStrategy::Merge => structural_merge(local, incoming),
    };

    winner.clock = merged_clock;
    winner.version = version;
    winner.conflict_resolved = true;
    winner.resolution_strategy = Some(strategy);
    winner
}

/// Higher timestamp wins; exact ties go to the lexicographically larger node
/// id. A policy choice kept for determinism, not a correctness claim.
fn last_writer(local: &StateEntry, incoming: StateEntry) -> StateEntry {
    if incoming.timestamp_ms > local.timestamp_ms {
        incoming
    } else if incoming.timestamp_ms < local.timestamp_ms {
        local.clone()
    } else if incoming.node_id >= local.node_id {
        incoming
    } else {
        local.clone()
    }
}

fn structural_merge(local: &StateEntry, incoming: StateEntry) -> StateEntry {
    let merged_value = match (&local.value, &incoming.value) {
        (Value::Object(ours), Value::Object(theirs)) => {
            let mut merged = ours.clone();
            for (key, value) in theirs {
                merged.insert(key.clone(), value.clone());
            }
            Some(Value::Object(merged))
        }
        (Value::Array(ours), Value::Array(theirs)) => {
            let mut merged = ours.clone();
            for value in theirs {
                if !merged.contains(value) {
                    merged.push(value.clone());
                }
            }
            Some(Value::Array(merged))
        }
        (ours, theirs) if !is_structured(ours) && !is_structured(theirs) => Some(theirs.clone()),
        _ => None,
    };

    match merged_value {
        Some(value) => {
            let mut winner = incoming;
            winner.value = value;
            winner
        }
        // Mismatched shapes cannot merge structurally; fall back to
        // last-writer-wins.
        None => last_writer(local, incoming),
    }
}

const fn is_structured(value: &Value) -> bool {
    matches!(value, Value::Object(_) | Value::Array(_))
}
