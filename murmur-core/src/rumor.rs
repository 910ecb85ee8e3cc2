use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::VectorClock;
use crate::merkle::{DigestHash, MerkleSummary};
use crate::store::StateEntry;

/// Collision-resistant 128-bit rumor identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A single disseminated message, stored keyed by id for deduplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rumor {
    /// Unique message identifier.
    pub id: MessageId,
    /// Application payload.
    pub payload: Value,
    /// Node that originated the message.
    pub origin: String,
    /// Last hop that relayed the message to us.
    pub sender: String,
    /// Wall-clock creation time in milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Number of hops the message has travelled.
    pub hops: u32,
    /// Originator's vector clock at creation time.
    pub clock: Option<VectorClock>,
}

impl Rumor {
    /// Construct a locally originated rumor.
    #[must_use]
    pub fn originate(origin: &str, payload: Value, clock: Option<VectorClock>) -> Self {
        Self {
            id: MessageId::random(),
            payload,
            origin: origin.to_string(),
            sender: origin.to_string(),
            timestamp_ms: crate::unix_millis(),
            hops: 0,
            clock,
        }
    }

    /// Age of the rumor relative to `now_ms`, saturating at zero.
    #[must_use]
    pub fn age(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.timestamp_ms))
    }

    /// Copy of this rumor re-stamped for forwarding by `relay`.
    #[must_use]
    pub fn forwarded_by(&self, relay: &str) -> Self {
        let mut forwarded = self.clone();
        forwarded.sender = relay.to_string();
        forwarded.hops += 1;
        forwarded
    }
}

/// Filter carried by a pull request; the receiving side answers with every
/// stored rumor the filter matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PullFilter {
    /// Rumors created at or after the given timestamp.
    Since {
        /// Milliseconds since the Unix epoch.
        timestamp_ms: u64,
    },
    /// Rumors whose origin node id starts with the given prefix.
    Pattern {
        /// Origin id prefix.
        prefix: String,
    },
    /// Specific rumor ids the requester knows it is missing.
    MissingIds {
        /// Requested identifiers.
        ids: Vec<MessageId>,
    },
}

/// Wire messages exchanged between peers.
///
/// Every variant carries the sender id and a snapshot of its vector clock so
/// the receiving coordinator can merge causality before dispatching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Envelope {
    /// Epidemic push of recently created rumors.
    Push {
        /// Sending node.
        from: String,
        /// Sender's vector clock.
        clock: VectorClock,
        /// Rumors selected for this peer.
        rumors: Vec<Rumor>,
    },
    /// Request for rumors matching a filter.
    PullRequest {
        /// Sending node.
        from: String,
        /// Sender's vector clock.
        clock: VectorClock,
        /// What the requester is missing.
        filter: PullFilter,
    },
    /// Answer to a pull request.
    PullResponse {
        /// Sending node.
        from: String,
        /// Sender's vector clock.
        clock: VectorClock,
        /// Matching stored rumors.
        rumors: Vec<Rumor>,
    },
    /// Ask a peer for its state digest.
    DigestRequest {
        /// Sending node.
        from: String,
        /// Sender's vector clock.
        clock: VectorClock,
    },
    /// Root hash of the sender's replicated state.
    DigestResponse {
        /// Sending node.
        from: String,
        /// Sender's vector clock.
        clock: VectorClock,
        /// Merkle root over the sender's state.
        root: DigestHash,
    },
    /// Ask a peer for its full hash tree after a digest mismatch.
    TreeRequest {
        /// Sending node.
        from: String,
        /// Sender's vector clock.
        clock: VectorClock,
    },
    /// Full hash tree enabling a level-by-level divergence walk.
    TreeResponse {
        /// Sending node.
        from: String,
        /// Sender's vector clock.
        clock: VectorClock,
        /// The sender's Merkle summary.
        summary: MerkleSummary,
    },
    /// Request the state entries stored in the given leaf buckets.
    EntriesRequest {
        /// Sending node.
        from: String,
        /// Sender's vector clock.
        clock: VectorClock,
        /// Diverging leaf bucket indices.
        buckets: Vec<u32>,
    },
    /// State entries answering an [`Envelope::EntriesRequest`].
    EntriesResponse {
        /// Sending node.
        from: String,
        /// Sender's vector clock.
        clock: VectorClock,
        /// Entries in the requested buckets.
        entries: Vec<StateEntry>,
    },
}

impl Envelope {
    /// Id of the node that sent this envelope.
    #[must_use]
    pub fn from_node(&self) -> &str {
        match self {
            Self::Push { from, .. }
            | Self::PullRequest { from, .. }
            | Self::PullResponse { from, .. }
            | Self::DigestRequest { from, .. }
            | Self::DigestResponse { from, .. }
            | Self::TreeRequest { from, .. }
            | Self::TreeResponse { from, .. }
            | Self::EntriesRequest { from, .. }
            | Self::EntriesResponse { from, .. } => from,
        }
    }

    /// Sender's vector clock snapshot.
    #[must_use]
    pub fn sender_clock(&self) -> &VectorClock {
        match self {
            Self::Push { clock, .. }
            | Self::PullRequest { clock, .. }
            | Self::PullResponse { clock, .. }
            | Self::DigestRequest { clock, .. }
            | Self::DigestResponse { clock, .. }
            | Self::TreeRequest { clock, .. }
            | Self::TreeResponse { clock, .. }
            | Self::EntriesRequest { clock, .. }
            | Self::EntriesResponse { clock, .. } => clock,
        }
    }

    /// Short label used in logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Push { .. } => "push",
            Self::PullRequest { .. } => "pull-request",
            Self::PullResponse { .. } => "pull-response",
            Self::DigestRequest { .. } => "digest-request",
            Self::DigestResponse { .. } => "digest-response",
            Self::TreeRequest { .. } => "tree-request",
            Self::TreeResponse { .. } => "tree-response",
            Self::EntriesRequest { .. } => "entries-request",
            Self::EntriesResponse { .. } => "entries-response",
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn random_ids_do_not_collide() {
        let a = MessageId::random();
        let b = MessageId::random();
        assert_ne!(a, b);
    }

    #[test]
    fn forwarding_restamps_sender_and_hops() {
        let rumor = Rumor::originate("node-a", json!({"text": "hi"}), None);
        let forwarded = rumor.forwarded_by("node-b");
        assert_eq!(forwarded.id, rumor.id);
        assert_eq!(forwarded.origin, "node-a");
        assert_eq!(forwarded.sender, "node-b");
        assert_eq!(forwarded.hops, 1);
    }

    #[test]
    fn envelope_roundtrips_through_wire_codec() {
        let envelope = Envelope::Push {
            from: "node-a".to_string(),
            clock: VectorClock::new(),
            rumors: vec![Rumor::originate("node-a", json!([1, 2, 3]), None)],
        };
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let decoded: Envelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.from_node(), "node-a");
        assert_eq!(decoded.kind(), "push");
    }
}
