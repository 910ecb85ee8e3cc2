use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::convergence::ConvergenceIssue;
use crate::directory::{PeerRecord, RemovalReason};
use crate::rumor::MessageId;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One-way notifications surfaced to the application layer.
///
/// Replaces the reference design's string-keyed emitter with one typed
/// channel; the engine never consumes a return value from a subscriber.
#[derive(Debug, Clone)]
pub enum GossipEvent {
    /// A new (non-duplicate) message reached this node.
    MessageReceived {
        /// Message identifier.
        id: MessageId,
        /// Application payload.
        payload: Value,
        /// Node that originated the message.
        origin: String,
        /// Immediate sender that relayed it to us.
        sender: String,
    },
    /// A peer was added to the directory.
    PeerJoined {
        /// The freshly added record.
        peer: PeerRecord,
    },
    /// A peer was removed from the directory.
    PeerLeft {
        /// Removed peer id.
        peer_id: String,
        /// Why the peer was removed.
        reason: RemovalReason,
    },
    /// The failure detector declared a peer failed.
    PeerFailed {
        /// Failed peer id.
        peer_id: String,
        /// Phi value at the final check.
        phi: f64,
    },
    /// A suspected peer sent a heartbeat and was cleared.
    PeerRecovered {
        /// Recovered peer id.
        peer_id: String,
    },
    /// A tracked message crossed the convergence threshold.
    ConvergenceAchieved {
        /// Message identifier.
        id: MessageId,
        /// Time from first sighting to convergence.
        elapsed: Duration,
        /// Fraction of live nodes reached when the threshold was crossed.
        coverage: f64,
    },
    /// A tracked message exceeded the convergence deadline without
    /// converging.
    ConvergenceLost {
        /// Message identifier.
        id: MessageId,
    },
    /// An anti-entropy round applied remote entries.
    StateSynchronized {
        /// Peer the entries came from.
        peer_id: String,
        /// Number of entries that changed local state.
        entries_applied: usize,
    },
    /// Advisory operational signal from the convergence tracker.
    ConvergenceIssue {
        /// The flagged condition.
        issue: ConvergenceIssue,
    },
}

/// Broadcast fan-out for [`GossipEvent`] notifications.
///
/// Sends never block and are dropped when no subscriber is attached; slow
/// subscribers observe a lagged receiver rather than backpressuring the
/// engine.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GossipEvent>,
}

impl EventBus {
    /// Create a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GossipEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: GossipEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
