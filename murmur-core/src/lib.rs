//! Gossip-based replication engine: epidemic dissemination, anti-entropy
//! reconciliation, and phi-accrual failure detection over vector-clocked
//! key/value state.
//!
//! The crate is organised leaf-to-root: [`clock`] and [`rumor`] define the
//! data model, [`directory`]/[`failure`]/[`store`] hold per-node protocol
//! state, [`dissemination`] and [`anti_entropy`] implement the two spread
//! mechanisms, and [`coordinator`] wires everything to an injected
//! [`transport::Transport`] and drives the periodic rounds.

// Safety-focused Clippy lints to prevent unsafe error handling regression
#![warn(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::unimplemented,
    clippy::todo
)]
#![deny(clippy::unwrap_in_result, clippy::panic_in_result_fn)]

pub mod anti_entropy;
pub mod clock;
pub mod config;
pub mod convergence;
pub mod coordinator;
pub mod directory;
pub mod dissemination;
pub mod error;
pub mod event;
pub mod failure;
pub mod merkle;
pub mod metrics;
pub mod rumor;
pub mod store;
pub mod transport;

pub use clock::{CausalOrdering, VectorClock};
pub use config::{ConflictStrategy, GossipConfig};
pub use coordinator::{Coordinator, LifecycleState};
pub use directory::{PeerDirectory, PeerHealth, PeerRecord, RemovalReason};
pub use error::GossipError;
pub use event::{EventBus, GossipEvent};
pub use failure::PhiAccrualDetector;
pub use metrics::CoordinatorMetrics;
pub use rumor::{Envelope, MessageId, PullFilter, Rumor};
pub use store::{MergeOutcome, ReplicatedStore, StateEntry};
pub use transport::{InMemoryNetwork, Transport, UdpTransport};

/// Milliseconds since the Unix epoch, saturating at zero for pre-epoch
/// clocks.
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |elapsed| {
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
        })
}
