use thiserror::Error;

/// Errors surfaced by the gossip engine.
///
/// Transport and data errors are always scoped to a single peer, round, or
/// message; only configuration and lifecycle errors are fatal to the caller.
#[derive(Debug, Error)]
pub enum GossipError {
    /// Underlying network I/O failure.
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization or deserialization failure for a wire envelope.
    #[error("envelope serialization error: {0}")]
    Serialization(String),
    /// Envelope exceeded the transport's datagram budget.
    #[error("envelope too large: {0} bytes")]
    MessageTooLarge(usize),
    /// Invalid tunable detected at construction time.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A point-to-point send to one peer failed.
    #[error("send to peer {peer} failed: {reason}")]
    SendFailed {
        /// Peer the envelope was addressed to.
        peer: String,
        /// Human-readable cause.
        reason: String,
    },
    /// The transport has no route for the addressed peer.
    #[error("no route to peer {0}")]
    UnknownPeer(String),
    /// Requested lifecycle transition is not legal from the current state.
    #[error("invalid lifecycle transition: {from} -> {to}")]
    InvalidLifecycle {
        /// State the coordinator was in.
        from: &'static str,
        /// State the caller asked for.
        to: &'static str,
    },
    /// A subcomponent failed while the coordinator was starting.
    #[error("startup failed: {0}")]
    Startup(String),
}
