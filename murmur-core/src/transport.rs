use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::trace;

use crate::directory::PeerRecord;
use crate::error::GossipError;
use crate::rumor::Envelope;

/// Largest encoded envelope a single datagram may carry; stays under the
/// 64 KiB UDP payload limit with headroom for headers.
const DEFAULT_MAX_PACKET_SIZE: usize = 60_000;

/// Point-to-point envelope delivery: at-most-once, no ordering guarantee.
///
/// Implementations receive the full peer record so they can route either by
/// id (in-process hubs) or by address (real sockets) without keeping their
/// own copy of the directory.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one envelope to the peer, or fail for this peer only.
    async fn send(&self, peer: &PeerRecord, envelope: Envelope) -> Result<(), GossipError>;
}

/// Convenience trait-object alias for dynamic dispatch.
pub type SharedTransport = Arc<dyn Transport>;

/// UDP transport carrying JSON-encoded envelopes with a datagram size guard.
///
/// Envelopes embed self-describing JSON payloads, so the wire codec must be
/// self-describing too; serde_json is used end-to-end rather than a binary
/// format that cannot drive `deserialize_any`.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    max_packet_size: usize,
}

impl UdpTransport {
    /// Bind a UDP socket for gossip traffic.
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self, GossipError> {
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        })
    }

    /// Returns the socket address assigned to the underlying UDP socket.
    pub fn local_addr(&self) -> Result<SocketAddr, GossipError> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive the next envelope from the socket.
    pub async fn recv(&self) -> Result<(Envelope, SocketAddr), GossipError> {
        let mut buf = vec![0u8; self.max_packet_size];
        let (len, addr) = self.socket.recv_from(&mut buf).await?;
        let envelope = serde_json::from_slice(&buf[..len])
            .map_err(|err| GossipError::Serialization(err.to_string()))?;
        Ok((envelope, addr))
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, peer: &PeerRecord, envelope: Envelope) -> Result<(), GossipError> {
        let payload = serde_json::to_vec(&envelope)
            .map_err(|err| GossipError::Serialization(err.to_string()))?;
        if payload.len() > self.max_packet_size {
            return Err(GossipError::MessageTooLarge(payload.len()));
        }
        self.socket.send_to(&payload, peer.addr).await?;
        Ok(())
    }
}

/// In-process hub routing envelopes between simulated nodes by peer id.
///
/// Used by the integration tests and the cluster simulator; production
/// deployments inject [`UdpTransport`] instead.
#[derive(Default)]
pub struct InMemoryNetwork {
    inboxes: DashMap<String, mpsc::UnboundedSender<Envelope>>,
}

impl InMemoryNetwork {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node, returning the stream of envelopes addressed to it.
    ///
    /// Re-registering an id replaces the previous inbox, which then reads
    /// as disconnected.
    pub fn register(self: &Arc<Self>, node_id: impl Into<String>) -> InMemoryNode {
        let node_id = node_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(node_id.clone(), tx);
        InMemoryNode {
            transport: Arc::new(InMemoryTransport {
                network: Arc::clone(self),
                local_id: node_id,
            }),
            inbox: rx,
        }
    }

    /// Drop a node's inbox; subsequent sends to it fail.
    pub fn disconnect(&self, node_id: &str) {
        self.inboxes.remove(node_id);
    }

    fn route(&self, peer_id: &str, envelope: Envelope) -> Result<(), GossipError> {
        let Some(inbox) = self.inboxes.get(peer_id) else {
            return Err(GossipError::UnknownPeer(peer_id.to_string()));
        };
        inbox
            .send(envelope)
            .map_err(|_| GossipError::SendFailed {
                peer: peer_id.to_string(),
                reason: "receiver dropped".to_string(),
            })
    }
}

/// One registered node's handle on the in-memory network.
pub struct InMemoryNode {
    /// Transport to inject into the node's coordinator.
    pub transport: Arc<InMemoryTransport>,
    /// Envelopes addressed to this node.
    pub inbox: mpsc::UnboundedReceiver<Envelope>,
}

/// [`Transport`] implementation backed by an [`InMemoryNetwork`].
pub struct InMemoryTransport {
    network: Arc<InMemoryNetwork>,
    local_id: String,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, peer: &PeerRecord, envelope: Envelope) -> Result<(), GossipError> {
        trace!(from = %self.local_id, to = %peer.id, kind = envelope.kind(), "routing envelope");
        self.network.route(&peer.id, envelope)
    }
}
