//! Collaborator seams around the admission path.
//!
//! The admission queue never parses frames, verifies signatures itself, or
//! tracks connection tables; it consumes those capabilities through the
//! narrow traits here. Implementations live with the session runtime.

use std::sync::Arc;

use crate::packet::{Identity, Packet};

/// An open connection produced from an admitted SYN.
///
/// The substrate has no three-way handshake, so admission fully opens the
/// connection; this record carries what the acceptor and its callers need.
pub struct Connection {
    remote: Identity,
    send_stream_id: u32,
    receive_stream_id: u32,
    created_at_ms: u64,
}

impl Connection {
    /// New connection record.
    pub fn new(
        remote: Identity,
        send_stream_id: u32,
        receive_stream_id: u32,
        created_at_ms: u64,
    ) -> Self {
        Self {
            remote,
            send_stream_id,
            receive_stream_id,
            created_at_ms,
        }
    }

    /// Identity of the remote peer.
    pub fn remote_peer(&self) -> Identity {
        self.remote
    }

    /// Stream id we send under.
    pub fn send_stream_id(&self) -> u32 {
        self.send_stream_id
    }

    /// Stream id the remote sends under.
    pub fn receive_stream_id(&self) -> u32 {
        self.receive_stream_id
    }

    /// Clock reading at creation.
    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }
}

/// Connection bookkeeping consumed by the admission queue.
pub trait ConnectionManager: Send + Sync {
    /// Build a connection from an admitted SYN. Forged or otherwise
    /// unacceptable SYNs come back as `Err` so the caller can release the
    /// payload exactly once.
    fn receive_connection(&self, syn: Packet) -> Result<Arc<Connection>, Packet>;

    /// Look up a live connection by the stream id the remote assigned.
    fn connection_by_outbound_id(&self, id: u32) -> Option<Arc<Connection>>;

    /// Hand a queued non-SYN packet straight to its connection's handler.
    /// Must not requeue into admission.
    fn receive_packet_direct(&self, packet: Packet);

    /// Queue an outbound packet for transmission. One shot, no retries.
    fn enqueue_outbound(&self, packet: Packet);

    /// Identity of the local session, used as the sender of resets.
    fn local_identity(&self) -> Identity;
}

/// Signature verification seam.
pub trait PacketCodec: Send + Sync {
    /// Whether `packet`'s signature verifies against `claimed_sender`.
    fn verify_signature(&self, packet: &Packet, claimed_sender: &Identity) -> bool;
}
