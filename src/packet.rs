//! Packet record, flag bitset, and peer identity.
//!
//! A packet here is a tagged record, not a class hierarchy: the poison
//! sentinel that unblocks the admission consumer is an ordinary `Packet`
//! distinguished by a field value that lies outside the legal wire range,
//! so it survives transport through the queue without downcasts and no
//! inbound packet can impersonate it.

use std::fmt;

/// Connection-initiation request.
pub const FLAG_SYNCHRONIZE: u8 = 0x01;
/// Reset, aborting a would-be or existing flow.
pub const FLAG_RESET: u8 = 0x02;
/// The packet carries a sender signature.
pub const FLAG_SIGNATURE_INCLUDED: u8 = 0x04;

/// Largest delay request a remote may legally encode, in milliseconds.
pub const MAX_DELAY_REQUEST: u32 = 65_535;
/// Delay value marking the in-band shutdown sentinel. One past the legal
/// wire range, so it is unforgeable from the outside.
pub const POISON_DELAY: u32 = MAX_DELAY_REQUEST + 1;

/// Remote peer identity: the 32-byte hash of a destination.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity([u8; 32]);

impl Identity {
    /// Build an identity from its raw hash bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self)
    }
}

/// A packet as seen by the admission path.
///
/// Only the fields the core observes are modeled; framing, options, and
/// payload interpretation belong to the collaborators.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Flag bitset (`FLAG_SYNCHRONIZE`, `FLAG_RESET`, ...).
    pub flags: u8,
    /// Stream id the remote chose for traffic it sends.
    pub send_stream_id: u32,
    /// Stream id the remote expects us to use; zero means not yet assigned.
    pub receive_stream_id: u32,
    /// Sequence number within the stream.
    pub sequence_number: u32,
    /// Highest sequence number acknowledged by this packet.
    pub ack_through: u32,
    /// Requested delivery delay in milliseconds, if present.
    /// Legal wire values are `0..=MAX_DELAY_REQUEST`.
    pub optional_delay: Option<u32>,
    /// Sender identity, if the packet carried one.
    pub optional_from: Option<Identity>,
    /// Destination for outbound packets built locally.
    pub to: Option<Identity>,
    /// Detached signature bytes, if `FLAG_SIGNATURE_INCLUDED` is set.
    pub signature: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
}

impl Packet {
    /// New packet with the given flags and everything else empty.
    pub fn new(flags: u8) -> Self {
        Self {
            flags,
            send_stream_id: 0,
            receive_stream_id: 0,
            sequence_number: 0,
            ack_through: 0,
            optional_delay: None,
            optional_from: None,
            to: None,
            signature: None,
            payload: None,
        }
    }

    /// The end-of-queue marker used to wake a blocked consumer on shutdown.
    pub fn poison() -> Self {
        let mut packet = Self::new(0);
        packet.optional_delay = Some(POISON_DELAY);
        packet
    }

    /// Whether this packet is the shutdown sentinel.
    pub fn is_poison(&self) -> bool {
        self.optional_delay == Some(POISON_DELAY)
    }

    /// Whether every bit of `flag` is set.
    pub fn is_flag_set(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }

    /// Set the given flag bits.
    pub fn set_flag(&mut self, flag: u8) {
        self.flags |= flag;
    }

    /// Attach a payload buffer.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Whether a payload buffer is still attached.
    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// Detach and return the payload buffer.
    ///
    /// Whoever ends a packet's life calls this exactly once so the buffer
    /// goes back to its pool; subsequent calls return `None`.
    pub fn release_payload(&mut self) -> Option<Vec<u8>> {
        self.payload.take()
    }
}
