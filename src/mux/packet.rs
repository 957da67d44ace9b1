//! Packet kinds and endpoint roles
//!
//! The two top bits of a header select one of four packet types. Which of
//! the two kinds sharing a type is meant depends on the parity of the stream
//! id, seen from the role of the endpoint receiving the packet.

use super::StreamId;
use bytes::Bytes;
use std::fmt;

/// Endpoint role, fixed by connection-initiation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Endpoint that initiated the connection
    Proactive,
    /// Endpoint that accepted the connection
    Reactive,
}

impl Role {
    /// Role of the other endpoint
    pub fn peer(self) -> Role {
        match self {
            Role::Proactive => Role::Reactive,
            Role::Reactive => Role::Proactive,
        }
    }

    /// Parity class of `id` from this role's point of view
    ///
    /// Even ids are parity 0 for a proactive endpoint, odd ids for a
    /// reactive one.
    pub fn parity(self, id: StreamId) -> Parity {
        let even = id % 2 == 0;
        match (self, even) {
            (Role::Proactive, true) | (Role::Reactive, false) => Parity::Zero,
            _ => Parity::One,
        }
    }

    /// Check if an endpoint with this role writes to `id`
    pub fn writes(self, id: StreamId) -> bool {
        self.parity(id) == Parity::Zero
    }

    /// Check if an endpoint with this role reads from `id`
    pub fn reads(self, id: StreamId) -> bool {
        !self.writes(id)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Proactive => f.write_str("proactive"),
            Role::Reactive => f.write_str("reactive"),
        }
    }
}

/// Role-relative parity of a stream id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    Zero,
    One,
}

/// The eight packet kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Reader grants credit to the writer
    GiveCredit,
    /// Writer sends items
    Write,
    /// Reader caps the credit it will still grant
    StopRead,
    /// Writer caps the items it will still write
    StopWrite,
    /// Reader asks the writer to give back credit above a maximum
    Oops,
    /// Writer gives back unused credit
    ForgoCredit,
    /// Advisory announcement towards the writer
    PromiseWrite,
    /// Advisory announcement towards the reader
    PromiseRead,
}

impl PacketKind {
    /// All packet kinds
    pub const ALL: [PacketKind; 8] = [
        PacketKind::GiveCredit,
        PacketKind::Write,
        PacketKind::StopRead,
        PacketKind::StopWrite,
        PacketKind::Oops,
        PacketKind::ForgoCredit,
        PacketKind::PromiseWrite,
        PacketKind::PromiseRead,
    ];

    /// Resolve a kind from the 2-bit type selector and the id parity
    pub fn from_type(selector: u8, parity: Parity) -> Self {
        match (selector & 0b11, parity) {
            (0b00, Parity::Zero) => PacketKind::GiveCredit,
            (0b00, Parity::One) => PacketKind::Write,
            (0b01, Parity::Zero) => PacketKind::StopRead,
            (0b01, Parity::One) => PacketKind::StopWrite,
            (0b10, Parity::Zero) => PacketKind::Oops,
            (0b10, Parity::One) => PacketKind::ForgoCredit,
            (_, Parity::Zero) => PacketKind::PromiseWrite,
            (_, Parity::One) => PacketKind::PromiseRead,
        }
    }

    /// 2-bit type selector
    pub fn type_selector(self) -> u8 {
        match self {
            PacketKind::GiveCredit | PacketKind::Write => 0b00,
            PacketKind::StopRead | PacketKind::StopWrite => 0b01,
            PacketKind::Oops | PacketKind::ForgoCredit => 0b10,
            PacketKind::PromiseWrite | PacketKind::PromiseRead => 0b11,
        }
    }

    /// Parity the stream id must have, seen from the receiver
    pub fn parity(self) -> Parity {
        match self {
            PacketKind::GiveCredit
            | PacketKind::StopRead
            | PacketKind::Oops
            | PacketKind::PromiseWrite => Parity::Zero,
            PacketKind::Write
            | PacketKind::StopWrite
            | PacketKind::ForgoCredit
            | PacketKind::PromiseRead => Parity::One,
        }
    }

    /// Check if the sender of this kind is the stream's writer
    pub fn sent_by_writer(self) -> bool {
        self.parity() == Parity::One
    }

    /// Check if the amount field must be non-zero
    pub fn requires_non_zero(self) -> bool {
        !matches!(
            self,
            PacketKind::StopRead | PacketKind::StopWrite | PacketKind::Oops
        )
    }

    /// Check if the kind is advisory and never validated
    pub fn is_advisory(self) -> bool {
        matches!(
            self,
            PacketKind::Oops | PacketKind::PromiseWrite | PacketKind::PromiseRead
        )
    }

    /// Get kind name
    pub fn name(&self) -> &'static str {
        match self {
            PacketKind::GiveCredit => "GiveCredit",
            PacketKind::Write => "Write",
            PacketKind::StopRead => "StopRead",
            PacketKind::StopWrite => "StopWrite",
            PacketKind::Oops => "Oops",
            PacketKind::ForgoCredit => "ForgoCredit",
            PacketKind::PromiseWrite => "PromiseWrite",
            PacketKind::PromiseRead => "PromiseRead",
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded or to-be-encoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    GiveCredit { id: StreamId, amount: u64 },
    /// `data` holds the encoded items, or the terminal item
    Write { id: StreamId, amount: u64, data: Bytes },
    StopRead { id: StreamId, amount: u64 },
    StopWrite { id: StreamId, amount: u64 },
    Oops { id: StreamId, maximum: u64 },
    ForgoCredit { id: StreamId, amount: u64 },
    PromiseWrite { id: StreamId, amount: u64 },
    PromiseRead { id: StreamId, amount: u64 },
}

impl Packet {
    /// Get the stream id
    pub fn id(&self) -> StreamId {
        match *self {
            Packet::GiveCredit { id, .. }
            | Packet::Write { id, .. }
            | Packet::StopRead { id, .. }
            | Packet::StopWrite { id, .. }
            | Packet::Oops { id, .. }
            | Packet::ForgoCredit { id, .. }
            | Packet::PromiseWrite { id, .. }
            | Packet::PromiseRead { id, .. } => id,
        }
    }

    /// Get the packet kind
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::GiveCredit { .. } => PacketKind::GiveCredit,
            Packet::Write { .. } => PacketKind::Write,
            Packet::StopRead { .. } => PacketKind::StopRead,
            Packet::StopWrite { .. } => PacketKind::StopWrite,
            Packet::Oops { .. } => PacketKind::Oops,
            Packet::ForgoCredit { .. } => PacketKind::ForgoCredit,
            Packet::PromiseWrite { .. } => PacketKind::PromiseWrite,
            Packet::PromiseRead { .. } => PacketKind::PromiseRead,
        }
    }

    /// Get the integer field (`amount`, or `maximum` for Oops)
    pub fn amount(&self) -> u64 {
        match *self {
            Packet::GiveCredit { amount, .. }
            | Packet::Write { amount, .. }
            | Packet::StopRead { amount, .. }
            | Packet::StopWrite { amount, .. }
            | Packet::ForgoCredit { amount, .. }
            | Packet::PromiseWrite { amount, .. }
            | Packet::PromiseRead { amount, .. } => amount,
            Packet::Oops { maximum, .. } => maximum,
        }
    }

    /// Build a packet of `kind` carrying only an integer field
    ///
    /// Returns `None` for [`PacketKind::Write`], which also carries data.
    pub fn control(kind: PacketKind, id: StreamId, amount: u64) -> Option<Self> {
        Some(match kind {
            PacketKind::GiveCredit => Packet::GiveCredit { id, amount },
            PacketKind::StopRead => Packet::StopRead { id, amount },
            PacketKind::StopWrite => Packet::StopWrite { id, amount },
            PacketKind::Oops => Packet::Oops { id, maximum: amount },
            PacketKind::ForgoCredit => Packet::ForgoCredit { id, amount },
            PacketKind::PromiseWrite => Packet::PromiseWrite { id, amount },
            PacketKind::PromiseRead => Packet::PromiseRead { id, amount },
            PacketKind::Write => return None,
        })
    }
}
