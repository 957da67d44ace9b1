//! Packet encoding and decoding
//!
//! A packet starts with a one-byte header `[type:2][id:6]`. Ids up to 62 are
//! stored inline; the escape value 63 means the id follows as a
//! variable-length integer that must be greater than 62. The integer field
//! of the packet comes next, and a `Write` is followed by its payload.
//!
//! Decoding never consults stream state. The byte length of a `Write`
//! payload is determined by an [`ItemFraming`] supplied by the protocol
//! built on top of the multiplexer.

use super::error::{DecodeError, EncodeError};
use super::packet::{Packet, PacketKind, Role};
use super::varint;
use super::{StreamId, ESCAPE_ID, MAX_INLINE_ID};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

/// Describes how the items of each stream are laid out on the wire
///
/// Implemented by the protocol that assigns meaning to stream ids.
pub trait ItemFraming {
    /// Byte length of the first `amount` items at the start of `buf`
    ///
    /// Returns `Ok(None)` if `buf` does not hold all of them yet.
    fn items_len(
        &self,
        id: StreamId,
        amount: u64,
        buf: &[u8],
    ) -> Result<Option<usize>, DecodeError>;

    /// Encoded size of the terminal item of stream `id`
    ///
    /// `None` means the terminal type is uninhabited: the stream never ends
    /// and must never be closed with a StopWrite.
    fn terminal_len(&self, id: StreamId) -> Option<usize>;
}

impl<T: ItemFraming + ?Sized> ItemFraming for &T {
    fn items_len(
        &self,
        id: StreamId,
        amount: u64,
        buf: &[u8],
    ) -> Result<Option<usize>, DecodeError> {
        (**self).items_len(id, amount, buf)
    }

    fn terminal_len(&self, id: StreamId) -> Option<usize> {
        (**self).terminal_len(id)
    }
}

/// Framing where every item is a single byte
///
/// Credit is then counted in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteItems {
    terminal_len: Option<usize>,
}

impl ByteItems {
    /// Byte items with an empty terminal item
    pub fn new() -> Self {
        ByteItems {
            terminal_len: Some(0),
        }
    }

    /// Byte items with a terminal item of `len` bytes
    pub fn with_terminal_len(len: usize) -> Self {
        ByteItems {
            terminal_len: Some(len),
        }
    }

    /// Byte items on streams that never end
    pub fn endless() -> Self {
        ByteItems { terminal_len: None }
    }
}

impl Default for ByteItems {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemFraming for ByteItems {
    fn items_len(
        &self,
        _id: StreamId,
        amount: u64,
        buf: &[u8],
    ) -> Result<Option<usize>, DecodeError> {
        let len = usize::try_from(amount)
            .map_err(|_| DecodeError::MalformedPacket("write payload too large"))?;
        Ok((buf.len() >= len).then_some(len))
    }

    fn terminal_len(&self, _id: StreamId) -> Option<usize> {
        self.terminal_len
    }
}

/// Framing where every item has the same encoded size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedSizeItems {
    /// Size of one regular item in bytes
    pub item_len: usize,
    /// Size of the terminal item, `None` if streams never end
    pub terminal_len: Option<usize>,
}

impl FixedSizeItems {
    /// Create a fixed-size framing
    pub fn new(item_len: usize, terminal_len: Option<usize>) -> Self {
        FixedSizeItems {
            item_len,
            terminal_len,
        }
    }
}

impl ItemFraming for FixedSizeItems {
    fn items_len(
        &self,
        _id: StreamId,
        amount: u64,
        buf: &[u8],
    ) -> Result<Option<usize>, DecodeError> {
        let len = usize::try_from(amount)
            .ok()
            .and_then(|n| n.checked_mul(self.item_len))
            .ok_or(DecodeError::MalformedPacket("write payload too large"))?;
        Ok((buf.len() >= len).then_some(len))
    }

    fn terminal_len(&self, _id: StreamId) -> Option<usize> {
        self.terminal_len
    }
}

/// Packet header and integer field, without any `Write` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    /// A complete packet that carries no payload
    Control(Packet),
    /// The start of a `Write`; its payload follows
    Write { id: StreamId, amount: u64 },
}

impl Header {
    /// Get the stream id
    pub fn id(&self) -> StreamId {
        match self {
            Header::Control(packet) => packet.id(),
            Header::Write { id, .. } => *id,
        }
    }

    /// Get the packet kind
    pub fn kind(&self) -> PacketKind {
        match self {
            Header::Control(packet) => packet.kind(),
            Header::Write { .. } => PacketKind::Write,
        }
    }
}

/// Packet codec
///
/// `receiver` is the role of the endpoint that decodes the packet; it
/// resolves which kind a type selector denotes for a given id parity.
pub struct PacketCodec;

impl PacketCodec {
    /// Encode a packet into a new buffer
    pub fn encode(packet: &Packet, receiver: Role) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::with_capacity(Self::encoded_len(packet));
        Self::encode_into(packet, receiver, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Encode a packet, appending to `buf`
    ///
    /// Nothing is written if the packet is invalid.
    pub fn encode_into(
        packet: &Packet,
        receiver: Role,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        let kind = packet.kind();
        let id = packet.id();

        if receiver.parity(id) != kind.parity() {
            return Err(EncodeError::IdOutOfRole { kind, id });
        }
        if kind.requires_non_zero() && packet.amount() == 0 {
            return Err(EncodeError::ZeroAmount(kind));
        }

        Self::encode_header(kind, id, buf);
        varint::encode(packet.amount(), buf);
        if let Packet::Write { data, .. } = packet {
            buf.put_slice(data);
        }

        trace!(%kind, id, len = Self::encoded_len(packet), "encoded packet");
        Ok(())
    }

    /// Write the header byte and, if needed, the escaped stream id
    pub fn encode_header(kind: PacketKind, id: StreamId, buf: &mut BytesMut) {
        let selector = kind.type_selector() << 6;
        if id <= MAX_INLINE_ID {
            buf.put_u8(selector | id as u8);
        } else {
            buf.put_u8(selector | ESCAPE_ID);
            varint::encode(id, buf);
        }
    }

    /// Total encoded size of a packet
    pub fn encoded_len(packet: &Packet) -> usize {
        let id = packet.id();
        let id_len = if id <= MAX_INLINE_ID {
            0
        } else {
            varint::encoded_len(id)
        };
        let data_len = match packet {
            Packet::Write { data, .. } => data.len(),
            _ => 0,
        };
        1 + id_len + varint::encoded_len(packet.amount()) + data_len
    }

    /// Decode a header and its integer field
    ///
    /// Returns the header and the number of bytes consumed. A `Write`
    /// payload is not consumed.
    pub fn decode_header(buf: &[u8], receiver: Role) -> Result<(Header, usize), DecodeError> {
        let first = *buf.first().ok_or(DecodeError::Incomplete)?;
        let selector = first >> 6;
        let inline = first & ESCAPE_ID;
        let mut pos = 1;

        let id = if inline == ESCAPE_ID {
            let (id, used) = Self::read_int(&buf[pos..], false)?;
            if id <= MAX_INLINE_ID {
                return Err(DecodeError::MalformedPacket("non-canonical stream id"));
            }
            pos += used;
            id
        } else {
            inline as StreamId
        };

        let kind = PacketKind::from_type(selector, receiver.parity(id));
        let (amount, used) = Self::read_int(&buf[pos..], kind.requires_non_zero())?;
        pos += used;

        let header = match Packet::control(kind, id, amount) {
            Some(packet) => Header::Control(packet),
            None => Header::Write { id, amount },
        };
        Ok((header, pos))
    }

    /// Byte length of a `Write` payload at the start of `rest`
    ///
    /// A terminal payload has the fixed size announced by the framing;
    /// otherwise the payload holds `amount` regular items.
    pub fn payload_len<F: ItemFraming + ?Sized>(
        framing: &F,
        id: StreamId,
        amount: u64,
        rest: &[u8],
        terminal: bool,
    ) -> Result<usize, DecodeError> {
        let len = if terminal {
            framing
                .terminal_len(id)
                .ok_or(DecodeError::MalformedPacket("stream has no terminal item"))?
        } else {
            framing
                .items_len(id, amount, rest)?
                .ok_or(DecodeError::Incomplete)?
        };
        if rest.len() < len {
            return Err(DecodeError::Incomplete);
        }
        Ok(len)
    }

    /// Decode one regular packet from the start of `buf`
    ///
    /// Returns the packet and the number of bytes consumed.
    pub fn decode<F: ItemFraming + ?Sized>(
        buf: &[u8],
        receiver: Role,
        framing: &F,
    ) -> Result<(Packet, usize), DecodeError> {
        Self::decode_inner(buf, receiver, framing, false)
    }

    /// Decode a `Write` carrying a terminal item from the start of `buf`
    pub fn decode_final<F: ItemFraming + ?Sized>(
        buf: &[u8],
        receiver: Role,
        framing: &F,
    ) -> Result<(Packet, usize), DecodeError> {
        Self::decode_inner(buf, receiver, framing, true)
    }

    fn decode_inner<F: ItemFraming + ?Sized>(
        buf: &[u8],
        receiver: Role,
        framing: &F,
        terminal: bool,
    ) -> Result<(Packet, usize), DecodeError> {
        let (header, used) = Self::decode_header(buf, receiver)?;
        match header {
            Header::Control(packet) => {
                if terminal {
                    return Err(DecodeError::MalformedPacket("expected a terminal write"));
                }
                Ok((packet, used))
            }
            Header::Write { id, amount } => {
                let rest = &buf[used..];
                let len = Self::payload_len(framing, id, amount, rest, terminal)?;
                let data = Bytes::copy_from_slice(&rest[..len]);
                Ok((Packet::Write { id, amount, data }, used + len))
            }
        }
    }

    fn read_int(buf: &[u8], non_zero: bool) -> Result<(u64, usize), DecodeError> {
        varint::read(buf, non_zero).map_err(|err| {
            if err.is_incomplete() {
                DecodeError::Incomplete
            } else {
                err
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::error::IntError;
    use proptest::prelude::*;

    fn round_trip(packet: Packet, receiver: Role) {
        let framing = ByteItems::new();
        let encoded = PacketCodec::encode(&packet, receiver).unwrap();
        assert_eq!(encoded.len(), PacketCodec::encoded_len(&packet));
        let (decoded, used) = PacketCodec::decode(&encoded, receiver, &framing).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(used, encoded.len());
    }

    /// An id with the parity `kind` needs when received by `receiver`
    fn id_for(kind: PacketKind, receiver: Role, base: StreamId) -> StreamId {
        if receiver.parity(base) == kind.parity() {
            base
        } else {
            base ^ 1
        }
    }

    #[test]
    fn test_inline_header() {
        let packet = Packet::GiveCredit { id: 1, amount: 5 };
        let encoded = PacketCodec::encode(&packet, Role::Reactive).unwrap();
        assert_eq!(&encoded[..], &[0b00_000001, 5]);
    }

    #[test]
    fn test_escaped_header() {
        let packet = Packet::StopWrite { id: 63, amount: 0 };
        let encoded = PacketCodec::encode(&packet, Role::Proactive).unwrap();
        assert_eq!(&encoded[..], &[0b01_111111, 63, 0]);

        let packet = Packet::StopWrite { id: 62, amount: 0 };
        let encoded = PacketCodec::encode(&packet, Role::Reactive).unwrap();
        assert_eq!(&encoded[..], &[0b01_111110, 0]);
    }

    #[test]
    fn test_write_payload() {
        let packet = Packet::Write {
            id: 1,
            amount: 3,
            data: Bytes::from_static(b"abc"),
        };
        let encoded = PacketCodec::encode(&packet, Role::Proactive).unwrap();
        assert_eq!(&encoded[..], &[0b00_000001, 3, b'a', b'b', b'c']);
        round_trip(packet, Role::Proactive);
    }

    #[test]
    fn test_kind_depends_on_receiver() {
        let encoded = [0b00_000001, 3, b'a', b'b', b'c'];
        let (header, _) = PacketCodec::decode_header(&encoded, Role::Proactive).unwrap();
        assert_eq!(header, Header::Write { id: 1, amount: 3 });

        let (header, used) = PacketCodec::decode_header(&encoded, Role::Reactive).unwrap();
        assert_eq!(header, Header::Control(Packet::GiveCredit { id: 1, amount: 3 }));
        assert_eq!(used, 2);
    }

    #[test]
    fn test_round_trip_all_kinds_and_boundary_ids() {
        for receiver in [Role::Proactive, Role::Reactive] {
            for kind in PacketKind::ALL {
                for base in [0, 62, 63, 64, 1 << 40, u64::MAX] {
                    let id = id_for(kind, receiver, base);
                    let packet = match kind {
                        PacketKind::Write => Packet::Write {
                            id,
                            amount: 2,
                            data: Bytes::from_static(b"hi"),
                        },
                        _ => Packet::control(kind, id, 300).unwrap(),
                    };
                    round_trip(packet, receiver);
                }
            }
        }
    }

    #[test]
    fn test_encode_rejects_wrong_parity() {
        let packet = Packet::Write {
            id: 2,
            amount: 1,
            data: Bytes::from_static(b"x"),
        };
        let err = PacketCodec::encode(&packet, Role::Proactive).unwrap_err();
        assert_eq!(
            err,
            EncodeError::IdOutOfRole {
                kind: PacketKind::Write,
                id: 2
            }
        );
    }

    #[test]
    fn test_encode_rejects_zero_amount() {
        let packet = Packet::GiveCredit { id: 1, amount: 0 };
        let err = PacketCodec::encode(&packet, Role::Reactive).unwrap_err();
        assert_eq!(err, EncodeError::ZeroAmount(PacketKind::GiveCredit));

        let packet = Packet::StopRead { id: 1, amount: 0 };
        assert!(PacketCodec::encode(&packet, Role::Reactive).is_ok());
    }

    #[test]
    fn test_decode_rejects_zero_amount() {
        let err = PacketCodec::decode_header(&[0b00_000001, 0], Role::Reactive).unwrap_err();
        assert_eq!(err, DecodeError::MalformedInt(IntError::Zero));
    }

    #[test]
    fn test_decode_rejects_non_canonical_id() {
        let err = PacketCodec::decode_header(&[0b01_111111, 62, 0], Role::Reactive).unwrap_err();
        assert_eq!(err, DecodeError::MalformedPacket("non-canonical stream id"));
    }

    #[test]
    fn test_decode_incomplete() {
        let framing = ByteItems::new();
        assert_eq!(
            PacketCodec::decode(&[], Role::Proactive, &framing),
            Err(DecodeError::Incomplete)
        );
        assert_eq!(
            PacketCodec::decode(&[0b01_111111, 0xFD, 0x01], Role::Proactive, &framing),
            Err(DecodeError::Incomplete)
        );
        assert_eq!(
            PacketCodec::decode(&[0b00_000001, 3, b'a'], Role::Proactive, &framing),
            Err(DecodeError::Incomplete)
        );
    }

    #[test]
    fn test_decode_final_uses_terminal_len() {
        let framing = ByteItems::with_terminal_len(2);
        let bytes = [0b00_000001, 1, 0xAA, 0xBB, 0xCC];
        let (packet, used) = PacketCodec::decode_final(&bytes, Role::Proactive, &framing).unwrap();
        assert_eq!(
            packet,
            Packet::Write {
                id: 1,
                amount: 1,
                data: Bytes::from_static(&[0xAA, 0xBB])
            }
        );
        assert_eq!(used, 4);

        let endless = ByteItems::endless();
        assert_eq!(
            PacketCodec::decode_final(&bytes, Role::Proactive, &endless),
            Err(DecodeError::MalformedPacket("stream has no terminal item"))
        );
    }

    #[test]
    fn test_fixed_size_items() {
        let framing = FixedSizeItems::new(4, Some(1));
        assert_eq!(framing.items_len(0, 2, &[0; 8]), Ok(Some(8)));
        assert_eq!(framing.items_len(0, 2, &[0; 7]), Ok(None));
        assert_eq!(
            framing.items_len(0, u64::MAX, &[]),
            Err(DecodeError::MalformedPacket("write payload too large"))
        );
        assert_eq!(framing.terminal_len(0), Some(1));
    }

    proptest! {
        #[test]
        fn prop_decode_arbitrary_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let framing = ByteItems::new();
            for receiver in [Role::Proactive, Role::Reactive] {
                if let Ok((_, used)) = PacketCodec::decode(&bytes, receiver, &framing) {
                    prop_assert!(used <= bytes.len());
                }
                if let Ok((_, used)) = PacketCodec::decode_final(&bytes, receiver, &framing) {
                    prop_assert!(used <= bytes.len());
                }
            }
        }

        #[test]
        fn prop_control_round_trip(id in any::<u64>(), amount in 1..=u64::MAX, selector in 0u8..4) {
            let receiver = Role::Reactive;
            let kind = PacketKind::from_type(selector, receiver.parity(id));
            let packet = match kind {
                PacketKind::Write => Packet::Write { id, amount: 1, data: Bytes::from_static(b"z") },
                _ => Packet::control(kind, id, amount).unwrap(),
            };
            let encoded = PacketCodec::encode(&packet, receiver).unwrap();
            let decoded = PacketCodec::decode(&encoded, receiver, &ByteItems::new()).unwrap();
            prop_assert_eq!(decoded, (packet, encoded.len()));
        }
    }
}
