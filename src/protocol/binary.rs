// src/protocol/binary.rs
//! Binary packet codec
//!
//! Stateless encode/decode between [`BitchatPacket`] and wire bytes.
//! Network byte order throughout. Every length field is checked against the
//! remaining buffer before slicing; decode on arbitrary bytes returns a
//! typed [`DecodeError`] rather than reading out of bounds.
//!
//! Encode is total for inputs within the documented limits; a payload
//! longer than [`MAX_PAYLOAD_SIZE`] is truncated to the limit (origination
//! layers are expected to size-check first).

use byteorder::{BigEndian, ByteOrder};

use super::compression;
use super::constants::*;
use super::error::{DecodeError, DecodeResult};
use super::{BitchatPacket, MessageId, PacketType, PeerId};

pub struct BinaryProtocol;

impl BinaryProtocol {
    /// Encode a packet to wire bytes
    pub fn encode(packet: &BitchatPacket) -> Vec<u8> {
        Self::encode_inner(packet, packet.ttl, packet.signature.as_ref())
    }

    /// Canonical bytes covered by the packet signature.
    ///
    /// The signature field is omitted and the TTL byte is zeroed so that
    /// relays can decrement TTL without invalidating the signature.
    pub fn signing_bytes(packet: &BitchatPacket) -> Vec<u8> {
        Self::encode_inner(packet, 0, None)
    }

    fn encode_inner(packet: &BitchatPacket, ttl: u8, signature: Option<&[u8; 64]>) -> Vec<u8> {
        let payload = if packet.payload.len() > MAX_PAYLOAD_SIZE {
            &packet.payload[..MAX_PAYLOAD_SIZE]
        } else {
            &packet.payload[..]
        };

        let (wire_payload, compressed) = match compression::maybe_compress(payload) {
            Some(compressed) => (compressed, true),
            None => (payload.to_vec(), false),
        };

        let mut flags = 0u8;
        if packet.recipient_id.is_some() {
            flags |= FLAG_RECIPIENT_PRESENT;
        }
        if signature.is_some() {
            flags |= FLAG_SIGNATURE_PRESENT;
        }
        if compressed {
            flags |= FLAG_PAYLOAD_COMPRESSED;
        }
        let extended = wire_payload.len() > u16::MAX as usize;
        if extended {
            flags |= FLAG_EXTENDED_LENGTH;
        }

        let mut buffer = Vec::with_capacity(HEADER_SIZE + 12 + wire_payload.len() + 64);
        buffer.push(packet.version);
        buffer.push(packet.packet_type.as_u8());
        buffer.push(ttl);
        buffer.push(flags);
        buffer.extend_from_slice(&packet.timestamp_ms.to_be_bytes());
        buffer.extend_from_slice(packet.sender_id.as_bytes());
        buffer.extend_from_slice(packet.message_id.as_bytes());

        if let Some(recipient) = &packet.recipient_id {
            buffer.extend_from_slice(recipient.as_bytes());
        }

        if extended {
            buffer.extend_from_slice(&(wire_payload.len() as u32).to_be_bytes());
        } else {
            buffer.extend_from_slice(&(wire_payload.len() as u16).to_be_bytes());
        }
        buffer.extend_from_slice(&wire_payload);

        if let Some(signature) = signature {
            buffer.extend_from_slice(signature);
        }

        buffer
    }

    /// Decode wire bytes into a packet
    pub fn decode(data: &[u8]) -> DecodeResult<BitchatPacket> {
        let mut reader = Reader::new(data);

        let version = reader.read_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::BadVersion {
                expected: PROTOCOL_VERSION,
                actual: version,
            });
        }

        let packet_type = PacketType::from_u8(reader.read_u8()?)?;

        let ttl = reader.read_u8()?;
        if ttl > MAX_TTL {
            return Err(DecodeError::FieldExceedsLimit {
                field: "ttl",
                limit: MAX_TTL as usize,
                actual: ttl as usize,
            });
        }

        let flags = reader.read_u8()?;
        if flags & !FLAG_KNOWN_MASK != 0 {
            return Err(DecodeError::ReservedFlags(flags));
        }

        let timestamp_ms = reader.read_u64()?;
        let sender_id = PeerId::from_bytes(reader.read_array::<PEER_ID_SIZE>()?);
        let message_id =
            MessageId::from_bytes(reader.read_array::<MESSAGE_ID_SIZE>()?);

        let recipient_id = if flags & FLAG_RECIPIENT_PRESENT != 0 {
            Some(PeerId::from_bytes(
                reader.read_array::<PEER_ID_SIZE>()?,
            ))
        } else {
            None
        };

        let payload_len = if flags & FLAG_EXTENDED_LENGTH != 0 {
            reader.read_u32()? as usize
        } else {
            reader.read_u16()? as usize
        };
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(DecodeError::FieldExceedsLimit {
                field: "payload",
                limit: MAX_PAYLOAD_SIZE,
                actual: payload_len,
            });
        }
        if payload_len > reader.remaining() {
            return Err(DecodeError::BadLengthField {
                field: "payload_len",
                value: payload_len,
            });
        }
        let wire_payload = reader.read_slice(payload_len)?;

        let signature = if flags & FLAG_SIGNATURE_PRESENT != 0 {
            Some(reader.read_array::<SIGNATURE_SIZE>()?)
        } else {
            None
        };

        if reader.remaining() > 0 {
            return Err(DecodeError::TrailingGarbage {
                remaining: reader.remaining(),
            });
        }

        let payload = if flags & FLAG_PAYLOAD_COMPRESSED != 0 {
            compression::decompress(wire_payload)?
        } else {
            wire_payload.to_vec()
        };

        Ok(BitchatPacket {
            version,
            packet_type,
            ttl,
            timestamp_ms,
            sender_id,
            recipient_id,
            message_id,
            payload,
            signature,
        })
    }
}

/// Bounds-checked cursor over an immutable byte slice
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> DecodeResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(DecodeError::TooShort {
                expected: self.pos + len,
                actual: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u8(&mut self) -> DecodeResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> DecodeResult<u16> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    fn read_u32(&mut self) -> DecodeResult<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    fn read_u64(&mut self) -> DecodeResult<u64> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    fn read_slice(&mut self, len: usize) -> DecodeResult<&'a [u8]> {
        self.take(len)
    }

    fn read_array<const N: usize>(&mut self) -> DecodeResult<[u8; N]> {
        let slice = self.take(N)?;
        let mut array = [0u8; N];
        array.copy_from_slice(slice);
        Ok(array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_packet() -> BitchatPacket {
        BitchatPacket::new_broadcast(
            PacketType::Message,
            PeerId::from_bytes([0xAA; 8]),
            b"hello mesh".to_vec(),
        )
    }

    #[test]
    fn test_roundtrip_broadcast() {
        let packet = sample_packet();
        let bytes = BinaryProtocol::encode(&packet);
        let decoded = BinaryProtocol::decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_roundtrip_directed_signed() {
        let mut packet = BitchatPacket::new_direct(
            PacketType::Ack,
            PeerId::from_bytes([1; 8]),
            PeerId::from_bytes([2; 8]),
            vec![9; 16],
        );
        packet.signature = Some([0x55; 64]);

        let bytes = BinaryProtocol::encode(&packet);
        let decoded = BinaryProtocol::decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_roundtrip_compressible_payload() {
        let mut packet = sample_packet();
        packet.payload = b"repeated content repeated content ".repeat(32);

        let bytes = BinaryProtocol::encode(&packet);
        // Compression must have kicked in on the wire
        assert!(bytes.len() < HEADER_SIZE + 2 + packet.payload.len());

        let decoded = BinaryProtocol::decode(&bytes).unwrap();
        assert_eq!(decoded.payload, packet.payload);
    }

    #[test]
    fn test_too_short() {
        assert!(matches!(
            BinaryProtocol::decode(&[1, 2]),
            Err(DecodeError::TooShort { .. })
        ));
    }

    #[test]
    fn test_bad_version() {
        let mut bytes = BinaryProtocol::encode(&sample_packet());
        bytes[0] = 9;
        assert!(matches!(
            BinaryProtocol::decode(&bytes),
            Err(DecodeError::BadVersion { actual: 9, .. })
        ));
    }

    #[test]
    fn test_unknown_type() {
        let mut bytes = BinaryProtocol::encode(&sample_packet());
        bytes[1] = 0x7F;
        assert!(matches!(
            BinaryProtocol::decode(&bytes),
            Err(DecodeError::UnknownType(0x7F))
        ));
    }

    #[test]
    fn test_reserved_flags_rejected() {
        let mut bytes = BinaryProtocol::encode(&sample_packet());
        bytes[3] |= 0x80;
        assert!(matches!(
            BinaryProtocol::decode(&bytes),
            Err(DecodeError::ReservedFlags(_))
        ));
    }

    #[test]
    fn test_ttl_above_limit_rejected() {
        let mut bytes = BinaryProtocol::encode(&sample_packet());
        bytes[2] = MAX_TTL + 1;
        assert!(matches!(
            BinaryProtocol::decode(&bytes),
            Err(DecodeError::FieldExceedsLimit { field: "ttl", .. })
        ));
    }

    #[test]
    fn test_length_field_beyond_buffer() {
        let packet = sample_packet();
        let bytes = BinaryProtocol::encode(&packet);
        // Inflate the u16 payload length past the actual buffer
        let mut bytes = bytes;
        bytes[HEADER_SIZE] = 0xFF;
        bytes[HEADER_SIZE + 1] = 0xFF;
        assert!(matches!(
            BinaryProtocol::decode(&bytes),
            Err(DecodeError::BadLengthField { field: "payload_len", .. })
        ));
    }

    #[test]
    fn test_trailing_garbage() {
        let mut bytes = BinaryProtocol::encode(&sample_packet());
        bytes.extend_from_slice(&[0xDE, 0xAD]);
        assert!(matches!(
            BinaryProtocol::decode(&bytes),
            Err(DecodeError::TrailingGarbage { remaining: 2 })
        ));
    }

    #[test]
    fn test_oversize_payload_truncated_on_encode() {
        let mut packet = sample_packet();
        let mut huge = vec![0u8; MAX_PAYLOAD_SIZE + 512];
        getrandom::getrandom(&mut huge).unwrap();
        packet.payload = huge;

        let bytes = BinaryProtocol::encode(&packet);
        let decoded = BinaryProtocol::decode(&bytes).unwrap();
        assert_eq!(decoded.payload.len(), MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_signing_bytes_ignore_ttl_and_signature() {
        let mut packet = sample_packet();
        let canonical = BinaryProtocol::signing_bytes(&packet);

        packet.ttl = 2;
        packet.signature = Some([9; 64]);
        assert_eq!(BinaryProtocol::signing_bytes(&packet), canonical);
    }

    proptest! {
        /// Decode on arbitrary bytes never panics or overreads
        #[test]
        fn prop_decode_no_overread(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = BinaryProtocol::decode(&data);
        }

        /// Round-trip holds for arbitrary in-limit payloads
        #[test]
        fn prop_roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..2048), ttl in 0u8..=MAX_TTL) {
            let mut packet = BitchatPacket::new_broadcast(
                PacketType::Message,
                PeerId::from_bytes([3; 8]),
                payload,
            );
            packet.ttl = ttl;
            let bytes = BinaryProtocol::encode(&packet);
            let decoded = BinaryProtocol::decode(&bytes).unwrap();
            prop_assert_eq!(decoded, packet);
        }
    }
}
