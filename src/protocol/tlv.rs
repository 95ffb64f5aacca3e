// src/protocol/tlv.rs
//! TLV sub-codecs for packet payloads
//!
//! Message, Announce and Ack payloads are TLV-encoded inside the packet
//! payload field: type(1) | length(2, big-endian) | value. Unknown field
//! types are skipped on decode for forward compatibility.

use byteorder::{BigEndian, ByteOrder};

use super::constants::*;
use super::error::{DecodeError, DecodeResult};
use super::MessageId;

// Message payload fields
const TLV_NICKNAME: u8 = 0x01;
const TLV_CONTENT: u8 = 0x02;
const TLV_CHANNEL: u8 = 0x03;
const TLV_MENTION: u8 = 0x04;
const TLV_REPLY_TO: u8 = 0x05;

// Announce payload fields (identity distribution)
const TLV_NOISE_STATIC_KEY: u8 = 0x10;
const TLV_SIGNING_KEY: u8 = 0x11;
const TLV_CAPABILITIES: u8 = 0x12;

/// Chat message payload (packet type `Message`)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessagePayload {
    pub nickname: Option<String>,
    pub content: String,
    pub channel: Option<String>,
    pub mentions: Vec<String>,
    pub reply_to: Option<MessageId>,
}

impl MessagePayload {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn encode(&self) -> DecodeResult<Vec<u8>> {
        let mut buffer = Vec::new();
        if let Some(nickname) = &self.nickname {
            write_str(&mut buffer, TLV_NICKNAME, nickname, "nickname", MAX_NICKNAME_LEN)?;
        }
        write_str(&mut buffer, TLV_CONTENT, &self.content, "content", MAX_CONTENT_LEN)?;
        if let Some(channel) = &self.channel {
            write_str(&mut buffer, TLV_CHANNEL, channel, "channel", MAX_CHANNEL_LEN)?;
        }
        if self.mentions.len() > MAX_MENTIONS {
            return Err(DecodeError::FieldExceedsLimit {
                field: "mentions",
                limit: MAX_MENTIONS,
                actual: self.mentions.len(),
            });
        }
        for mention in &self.mentions {
            write_str(&mut buffer, TLV_MENTION, mention, "mention", MAX_MENTION_LEN)?;
        }
        if let Some(reply_to) = &self.reply_to {
            write_field(&mut buffer, TLV_REPLY_TO, reply_to.as_bytes());
        }
        Ok(buffer)
    }

    pub fn decode(data: &[u8]) -> DecodeResult<Self> {
        let mut payload = Self::default();
        let mut saw_content = false;

        for (field_type, value) in TlvIter::new(data) {
            let value = value?;
            match field_type {
                TLV_NICKNAME => {
                    payload.nickname = Some(read_str(value, "nickname", MAX_NICKNAME_LEN)?);
                }
                TLV_CONTENT => {
                    payload.content = read_str(value, "content", MAX_CONTENT_LEN)?;
                    saw_content = true;
                }
                TLV_CHANNEL => {
                    payload.channel = Some(read_str(value, "channel", MAX_CHANNEL_LEN)?);
                }
                TLV_MENTION => {
                    if payload.mentions.len() >= MAX_MENTIONS {
                        return Err(DecodeError::FieldExceedsLimit {
                            field: "mentions",
                            limit: MAX_MENTIONS,
                            actual: payload.mentions.len() + 1,
                        });
                    }
                    payload
                        .mentions
                        .push(read_str(value, "mention", MAX_MENTION_LEN)?);
                }
                TLV_REPLY_TO => {
                    payload.reply_to = Some(MessageId::from_bytes(read_fixed::<
                        MESSAGE_ID_SIZE,
                    >(value, "reply_to")?));
                }
                _ => {} // unknown field, skip
            }
        }

        if !saw_content {
            return Err(DecodeError::BadLengthField {
                field: "content",
                value: 0,
            });
        }
        Ok(payload)
    }
}

/// Presence beacon payload (packet type `Announce`).
///
/// Carries the long-term identity keys so receivers can bind the wire
/// peer id to a verified key pair before any handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncePayload {
    pub nickname: String,
    pub noise_static_key: [u8; 32],
    pub signing_key: [u8; 32],
    pub capabilities: u8,
}

impl AnnouncePayload {
    pub fn encode(&self) -> DecodeResult<Vec<u8>> {
        let mut buffer = Vec::new();
        write_str(&mut buffer, TLV_NICKNAME, &self.nickname, "nickname", MAX_NICKNAME_LEN)?;
        write_field(&mut buffer, TLV_NOISE_STATIC_KEY, &self.noise_static_key);
        write_field(&mut buffer, TLV_SIGNING_KEY, &self.signing_key);
        write_field(&mut buffer, TLV_CAPABILITIES, &[self.capabilities]);
        Ok(buffer)
    }

    pub fn decode(data: &[u8]) -> DecodeResult<Self> {
        let mut nickname = None;
        let mut noise_static_key = None;
        let mut signing_key = None;
        let mut capabilities = 0u8;

        for (field_type, value) in TlvIter::new(data) {
            let value = value?;
            match field_type {
                TLV_NICKNAME => {
                    nickname = Some(read_str(value, "nickname", MAX_NICKNAME_LEN)?);
                }
                TLV_NOISE_STATIC_KEY => {
                    noise_static_key = Some(read_fixed::<32>(value, "noise_static_key")?);
                }
                TLV_SIGNING_KEY => {
                    signing_key = Some(read_fixed::<32>(value, "signing_key")?);
                }
                TLV_CAPABILITIES => {
                    capabilities = read_fixed::<1>(value, "capabilities")?[0];
                }
                _ => {}
            }
        }

        match (nickname, noise_static_key, signing_key) {
            (Some(nickname), Some(noise_static_key), Some(signing_key)) => Ok(Self {
                nickname,
                noise_static_key,
                signing_key,
                capabilities,
            }),
            _ => Err(DecodeError::BadLengthField {
                field: "announce",
                value: data.len(),
            }),
        }
    }
}

/// Encode an Ack payload: the message id being acknowledged
pub fn encode_ack(message_id: &MessageId) -> Vec<u8> {
    message_id.as_bytes().to_vec()
}

/// Decode an Ack payload
pub fn decode_ack(data: &[u8]) -> DecodeResult<MessageId> {
    Ok(MessageId::from_bytes(read_fixed::<MESSAGE_ID_SIZE>(
        data, "ack",
    )?))
}

/// Iterator over (type, value) pairs in a TLV buffer
struct TlvIter<'a> {
    data: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> TlvIter<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = (u8, DecodeResult<&'a [u8]>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.data.len() {
            return None;
        }
        if self.data.len() - self.pos < 3 {
            self.failed = true;
            return Some((
                0,
                Err(DecodeError::TooShort {
                    expected: self.pos + 3,
                    actual: self.data.len(),
                }),
            ));
        }

        let field_type = self.data[self.pos];
        let length = BigEndian::read_u16(&self.data[self.pos + 1..self.pos + 3]) as usize;
        let value_start = self.pos + 3;
        if self.data.len() - value_start < length {
            self.failed = true;
            return Some((
                field_type,
                Err(DecodeError::BadLengthField {
                    field: "tlv",
                    value: length,
                }),
            ));
        }

        self.pos = value_start + length;
        Some((field_type, Ok(&self.data[value_start..value_start + length])))
    }
}

fn write_field(buffer: &mut Vec<u8>, field_type: u8, value: &[u8]) {
    buffer.push(field_type);
    buffer.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buffer.extend_from_slice(value);
}

fn write_str(
    buffer: &mut Vec<u8>,
    field_type: u8,
    value: &str,
    field: &'static str,
    limit: usize,
) -> DecodeResult<()> {
    if value.len() > limit {
        return Err(DecodeError::FieldExceedsLimit {
            field,
            limit,
            actual: value.len(),
        });
    }
    write_field(buffer, field_type, value.as_bytes());
    Ok(())
}

fn read_str(value: &[u8], field: &'static str, limit: usize) -> DecodeResult<String> {
    if value.len() > limit {
        return Err(DecodeError::FieldExceedsLimit {
            field,
            limit,
            actual: value.len(),
        });
    }
    String::from_utf8(value.to_vec()).map_err(|_| DecodeError::BadLengthField {
        field,
        value: value.len(),
    })
}

fn read_fixed<const N: usize>(value: &[u8], field: &'static str) -> DecodeResult<[u8; N]> {
    if value.len() != N {
        return Err(DecodeError::BadLengthField {
            field,
            value: value.len(),
        });
    }
    let mut array = [0u8; N];
    array.copy_from_slice(value);
    Ok(array)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roundtrip() {
        let payload = MessagePayload {
            nickname: Some("alice".to_string()),
            content: "hello #general".to_string(),
            channel: Some("#general".to_string()),
            mentions: vec!["bob".to_string(), "carol".to_string()],
            reply_to: Some(MessageId::from_bytes([7; 16])),
        };

        let bytes = payload.encode().unwrap();
        assert_eq!(MessagePayload::decode(&bytes).unwrap(), payload);
    }

    #[test]
    fn test_minimal_message() {
        let payload = MessagePayload::new("hi");
        let bytes = payload.encode().unwrap();
        assert_eq!(MessagePayload::decode(&bytes).unwrap(), payload);
    }

    #[test]
    fn test_unknown_tlv_skipped() {
        let mut bytes = MessagePayload::new("hi").encode().unwrap();
        // Append an unknown field type; decoders must step over it
        bytes.push(0x7E);
        bytes.extend_from_slice(&3u16.to_be_bytes());
        bytes.extend_from_slice(b"xyz");

        let payload = MessagePayload::decode(&bytes).unwrap();
        assert_eq!(payload.content, "hi");
    }

    #[test]
    fn test_missing_content_rejected() {
        let payload = MessagePayload {
            nickname: Some("alice".to_string()),
            ..Default::default()
        };
        let mut bytes = payload.encode().unwrap();
        // Strip the content TLV (it is last after nickname here)
        bytes.truncate(3 + 5);
        assert!(MessagePayload::decode(&bytes).is_err());
    }

    #[test]
    fn test_oversize_nickname_rejected() {
        let payload = MessagePayload {
            nickname: Some("x".repeat(65)),
            content: "hi".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            payload.encode(),
            Err(DecodeError::FieldExceedsLimit { field: "nickname", .. })
        ));
    }

    #[test]
    fn test_too_many_mentions_rejected() {
        let payload = MessagePayload {
            content: "hi".to_string(),
            mentions: (0..101).map(|i| format!("peer{}", i)).collect(),
            ..Default::default()
        };
        assert!(payload.encode().is_err());
    }

    #[test]
    fn test_truncated_tlv_rejected() {
        let mut bytes = MessagePayload::new("hello").encode().unwrap();
        bytes.pop();
        assert!(MessagePayload::decode(&bytes).is_err());
    }

    #[test]
    fn test_announce_roundtrip() {
        let payload = AnnouncePayload {
            nickname: "bob".to_string(),
            noise_static_key: [1; 32],
            signing_key: [2; 32],
            capabilities: 0x03,
        };
        let bytes = payload.encode().unwrap();
        assert_eq!(AnnouncePayload::decode(&bytes).unwrap(), payload);
    }

    #[test]
    fn test_announce_requires_keys() {
        let mut buffer = Vec::new();
        write_str(&mut buffer, TLV_NICKNAME, "bob", "nickname", MAX_NICKNAME_LEN).unwrap();
        assert!(AnnouncePayload::decode(&buffer).is_err());
    }

    #[test]
    fn test_ack_roundtrip() {
        let id = MessageId::from_bytes([9; 16]);
        assert_eq!(decode_ack(&encode_ack(&id)).unwrap(), id);
        assert!(decode_ack(&[1, 2, 3]).is_err());
    }
}
