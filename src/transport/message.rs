//! Wire messages and frame codec
//!
//! Every message travels in one length-prefixed frame:
//!
//! ```text
//! +-----------+----------------+---------+-----------------+
//! | Length(4) | Participant(8) | Type(1) | Payload(N)      |
//! +-----------+----------------+---------+-----------------+
//! ```
//!
//! `Length` counts everything after itself. All integers are big-endian.
//! Strings carry a 16-bit length prefix, byte blobs a 32-bit one.
//!
//! Participant identifiers are encoded as:
//!
//! ```text
//! | Id(8) | NameLen(2) | Name | AddrTag(1) | Ip(4 or 16) | Port(2) |
//! ```
//!
//! with `AddrTag` 0 meaning "no address" (and no ip/port bytes following).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::TransportError;
use crate::types::{ParticipantId, ParticipantIdentifier, SceneId};

/// Size of length + participant + type
pub const FRAME_HEADER_SIZE: usize = 4 + 8 + 1;

// Message type markers
const TYPE_HELLO: u8 = 0x01;
const TYPE_KEEP_ALIVE: u8 = 0x02;
const TYPE_SCENES_AVAILABLE: u8 = 0x10;
const TYPE_SCENES_UNAVAILABLE: u8 = 0x11;
const TYPE_SUBSCRIBE_SCENE: u8 = 0x12;
const TYPE_UNSUBSCRIBE_SCENE: u8 = 0x13;
const TYPE_SUBSCRIPTION_ACK: u8 = 0x14;
const TYPE_UNSUBSCRIPTION_ACK: u8 = 0x15;
const TYPE_SCENE_UPDATE: u8 = 0x16;
const TYPE_REGISTER: u8 = 0x20;
const TYPE_RESOLVE: u8 = 0x21;
const TYPE_RESOLVED: u8 = 0x22;

const ADDR_NONE: u8 = 0;
const ADDR_V4: u8 = 4;
const ADDR_V6: u8 = 6;

/// Scene announcement entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneInfo {
    pub scene: SceneId,
    pub name: String,
}

impl SceneInfo {
    pub fn new(scene: SceneId, name: impl Into<String>) -> Self {
        Self {
            scene,
            name: name.into(),
        }
    }
}

/// Message exchanged between participants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// First frame on every connection, in both directions
    Hello {
        identifier: ParticipantIdentifier,
        protocol_version: u32,
    },
    /// Liveness signal, carries nothing
    KeepAlive,
    /// Scenes the sender has published
    ScenesAvailable(Vec<SceneInfo>),
    /// Scenes the sender has withdrawn
    ScenesUnavailable(Vec<SceneId>),
    /// Renderer asks the owning client for scene content
    SubscribeScene(SceneId),
    /// Renderer no longer wants scene content
    UnsubscribeScene(SceneId),
    /// Client confirms a subscription
    SubscriptionAck(SceneId),
    /// Client confirms an unsubscription
    UnsubscriptionAck(SceneId),
    /// One flush worth of scene content
    SceneUpdate {
        scene: SceneId,
        flush_index: u64,
        /// Milliseconds since the Unix epoch, zero on the wire when unset
        expires_at: Option<u64>,
        payload: Bytes,
    },
    /// Register the sender with the discovery daemon
    Register(ParticipantIdentifier),
    /// Ask the discovery daemon for a participant's address
    Resolve(ParticipantId),
    /// Discovery daemon answer
    Resolved(Option<ParticipantIdentifier>),
}

impl Message {
    fn type_marker(&self) -> u8 {
        match self {
            Message::Hello { .. } => TYPE_HELLO,
            Message::KeepAlive => TYPE_KEEP_ALIVE,
            Message::ScenesAvailable(_) => TYPE_SCENES_AVAILABLE,
            Message::ScenesUnavailable(_) => TYPE_SCENES_UNAVAILABLE,
            Message::SubscribeScene(_) => TYPE_SUBSCRIBE_SCENE,
            Message::UnsubscribeScene(_) => TYPE_UNSUBSCRIBE_SCENE,
            Message::SubscriptionAck(_) => TYPE_SUBSCRIPTION_ACK,
            Message::UnsubscriptionAck(_) => TYPE_UNSUBSCRIPTION_ACK,
            Message::SceneUpdate { .. } => TYPE_SCENE_UPDATE,
            Message::Register(_) => TYPE_REGISTER,
            Message::Resolve(_) => TYPE_RESOLVE,
            Message::Resolved(_) => TYPE_RESOLVED,
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::KeepAlive => "keep-alive",
            Message::ScenesAvailable(_) => "scenes-available",
            Message::ScenesUnavailable(_) => "scenes-unavailable",
            Message::SubscribeScene(_) => "subscribe",
            Message::UnsubscribeScene(_) => "unsubscribe",
            Message::SubscriptionAck(_) => "subscription-ack",
            Message::UnsubscriptionAck(_) => "unsubscription-ack",
            Message::SceneUpdate { .. } => "scene-update",
            Message::Register(_) => "register",
            Message::Resolve(_) => "resolve",
            Message::Resolved(_) => "resolved",
        }
    }
}

/// A decoded frame: message plus the participant that sent it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub sender: ParticipantId,
    pub message: Message,
}

/// Encode a message into a complete frame
pub fn encode(sender: ParticipantId, message: &Message) -> Bytes {
    let mut body = BytesMut::with_capacity(64);
    encode_payload(message, &mut body);

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.put_u32((8 + 1 + body.len()) as u32);
    frame.put_u64(sender.0);
    frame.put_u8(message.type_marker());
    frame.put_slice(&body);
    frame.freeze()
}

fn encode_payload(message: &Message, buf: &mut BytesMut) {
    match message {
        Message::Hello {
            identifier,
            protocol_version,
        } => {
            buf.put_u32(*protocol_version);
            put_identifier(buf, identifier);
        }
        Message::KeepAlive => {}
        Message::ScenesAvailable(scenes) => {
            buf.put_u32(scenes.len() as u32);
            for info in scenes {
                buf.put_u64(info.scene.0);
                put_string(buf, &info.name);
            }
        }
        Message::ScenesUnavailable(scenes) => {
            buf.put_u32(scenes.len() as u32);
            for scene in scenes {
                buf.put_u64(scene.0);
            }
        }
        Message::SubscribeScene(scene)
        | Message::UnsubscribeScene(scene)
        | Message::SubscriptionAck(scene)
        | Message::UnsubscriptionAck(scene) => {
            buf.put_u64(scene.0);
        }
        Message::SceneUpdate {
            scene,
            flush_index,
            expires_at,
            payload,
        } => {
            buf.put_u64(scene.0);
            buf.put_u64(*flush_index);
            buf.put_u64(expires_at.unwrap_or(0));
            buf.put_u32(payload.len() as u32);
            buf.put_slice(payload);
        }
        Message::Register(identifier) => put_identifier(buf, identifier),
        Message::Resolve(id) => buf.put_u64(id.0),
        Message::Resolved(identifier) => match identifier {
            Some(identifier) => {
                buf.put_u8(1);
                put_identifier(buf, identifier);
            }
            None => buf.put_u8(0),
        },
    }
}

/// Length-prefixed UTF-8, cut at the last char boundary that fits a u16
fn put_string(buf: &mut BytesMut, s: &str) {
    let mut len = s.len().min(u16::MAX as usize);
    while !s.is_char_boundary(len) {
        len -= 1;
    }
    buf.put_u16(len as u16);
    buf.put_slice(&s.as_bytes()[..len]);
}

fn put_identifier(buf: &mut BytesMut, identifier: &ParticipantIdentifier) {
    buf.put_u64(identifier.id.0);
    put_string(buf, &identifier.name);
    match identifier.address {
        None => buf.put_u8(ADDR_NONE),
        Some(SocketAddr::V4(addr)) => {
            buf.put_u8(ADDR_V4);
            buf.put_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
        }
        Some(SocketAddr::V6(addr)) => {
            buf.put_u8(ADDR_V6);
            buf.put_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
        }
    }
}

/// Incremental frame decoder
///
/// Bytes are appended to the caller's `BytesMut`; complete frames are split
/// off the front, partial frames stay in the buffer until more data arrives.
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Decode the next complete frame, if any
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<WireMessage>, TransportError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if length < 9 {
            return Err(malformed(format!("frame length {length} below header size")));
        }
        if length + 4 > self.max_frame_size {
            return Err(malformed(format!(
                "frame of {} bytes exceeds limit of {}",
                length + 4,
                self.max_frame_size
            )));
        }
        if buf.len() < 4 + length {
            return Ok(None); // Need more data
        }

        buf.advance(4);
        let mut frame = buf.split_to(length).freeze();
        let sender = ParticipantId(frame.get_u64());
        let marker = frame.get_u8();
        let message = decode_payload(marker, &mut frame)?;

        if frame.has_remaining() {
            return Err(malformed(format!(
                "{} trailing bytes after {}",
                frame.remaining(),
                message.kind()
            )));
        }

        Ok(Some(WireMessage { sender, message }))
    }
}

fn malformed(reason: String) -> TransportError {
    TransportError::MalformedMessage(reason)
}

fn need(buf: &Bytes, n: usize) -> Result<(), TransportError> {
    if buf.remaining() < n {
        Err(malformed(format!(
            "needed {n} bytes, {} remaining",
            buf.remaining()
        )))
    } else {
        Ok(())
    }
}

fn decode_payload(marker: u8, buf: &mut Bytes) -> Result<Message, TransportError> {
    let message = match marker {
        TYPE_HELLO => {
            need(buf, 4)?;
            let protocol_version = buf.get_u32();
            let identifier = get_identifier(buf)?;
            Message::Hello {
                identifier,
                protocol_version,
            }
        }
        TYPE_KEEP_ALIVE => Message::KeepAlive,
        TYPE_SCENES_AVAILABLE => {
            let count = get_count(buf, 8 + 2)?;
            let mut scenes = Vec::with_capacity(count);
            for _ in 0..count {
                need(buf, 8)?;
                let scene = SceneId(buf.get_u64());
                let name = get_string(buf)?;
                scenes.push(SceneInfo { scene, name });
            }
            Message::ScenesAvailable(scenes)
        }
        TYPE_SCENES_UNAVAILABLE => {
            let count = get_count(buf, 8)?;
            let mut scenes = Vec::with_capacity(count);
            for _ in 0..count {
                scenes.push(SceneId(buf.get_u64()));
            }
            Message::ScenesUnavailable(scenes)
        }
        TYPE_SUBSCRIBE_SCENE => Message::SubscribeScene(get_scene(buf)?),
        TYPE_UNSUBSCRIBE_SCENE => Message::UnsubscribeScene(get_scene(buf)?),
        TYPE_SUBSCRIPTION_ACK => Message::SubscriptionAck(get_scene(buf)?),
        TYPE_UNSUBSCRIPTION_ACK => Message::UnsubscriptionAck(get_scene(buf)?),
        TYPE_SCENE_UPDATE => {
            need(buf, 8 + 8 + 8 + 4)?;
            let scene = SceneId(buf.get_u64());
            let flush_index = buf.get_u64();
            let expires_at = Some(buf.get_u64()).filter(|&ms| ms != 0);
            let len = buf.get_u32() as usize;
            need(buf, len)?;
            // Zero-copy: payload shares the frame allocation
            let payload = buf.split_to(len);
            Message::SceneUpdate {
                scene,
                flush_index,
                expires_at,
                payload,
            }
        }
        TYPE_REGISTER => Message::Register(get_identifier(buf)?),
        TYPE_RESOLVE => {
            need(buf, 8)?;
            Message::Resolve(ParticipantId(buf.get_u64()))
        }
        TYPE_RESOLVED => {
            need(buf, 1)?;
            match buf.get_u8() {
                0 => Message::Resolved(None),
                1 => Message::Resolved(Some(get_identifier(buf)?)),
                other => return Err(malformed(format!("invalid resolved flag {other}"))),
            }
        }
        other => return Err(malformed(format!("unknown message type {other:#04x}"))),
    };
    Ok(message)
}

/// Read an element count and check that at least `min_element_size` bytes per element remain
fn get_count(buf: &mut Bytes, min_element_size: usize) -> Result<usize, TransportError> {
    need(buf, 4)?;
    let count = buf.get_u32() as usize;
    need(buf, count.saturating_mul(min_element_size))?;
    Ok(count)
}

fn get_scene(buf: &mut Bytes) -> Result<SceneId, TransportError> {
    need(buf, 8)?;
    Ok(SceneId(buf.get_u64()))
}

fn get_string(buf: &mut Bytes) -> Result<String, TransportError> {
    need(buf, 2)?;
    let len = buf.get_u16() as usize;
    need(buf, len)?;
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| malformed("invalid UTF-8 in string".into()))
}

fn get_identifier(buf: &mut Bytes) -> Result<ParticipantIdentifier, TransportError> {
    need(buf, 8)?;
    let id = ParticipantId(buf.get_u64());
    let name = get_string(buf)?;
    need(buf, 1)?;
    let address = match buf.get_u8() {
        ADDR_NONE => None,
        ADDR_V4 => {
            need(buf, 4 + 2)?;
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        ADDR_V6 => {
            need(buf, 16 + 2)?;
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        other => return Err(malformed(format!("invalid address tag {other}"))),
    };
    Ok(ParticipantIdentifier { id, name, address })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(frame: Bytes) -> WireMessage {
        let mut buf = BytesMut::from(&frame[..]);
        let decoder = FrameDecoder::new(1024 * 1024);
        let msg = decoder.decode(&mut buf).unwrap().expect("complete frame");
        assert!(buf.is_empty());
        msg
    }

    #[test]
    fn test_hello_with_address() {
        let identifier =
            ParticipantIdentifier::new(12, "renderer-1", "10.0.0.7:5000".parse().unwrap());
        let frame = encode(
            ParticipantId(12),
            &Message::Hello {
                identifier: identifier.clone(),
                protocol_version: 3,
            },
        );

        let decoded = decode_one(frame);
        assert_eq!(decoded.sender, ParticipantId(12));
        assert_eq!(
            decoded.message,
            Message::Hello {
                identifier,
                protocol_version: 3
            }
        );
    }

    #[test]
    fn test_resolved_ipv6_identifier() {
        let identifier = ParticipantIdentifier::new(5, "client", "[::1]:6000".parse().unwrap());
        let frame = encode(ParticipantId(0), &Message::Resolved(Some(identifier.clone())));

        let decoded = decode_one(frame);
        assert_eq!(decoded.message, Message::Resolved(Some(identifier)));
    }

    #[test]
    fn test_long_name_is_cut_between_chars() {
        let identifier = ParticipantIdentifier::unresolved(5, "é".repeat(32_768));
        let frame = encode(ParticipantId(5), &Message::Register(identifier));

        match decode_one(frame).message {
            Message::Register(decoded) => {
                assert_eq!(decoded.name.len(), 65_534);
                assert_eq!(decoded.name, "é".repeat(32_767));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_scene_update_payload_is_preserved() {
        let payload = Bytes::from_static(&[1, 2, 3, 4, 5]);
        let frame = encode(
            ParticipantId(3),
            &Message::SceneUpdate {
                scene: SceneId(42),
                flush_index: 7,
                expires_at: Some(1_700_000_000_000),
                payload: payload.clone(),
            },
        );

        match decode_one(frame).message {
            Message::SceneUpdate {
                scene,
                flush_index,
                expires_at,
                payload: decoded,
            } => {
                assert_eq!(scene, SceneId(42));
                assert_eq!(flush_index, 7);
                assert_eq!(expires_at, Some(1_700_000_000_000));
                assert_eq!(decoded, payload);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_partial_frame_waits_for_more_data() {
        let frame = encode(
            ParticipantId(1),
            &Message::ScenesAvailable(vec![SceneInfo::new(SceneId(1), "dashboard")]),
        );
        let decoder = FrameDecoder::new(1024);
        let mut buf = BytesMut::from(&frame[..frame.len() - 3]);

        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[frame.len() - 3..]);
        let msg = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            msg.message,
            Message::ScenesAvailable(vec![SceneInfo::new(SceneId(1), "dashboard")])
        );
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(ParticipantId(1), &Message::KeepAlive));
        buf.extend_from_slice(&encode(ParticipantId(1), &Message::SubscribeScene(SceneId(9))));
        let decoder = FrameDecoder::new(1024);

        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().message, Message::KeepAlive);
        assert_eq!(
            decoder.decode(&mut buf).unwrap().unwrap().message,
            Message::SubscribeScene(SceneId(9))
        );
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let frame = encode(
            ParticipantId(1),
            &Message::SceneUpdate {
                scene: SceneId(1),
                flush_index: 0,
                expires_at: None,
                payload: Bytes::from(vec![0u8; 256]),
            },
        );
        let decoder = FrameDecoder::new(128);
        let mut buf = BytesMut::from(&frame[..]);

        assert!(matches!(
            decoder.decode(&mut buf),
            Err(TransportError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(9);
        buf.put_u64(1);
        buf.put_u8(0x7F);
        let decoder = FrameDecoder::new(1024);

        assert!(matches!(
            decoder.decode(&mut buf),
            Err(TransportError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        // Scene count claims 1000 entries but none follow
        let mut buf = BytesMut::new();
        buf.put_u32(9 + 4);
        buf.put_u64(1);
        buf.put_u8(TYPE_SCENES_UNAVAILABLE);
        buf.put_u32(1000);
        let decoder = FrameDecoder::new(1024);

        assert!(decoder.decode(&mut buf).is_err());
    }
}
