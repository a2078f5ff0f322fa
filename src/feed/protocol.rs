// src/feed/protocol.rs - Control envelope and binary frame format
//
// Text frames carry a JSON control envelope:
//   { "type": "SUBSCRIBE" | "UNSUBSCRIBE" | "QUERY" | "ERROR", "channel": u32, "content": ... }
// Binary frames in multiplexed mode are prefixed with a 4-byte big-endian channel id.
// Single-channel mode sends bare chunks and omits "channel".

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Channel identifier as carried on the wire.
pub type ChannelId = u32;

/// Implicit channel used in single-channel mode.
pub const SINGLE_CHANNEL_ID: ChannelId = 0;

/// Size of the channel id prefix on multiplexed binary frames.
pub const CHANNEL_PREFIX_LEN: usize = 4;

/// Whether one transport carries several channels or a single implicit one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// Binary frames are prefixed with a channel id, envelopes carry `channel`.
    Multiplexed,
    /// One implicit channel, bare chunks, connection-scoped recovery.
    Single,
}

impl ChannelMode {
    /// Local channel id for a caller-supplied id. Single-channel mode maps every id
    /// to [`SINGLE_CHANNEL_ID`].
    pub fn resolve(self, channel: ChannelId) -> ChannelId {
        match self {
            ChannelMode::Single => SINGLE_CHANNEL_ID,
            ChannelMode::Multiplexed => channel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Subscribe,
    Unsubscribe,
    Query,
    Error,
    #[serde(other)]
    Unknown,
}

/// Control envelope exchanged as a text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,

    /// Omitted in single-channel mode. Older servers call this field `number`.
    #[serde(alias = "number", default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelId>,

    /// A codec descriptor for SUBSCRIBE acknowledgements, free text or a JSON
    /// value (e.g. the channel name list answering a QUERY) otherwise.
    #[serde(default)]
    pub content: serde_json::Value,
}

impl ControlMessage {
    pub fn subscribe(channel: Option<ChannelId>, params: impl Into<String>) -> Self {
        Self::new(MessageType::Subscribe, channel, params)
    }

    pub fn unsubscribe(channel: Option<ChannelId>) -> Self {
        Self::new(MessageType::Unsubscribe, channel, "")
    }

    pub fn query(channel: Option<ChannelId>, content: impl Into<String>) -> Self {
        Self::new(MessageType::Query, channel, content)
    }

    fn new(message_type: MessageType, channel: Option<ChannelId>, content: impl Into<String>) -> Self {
        Self {
            message_type,
            channel,
            content: serde_json::Value::String(content.into()),
        }
    }

    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize to the text frame sent over the transport.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Content rendered as text: strings verbatim, other JSON values as JSON.
    pub fn content_text(&self) -> String {
        match &self.content {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    /// Channel this envelope addresses under the given mode.
    pub fn channel_for(&self, mode: ChannelMode) -> Option<ChannelId> {
        match mode {
            ChannelMode::Single => Some(SINGLE_CHANNEL_ID),
            ChannelMode::Multiplexed => self.channel,
        }
    }
}

/// Split an incoming binary frame into its channel id and chunk.
///
/// The chunk is a zero-copy slice of `frame`.
pub fn decode_binary(frame: Bytes, mode: ChannelMode) -> Result<(ChannelId, Bytes)> {
    match mode {
        ChannelMode::Single => Ok((SINGLE_CHANNEL_ID, frame)),
        ChannelMode::Multiplexed => {
            if frame.len() < CHANNEL_PREFIX_LEN {
                return Err(Error::MalformedFrame(format!(
                    "{} bytes is shorter than the {}-byte channel prefix",
                    frame.len(),
                    CHANNEL_PREFIX_LEN
                )));
            }
            let channel = BigEndian::read_u32(&frame[..CHANNEL_PREFIX_LEN]);
            Ok((channel, frame.slice(CHANNEL_PREFIX_LEN..)))
        }
    }
}

/// Build a binary frame the way a multiplexing server does.
pub fn encode_binary(channel: ChannelId, chunk: &[u8], mode: ChannelMode) -> Bytes {
    match mode {
        ChannelMode::Single => Bytes::copy_from_slice(chunk),
        ChannelMode::Multiplexed => {
            let mut buf = BytesMut::with_capacity(CHANNEL_PREFIX_LEN + chunk.len());
            let mut prefix = [0u8; CHANNEL_PREFIX_LEN];
            BigEndian::write_u32(&mut prefix, channel);
            buf.put_slice(&prefix);
            buf.put_slice(chunk);
            buf.freeze()
        }
    }
}

/// Sink MIME type for a codec descriptor, e.g. `video/mp4; codecs="avc1.64001f"`.
pub fn mime_type(container: &str, codec: &str) -> String {
    format!("{}; codecs=\"{}\"", container, codec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscribe_ack() {
        let msg = ControlMessage::parse(r#"{"type":"SUBSCRIBE","channel":7,"content":"avc1.64001f"}"#)
            .unwrap();
        assert_eq!(msg.message_type, MessageType::Subscribe);
        assert_eq!(msg.channel, Some(7));
        assert_eq!(msg.content_text(), "avc1.64001f");
    }

    #[test]
    fn test_parse_accepts_number_alias() {
        let msg = ControlMessage::parse(r#"{"type":"ERROR","number":3,"content":"no such channel"}"#)
            .unwrap();
        assert_eq!(msg.message_type, MessageType::Error);
        assert_eq!(msg.channel, Some(3));
    }

    #[test]
    fn test_parse_unknown_type_and_json_content() {
        let msg = ControlMessage::parse(r#"{"type":"HEARTBEAT","content":["cam1","cam2"]}"#).unwrap();
        assert_eq!(msg.message_type, MessageType::Unknown);
        assert_eq!(msg.channel, None);
        assert_eq!(msg.content_text(), r#"["cam1","cam2"]"#);
    }

    #[test]
    fn test_parse_rejects_non_json() {
        let result = ControlMessage::parse("avc1.42e01e");
        assert!(matches!(result, Err(Error::InvalidEnvelope(_))));
    }

    #[test]
    fn test_subscribe_serialization() {
        let text = ControlMessage::subscribe(Some(7), "cam-7").to_text().unwrap();
        assert_eq!(text, r#"{"type":"SUBSCRIBE","channel":7,"content":"cam-7"}"#);

        // Single-channel mode omits the channel field
        let text = ControlMessage::unsubscribe(None).to_text().unwrap();
        assert_eq!(text, r#"{"type":"UNSUBSCRIBE","content":""}"#);
    }

    #[test]
    fn test_mode_resolves_channel_ids() {
        assert_eq!(ChannelMode::Multiplexed.resolve(42), 42);
        assert_eq!(ChannelMode::Single.resolve(42), SINGLE_CHANNEL_ID);
    }

    #[test]
    fn test_decode_multiplexed_frame() {
        let frame = Bytes::from_static(&[0x00, 0x00, 0x01, 0x02, 0xAA, 0xBB]);
        let (channel, chunk) = decode_binary(frame, ChannelMode::Multiplexed).unwrap();
        assert_eq!(channel, 258);
        assert_eq!(&chunk[..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_decode_prefix_only_frame_yields_empty_chunk() {
        let frame = Bytes::from_static(&[0, 0, 0, 9]);
        let (channel, chunk) = decode_binary(frame, ChannelMode::Multiplexed).unwrap();
        assert_eq!(channel, 9);
        assert!(chunk.is_empty());
    }

    #[test]
    fn test_decode_short_frame_is_malformed() {
        let frame = Bytes::from_static(&[0, 1]);
        assert!(matches!(
            decode_binary(frame, ChannelMode::Multiplexed),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_single_mode_frame_is_whole_chunk() {
        let frame = Bytes::from_static(&[0, 0, 0, 9, 1]);
        let (channel, chunk) = decode_binary(frame, ChannelMode::Single).unwrap();
        assert_eq!(channel, SINGLE_CHANNEL_ID);
        assert_eq!(chunk.len(), 5);
    }

    #[test]
    fn test_encode_binary_prefix() {
        let frame = encode_binary(0x01020304, b"xy", ChannelMode::Multiplexed);
        assert_eq!(&frame[..], &[1, 2, 3, 4, b'x', b'y']);
    }

    #[test]
    fn test_mime_type() {
        assert_eq!(
            mime_type("video/mp4", "avc1.64001f"),
            "video/mp4; codecs=\"avc1.64001f\""
        );
    }
}
