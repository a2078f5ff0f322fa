use crate::feed::protocol::ChannelId;

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The sink cannot play the negotiated codec. Fatal for the channel, never retried.
    #[error("Channel {channel}: unsupported MIME type or codec: {mime}")]
    UnsupportedCodec { channel: ChannelId, mime: String },

    /// The sink refused a chunk (malformed data, bad timestamps, invalid sink state).
    #[error("Channel {channel}: append rejected: {reason}")]
    AppendRejected { channel: ChannelId, reason: String },

    #[error("Transport closed")]
    TransportClosed,

    #[error("Transport error: {0}")]
    TransportError(String),

    /// Data or control message addressed to a channel with no active subscription.
    #[error("Unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("Malformed binary frame: {0}")]
    MalformedFrame(String),

    #[error("Invalid control envelope: {0}")]
    InvalidEnvelope(#[from] serde_json::Error),

    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Feed supervisor already stopped")]
    SupervisorStopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Channel-local failures trigger a channel (or connection) reset; everything
    /// else belongs to the transport or the caller.
    pub fn is_channel_local(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedCodec { .. } | Error::AppendRejected { .. }
        )
    }
}

/// Failure reported by a [`MediaSink`](crate::feed::sink::MediaSink) implementation.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    /// The sink has no source buffer yet, or it was detached.
    #[error("sink is not open")]
    NotOpen,

    /// The sink is still processing a previous append or removal.
    #[error("sink is busy")]
    Busy,

    /// The decoder refused the data.
    #[error("sink rejected data: {0}")]
    Rejected(String),

    #[error("invalid removal range [{start}, {end}]")]
    InvalidRange { start: f64, end: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_local_classification() {
        let rejected = Error::AppendRejected {
            channel: 3,
            reason: "bad timestamps".to_string(),
        };
        assert!(rejected.is_channel_local());
        assert!(!Error::TransportClosed.is_channel_local());
        assert!(!Error::UnknownChannel(9).is_channel_local());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::UnsupportedCodec {
            channel: 7,
            mime: "video/mp4; codecs=\"hev1\"".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Channel 7: unsupported MIME type or codec: video/mp4; codecs=\"hev1\""
        );
        assert_eq!(SinkError::Busy.to_string(), "sink is busy");
    }
}
