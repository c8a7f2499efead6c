//! Error types shared across the pipeline.

use thiserror::Error;

use crate::codec::VideoCodec;

/// Failures reported by the platform decoder.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Decoder configure failed: {0}")]
    Configure(String),

    #[error("Decoder start failed: {0}")]
    Start(String),

    #[error("Failed to dequeue input buffer: {0}")]
    DequeueInput(String),

    #[error("Failed to queue input buffer {index}: {reason}")]
    QueueInput { index: usize, reason: String },

    #[error("Failed to dequeue output buffer: {0}")]
    DequeueOutput(String),

    #[error("Failed to release output buffer {index}: {reason}")]
    ReleaseOutput { index: usize, reason: String },

    #[error("Invalid buffer index: {0}")]
    InvalidIndex(usize),

    #[error("Decoder has been released")]
    Released,
}

/// Errors raised while building or driving a decoder session.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Decoder initialization failed for {codec}: {reason}")]
    DecoderInit { codec: VideoCodec, reason: String },

    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),

    #[error("Session is stopping")]
    SessionStopped,

    #[error("Session already started")]
    AlreadyStarted,

    #[error("Failed to spawn presentation thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_error_display() {
        let err = CodecError::QueueInput {
            index: 4,
            reason: "bad state".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains('4'));
        assert!(msg.contains("bad state"));

        let err = CodecError::InvalidIndex(19);
        assert_eq!(err.to_string(), "Invalid buffer index: 19");
    }

    #[test]
    fn decode_error_display() {
        let err = DecodeError::DecoderInit {
            codec: VideoCodec::H264,
            reason: "no surface".into(),
        };
        assert_eq!(
            err.to_string(),
            "Decoder initialization failed for H.264: no surface"
        );

        let err = DecodeError::InvalidConfig("refresh rate is zero".into());
        assert!(err.to_string().contains("refresh rate"));
    }

    #[test]
    fn codec_error_converts_transparently() {
        let err: DecodeError = CodecError::Configure("rejected format".into()).into();
        assert_eq!(err.to_string(), "Decoder configure failed: rejected format");
    }
}
