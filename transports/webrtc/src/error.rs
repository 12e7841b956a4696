//! Error types for relay sessions
//!
//! Every variant carries a plain message. [`Error::message`] returns it
//! without the category prefix; that is the text observers see in
//! `StateChanged` events.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Rejected configuration, including an unparseable relay endpoint
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),

    /// Signaling channel could not be used
    #[error("signaling failed: {0}")]
    SignalingError(String),

    #[error("websocket failure: {0}")]
    WebSocketError(String),

    /// Offer/answer step failed
    #[error("session description rejected: {0}")]
    SdpError(String),

    #[error("ice candidate rejected: {0}")]
    IceCandidateError(String),

    /// Connectivity checks gave up
    #[error("ice connectivity lost: {0}")]
    IceFailed(String),

    /// Microphone missing, busy or denied
    #[error("audio capture unavailable: {0}")]
    CaptureError(String),

    #[error("audio track failure: {0}")]
    MediaTrackError(String),

    /// Opus encode or decode failed
    #[error("opus codec failure: {0}")]
    EncodingError(String),

    #[error("peer connection failure: {0}")]
    PeerConnectionError(String),

    /// Raised by the `webrtc` stack itself
    #[error("webrtc stack failure: {0}")]
    WebRtcError(String),

    #[error("session failure: {0}")]
    SessionError(String),

    /// Wire frame could not be encoded or decoded
    #[error("malformed signaling frame: {0}")]
    SerializationError(String),

    #[error("i/o failure: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether the signaling backoff recovers from this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_) | Error::WebSocketError(_) | Error::IoError(_)
        )
    }

    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Whether this error came out of offer/answer or candidate exchange
    pub fn is_negotiation_error(&self) -> bool {
        matches!(
            self,
            Error::SdpError(_)
                | Error::IceCandidateError(_)
                | Error::IceFailed(_)
                | Error::PeerConnectionError(_)
                | Error::WebRtcError(_)
        )
    }

    /// Message without the category prefix, e.g. "Permission denied"
    pub fn message(&self) -> String {
        match self {
            Error::InvalidConfig(m)
            | Error::SignalingError(m)
            | Error::WebSocketError(m)
            | Error::SdpError(m)
            | Error::IceCandidateError(m)
            | Error::IceFailed(m)
            | Error::CaptureError(m)
            | Error::MediaTrackError(m)
            | Error::EncodingError(m)
            | Error::PeerConnectionError(m)
            | Error::WebRtcError(m)
            | Error::SessionError(m)
            | Error::SerializationError(m) => m.clone(),
            Error::IoError(e) => e.to_string(),
            Error::Other(e) => e.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_keeps_category() {
        let err = Error::CaptureError("Permission denied".to_string());
        assert_eq!(
            err.to_string(),
            "audio capture unavailable: Permission denied"
        );
        assert_eq!(err.message(), "Permission denied");
    }

    #[test]
    fn test_endpoint_errors_are_config_errors() {
        let err = Error::InvalidConfig("Invalid Server URL: http://".to_string());
        assert!(err.is_config_error());
        assert!(!err.is_retryable());
        assert_eq!(err.message(), "Invalid Server URL: http://");
    }

    #[test]
    fn test_channel_errors_are_retryable() {
        assert!(Error::WebSocketError("reset by peer".to_string()).is_retryable());
        assert!(Error::SignalingError("closed".to_string()).is_retryable());
        assert!(!Error::SdpError("bad sdp".to_string()).is_retryable());
    }

    #[test]
    fn test_negotiation_errors() {
        assert!(Error::SdpError("bad sdp".to_string()).is_negotiation_error());
        assert!(Error::IceFailed("checks timed out".to_string()).is_negotiation_error());
        assert!(!Error::CaptureError("device busy".to_string()).is_negotiation_error());
    }

    #[test]
    fn test_malformed_frame() {
        let json_err = serde_json::from_str::<serde_json::Value>("{\"type\":").unwrap_err();
        let err = Error::from(json_err);
        assert!(matches!(err, Error::SerializationError(_)));
    }
}
