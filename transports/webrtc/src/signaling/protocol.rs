//! Relay signaling protocol types
//!
//! One JSON object per WebSocket text frame, discriminated by a top-level
//! `type` field in snake_case.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a published stream, assigned by the relay
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Create a stream id from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Session description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as exchanged on the wire: `{"type": "offer", "sdp": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in its browser JSON shape (`sdpMid`, `sdpMLineIndex`, ...)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Messages sent from the client to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Register as the publisher of a new stream
    StartSending,

    /// Subscribe to a stream; `None` lets the relay pick one
    StartReceiving {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_id: Option<StreamId>,
    },

    /// Request the current stream list
    GetAvailableStreams,

    /// Leave the current stream without closing the channel
    StopStream,

    /// Trickle a local ICE candidate
    IceCandidate { candidate: IceCandidate },

    /// Local offer (sender role)
    WebrtcOffer { offer: SessionDescription },

    /// Local answer (receiver role)
    WebrtcAnswer { answer: SessionDescription },
}

/// Messages sent from the relay to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Relay accepted `start_sending` and awaits an offer
    SenderReady {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
    },

    /// Relay offer (receiver role)
    WebrtcOffer { offer: SessionDescription },

    /// Relay answer (sender role)
    WebrtcAnswer { answer: SessionDescription },

    /// Relay trickle candidate; `None` marks end of candidates
    IceCandidate {
        #[serde(default)]
        candidate: Option<IceCandidate>,
    },

    /// Full stream list, in relay order
    AvailableStreams { streams: Vec<StreamId> },

    /// A stream was published
    StreamAvailable { stream_id: StreamId },

    /// A stream ended
    StreamEnded { stream_id: StreamId },

    /// Relay timing sample in seconds since the Unix epoch
    AudioData { timestamp: f64 },

    /// Relay-side refusal or failure
    Error { message: String },

    /// Any type this client does not understand
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Serialize to a wire frame
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire name of this message
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::StartSending => "start_sending",
            ClientMessage::StartReceiving { .. } => "start_receiving",
            ClientMessage::GetAvailableStreams => "get_available_streams",
            ClientMessage::StopStream => "stop_stream",
            ClientMessage::IceCandidate { .. } => "ice_candidate",
            ClientMessage::WebrtcOffer { .. } => "webrtc_offer",
            ClientMessage::WebrtcAnswer { .. } => "webrtc_answer",
        }
    }
}

impl ServerMessage {
    /// Parse a wire frame
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Wire name of this message
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::SenderReady { .. } => "sender_ready",
            ServerMessage::WebrtcOffer { .. } => "webrtc_offer",
            ServerMessage::WebrtcAnswer { .. } => "webrtc_answer",
            ServerMessage::IceCandidate { .. } => "ice_candidate",
            ServerMessage::AvailableStreams { .. } => "available_streams",
            ServerMessage::StreamAvailable { .. } => "stream_available",
            ServerMessage::StreamEnded { .. } => "stream_ended",
            ServerMessage::AudioData { .. } => "audio_data",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Unknown => "unknown",
        }
    }
}
