//! Signaling transport: a reconnecting channel exchanging typed JSON events
//! with the relay.

pub mod backoff;
pub mod client;
pub mod connector;
pub mod endpoint;
pub mod protocol;

pub use backoff::{reconnect_message, ReconnectPolicy};
pub use client::{ChannelStatus, SignalingClient, SignalingEvent, MAX_RETRIES_MESSAGE};
pub use connector::{FrameSink, FrameStream, SignalingChannel, SignalingConnector, WebSocketConnector};
pub use endpoint::resolve_endpoint;
pub use protocol::{
    ClientMessage, IceCandidate, SdpType, ServerMessage, SessionDescription, StreamId,
};
