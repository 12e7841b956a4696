//! Media transport abstraction
//!
//! The session owns exactly one [`MediaTransport`] at a time and drives the
//! offer/answer exchange through it. Asynchronous transport happenings
//! (local candidates, ICE state, inbound tracks) arrive as
//! [`TransportEvent`]s on the channel handed to the factory.

use super::stream::MediaStream;
use crate::config::TransportConfig;
use crate::signaling::protocol::{IceCandidate, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Offer/answer state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// ICE connectivity state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Events raised by a live transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local candidate to trickle to the relay
    IceCandidate(IceCandidate),
    /// ICE connectivity changed
    IceConnectionState(IceConnectionState),
    /// An inbound audio stream is playable
    Track(MediaStream),
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// A negotiated media transport
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Send the audio of `stream` once negotiated
    async fn add_track(&self, stream: &MediaStream) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a local description; returns the description as applied
    async fn set_local_description(&self, desc: SessionDescription) -> Result<SessionDescription>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    /// Close the transport and stop its event delivery
    async fn close(&self) -> Result<()>;
}

/// Creates transports on demand
#[async_trait]
pub trait MediaTransportFactory: Send + Sync {
    async fn create(
        &self,
        config: &TransportConfig,
        events: TransportEventSender,
    ) -> Result<Arc<dyn MediaTransport>>;
}
