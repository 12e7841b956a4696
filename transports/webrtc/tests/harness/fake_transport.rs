//! Scripted media transport
//!
//! Tracks the offer/answer state machine, records what the session applied
//! and lets tests hold individual negotiation steps open with a [`Gate`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use voicestream_webrtc::config::TransportConfig;
use voicestream_webrtc::media::{
    IceConnectionState, MediaStream, MediaTransport, MediaTransportFactory, SignalingState,
    TransportEvent, TransportEventSender,
};
use voicestream_webrtc::signaling::{IceCandidate, SdpType, SessionDescription};
use voicestream_webrtc::{Error, Result};

/// Latch that holds async steps until released
#[derive(Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    pub fn open() -> Self {
        Self {
            tx: Arc::new(watch::channel(true).0),
        }
    }

    pub fn closed() -> Self {
        Self {
            tx: Arc::new(watch::channel(false).0),
        }
    }

    pub fn release(&self) {
        self.tx.send_replace(true);
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// Transport whose behaviour the test scripts
pub struct FakeTransport {
    events: TransportEventSender,
    signaling_state: Mutex<SignalingState>,
    closed: AtomicBool,
    local_tracks: Mutex<Vec<MediaStream>>,
    remote: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    remote_gate: Gate,
    fail_remote: Mutex<Option<String>>,
}

impl FakeTransport {
    fn new(events: TransportEventSender, remote_gate: Gate) -> Self {
        Self {
            events,
            signaling_state: Mutex::new(SignalingState::Stable),
            closed: AtomicBool::new(false),
            local_tracks: Mutex::new(Vec::new()),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            remote_gate,
            fail_remote: Mutex::new(None),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Raise an event as the real transport would
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn emit_track(&self, stream: MediaStream) -> bool {
        self.emit(TransportEvent::Track(stream))
    }

    pub fn emit_ice_state(&self, state: IceConnectionState) -> bool {
        self.emit(TransportEvent::IceConnectionState(state))
    }

    pub fn local_tracks(&self) -> usize {
        self.local_tracks.lock().len()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn force_state(&self, state: SignalingState) {
        *self.signaling_state.lock() = state;
    }

    /// Make the next `set_remote_description` fail with `message`
    pub fn fail_remote_with(&self, message: &str) {
        *self.fail_remote.lock() = Some(message.to_string());
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn add_track(&self, stream: &MediaStream) -> Result<()> {
        self.local_tracks.lock().push(stream.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer("v=0\r\ns=fake-offer\r\n"))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if *self.signaling_state.lock() != SignalingState::HaveRemoteOffer {
            return Err(Error::SdpError("no remote offer to answer".to_string()));
        }
        Ok(SessionDescription::answer("v=0\r\ns=fake-answer\r\n"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<SessionDescription> {
        let mut state = self.signaling_state.lock();
        *state = match desc.kind {
            SdpType::Offer => SignalingState::HaveLocalOffer,
            _ => SignalingState::Stable,
        };
        Ok(desc)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.remote_gate.wait().await;
        if let Some(message) = self.fail_remote.lock().take() {
            return Err(Error::SdpError(message));
        }
        *self.signaling_state.lock() = match desc.kind {
            SdpType::Offer => SignalingState::HaveRemoteOffer,
            _ => SignalingState::Stable,
        };
        *self.remote.lock() = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.remote.lock().is_none() {
            return Err(Error::IceCandidateError(
                "remote description not set".to_string(),
            ));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        *self.signaling_state.lock()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        *self.signaling_state.lock() = SignalingState::Closed;
        Ok(())
    }
}

#[derive(Default)]
struct FactoryState {
    transports: Vec<Arc<FakeTransport>>,
    max_live: usize,
    fail_next: Option<String>,
}

/// Factory that records every transport it hands out
pub struct FakeTransportFactory {
    state: Mutex<FactoryState>,
    create_gate: Mutex<Gate>,
    remote_gate: Mutex<Gate>,
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FactoryState::default()),
            create_gate: Mutex::new(Gate::open()),
            remote_gate: Mutex::new(Gate::open()),
        }
    }

    /// Hold every following `create` until the returned gate is released
    pub fn hold_creates(&self) -> Gate {
        let gate = Gate::closed();
        *self.create_gate.lock() = gate.clone();
        gate
    }

    /// Hold `set_remote_description` of transports created from now on
    pub fn hold_remote_descriptions(&self) -> Gate {
        let gate = Gate::closed();
        *self.remote_gate.lock() = gate.clone();
        gate
    }

    pub fn fail_next_create(&self, message: &str) {
        self.state.lock().fail_next = Some(message.to_string());
    }

    pub fn created(&self) -> usize {
        self.state.lock().transports.len()
    }

    /// Transports not yet closed
    pub fn live(&self) -> usize {
        self.state
            .lock()
            .transports
            .iter()
            .filter(|t| !t.is_closed())
            .count()
    }

    /// Highest number of simultaneously live transports ever observed
    pub fn max_live(&self) -> usize {
        self.state.lock().max_live
    }

    pub fn last(&self) -> Option<Arc<FakeTransport>> {
        self.state.lock().transports.last().cloned()
    }
}

#[async_trait]
impl MediaTransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        _config: &TransportConfig,
        events: TransportEventSender,
    ) -> Result<Arc<dyn MediaTransport>> {
        let gate = self.create_gate.lock().clone();
        gate.wait().await;

        let mut state = self.state.lock();
        if let Some(message) = state.fail_next.take() {
            return Err(Error::PeerConnectionError(message));
        }

        let transport = Arc::new(FakeTransport::new(events, self.remote_gate.lock().clone()));
        state.transports.push(transport.clone());
        let live = state.transports.iter().filter(|t| !t.is_closed()).count();
        state.max_live = state.max_live.max(live);
        Ok(transport)
    }
}
