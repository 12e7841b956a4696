//! Session manager
//!
//! Owns the signaling client, the single live media transport, the capture
//! handle and the analysis graph for whichever role is active. Relay
//! messages and transport events are processed by one dispatcher task,
//! strictly one at a time. Caller operations run concurrently with it; every
//! session start bumps a generation counter and any async step that finds
//! the counter moved discards its result.
//!
//! Session starts are serialized by an operation lock, so media is acquired
//! only after the previous start has installed or released its own. Every
//! state write re-checks the generation under the core lock and is emitted
//! under the transition lock; a superseded step can never report a state
//! after the step that superseded it.

use super::events::{EventBus, SessionEvent, SubscriptionId};
use super::registry::StreamRegistry;
use super::state::{ConnectionState, Role};
use crate::clock::{Clock, SystemClock};
use crate::config::{SessionConfig, SessionOptions, TransportConfig};
use crate::media::capture::{CaptureDevice, CaptureHandle};
use crate::media::graph::{AnalysisHandle, AudioGraph};
use crate::media::stream::MediaStream;
use crate::media::transport::{
    IceConnectionState, MediaTransport, MediaTransportFactory, SignalingState, TransportEvent,
};
use crate::peer::RtcTransportFactory;
use crate::signaling::client::{SignalingClient, SignalingEvent};
use crate::signaling::connector::{SignalingConnector, WebSocketConnector};
use crate::signaling::endpoint::resolve_endpoint;
use crate::signaling::protocol::{ClientMessage, IceCandidate, ServerMessage, SessionDescription, StreamId};
use crate::{Error, Result};
use parking_lot::{Mutex, ReentrantMutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Error text for ICE connectivity loss
pub const ICE_FAILED_MESSAGE: &str = "ICE Connection Failed";

/// Work items for the dispatcher
#[derive(Debug)]
enum Dispatch {
    Signaling(SignalingEvent),
    Transport {
        generation: u64,
        event: TransportEvent,
    },
}

/// Mutable session state; never held across `.await`
struct SessionCore {
    state: ConnectionState,
    role: Option<Role>,
    transport: Option<Arc<dyn MediaTransport>>,
    transport_forwarder: Option<JoinHandle<()>>,
    capture: Option<Box<dyn CaptureHandle>>,
    graph: Option<AudioGraph>,
    subscribed: Option<StreamId>,
    registry: StreamRegistry,
    watch_timer: Option<JoinHandle<()>>,
    watching: bool,
}

impl SessionCore {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            role: None,
            transport: None,
            transport_forwarder: None,
            capture: None,
            graph: None,
            subscribed: None,
            registry: StreamRegistry::new(),
            watch_timer: None,
            watching: false,
        }
    }

    /// Drop capture, graph and event forwarding; hands back the transport
    /// so it can be closed outside the lock.
    fn release_media(&mut self) -> Option<Arc<dyn MediaTransport>> {
        if let Some(forwarder) = self.transport_forwarder.take() {
            forwarder.abort();
        }
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(mut graph) = self.graph.take() {
            graph.close();
        }
        self.transport.take()
    }

    fn cancel_watch(&mut self) {
        self.watching = false;
        if let Some(timer) = self.watch_timer.take() {
            timer.abort();
        }
    }

    /// Receiver negotiated but no inbound track yet
    fn awaiting_track(&self) -> bool {
        self.role == Some(Role::Receiver) && self.transport.is_some() && self.graph.is_none()
    }
}

struct Inner {
    config: Mutex<SessionConfig>,
    core: Mutex<SessionCore>,
    signaling: SignalingClient,
    events: EventBus,
    capture_device: Option<Arc<dyn CaptureDevice>>,
    transports: Arc<dyn MediaTransportFactory>,
    clock: Arc<dyn Clock>,
    generation: AtomicU64,
    /// Held by `start_*` from generation bump to install or release
    operation: tokio::sync::Mutex<()>,
    /// Orders state writes with the events announcing them
    transition: ReentrantMutex<()>,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
}

/// Builder wiring host capabilities into a [`SessionManager`]
pub struct SessionManagerBuilder {
    config: SessionConfig,
    connector: Option<Arc<dyn SignalingConnector>>,
    capture_device: Option<Arc<dyn CaptureDevice>>,
    transports: Option<Arc<dyn MediaTransportFactory>>,
    clock: Option<Arc<dyn Clock>>,
}

impl SessionManagerBuilder {
    /// Signaling connector (default: WebSocket)
    pub fn connector(mut self, connector: Arc<dyn SignalingConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Audio capture device; sending fails without one
    pub fn capture_device(mut self, device: Arc<dyn CaptureDevice>) -> Self {
        self.capture_device = Some(device);
        self
    }

    /// Media transport factory (default: WebRTC peer connections)
    pub fn transport_factory(mut self, factory: Arc<dyn MediaTransportFactory>) -> Self {
        self.transports = Some(factory);
        self
    }

    /// Wall clock used for latency (default: system clock)
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and start the dispatcher.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the configuration is out of range.
    pub fn build(self) -> Result<SessionManager> {
        self.config.validate()?;

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WebSocketConnector::new()));
        let signaling = SignalingClient::new(connector, &self.config.reconnect);
        let signaling_events = signaling
            .take_events()
            .ok_or_else(|| Error::SessionError("signaling events already taken".to_string()))?;

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            config: Mutex::new(self.config),
            core: Mutex::new(SessionCore::new()),
            signaling,
            events: EventBus::new(),
            capture_device: self.capture_device,
            transports: self
                .transports
                .unwrap_or_else(|| Arc::new(RtcTransportFactory)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            generation: AtomicU64::new(0),
            operation: tokio::sync::Mutex::new(()),
            transition: ReentrantMutex::new(()),
            dispatch_tx,
        });

        let dispatcher = tokio::spawn(dispatch_loop(
            Arc::downgrade(&inner),
            signaling_events,
            dispatch_rx,
        ));

        Ok(SessionManager { inner, dispatcher })
    }
}

/// Role-based session over a relay
///
/// Dropping the manager tears the session down.
pub struct SessionManager {
    inner: Arc<Inner>,
    dispatcher: JoinHandle<()>,
}

impl SessionManager {
    pub fn builder(config: SessionConfig) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config,
            connector: None,
            capture_device: None,
            transports: None,
            clock: None,
        }
    }

    /// Manager with the production WebSocket connector and WebRTC transport
    pub fn new(config: SessionConfig, capture_device: Arc<dyn CaptureDevice>) -> Result<Self> {
        Self::builder(config).capture_device(capture_device).build()
    }

    /// Register an observer; events are delivered synchronously in
    /// registration order.
    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Observe events through a channel instead of a callback
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<SessionEvent>) {
        self.inner.events.subscribe_channel()
    }

    /// Publish local capture to the relay.
    ///
    /// The offer is created once the relay answers `sender_ready`.
    ///
    /// # Errors
    ///
    /// Endpoint, signaling, capture and transport failures tear the session
    /// down, emit `StateChanged(Error)` and are returned.
    #[instrument(skip(self))]
    pub async fn start_sending(&self) -> Result<()> {
        start_sending(&self.inner).await
    }

    /// Subscribe to `stream_id`, or to whatever the relay picks when `None`.
    ///
    /// The session reaches `Connected` only once the inbound track arrives.
    ///
    /// # Errors
    ///
    /// Endpoint, signaling and transport failures tear the session down,
    /// emit `StateChanged(Error)` and are returned.
    #[instrument(skip(self))]
    pub async fn start_receiving(&self, stream_id: Option<StreamId>) -> Result<()> {
        start_receiving(&self.inner, stream_id).await
    }

    /// Release the media side only and keep the signaling channel open
    pub async fn stop_stream(&self) -> Result<()> {
        stop_stream(&self.inner).await;
        Ok(())
    }

    /// Full teardown
    pub async fn stop(&self) -> Result<()> {
        stop(&self.inner).await;
        Ok(())
    }

    /// Ask the relay for its stream list; no-op while the channel is closed
    pub async fn get_streams(&self) -> Result<()> {
        self.inner.get_streams();
        Ok(())
    }

    /// Merge the defined fields of `options`; applies from the next start
    pub async fn update_config(&self, options: SessionOptions) -> Result<()> {
        self.inner.config.lock().merge(&options);
        debug!(?options, "Session configuration updated");
        Ok(())
    }

    /// Enter watch mode: poll the stream list every `interval` (default from
    /// config) and follow the newest stream.
    ///
    /// Opens a receiving session first when none is connected.
    ///
    /// # Errors
    ///
    /// Returns the error of the receiving session start; watch mode stays off.
    pub async fn watch_streams(&self, interval: Option<Duration>) -> Result<()> {
        watch_streams(&self.inner, interval).await
    }

    /// Leave watch mode; the current subscription is kept
    pub async fn unwatch_streams(&self) -> Result<()> {
        self.inner.core.lock().cancel_watch();
        info!("Stopped watching streams");
        Ok(())
    }

    /// Analysis of the active stream; `None` when no graph is attached
    pub fn analysis_handle(&self) -> Option<AnalysisHandle> {
        self.inner
            .core
            .lock()
            .graph
            .as_ref()
            .map(AudioGraph::analysis_handle)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.core.lock().state
    }

    /// Known streams in discovery order
    pub fn streams(&self) -> Vec<StreamId> {
        self.inner.core.lock().registry.to_vec()
    }

    pub fn role(&self) -> Option<Role> {
        self.inner.core.lock().role
    }

    /// Stream the receiver asked for
    pub fn subscribed_stream(&self) -> Option<StreamId> {
        self.inner.core.lock().subscribed.clone()
    }

    pub fn is_watching(&self) -> bool {
        self.inner.core.lock().watching
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> SessionConfig {
        self.inner.config.lock().clone()
    }

    /// Seconds between a relay timestamp and now
    pub fn latency_of(&self, timestamp: f64) -> f64 {
        self.inner.clock.now_secs() - timestamp
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        let transport = {
            let mut core = self.inner.core.lock();
            core.cancel_watch();
            core.subscribed = None;
            core.role = None;
            core.release_media()
        };
        self.inner.signaling.stop();

        if let (Some(transport), Ok(runtime)) =
            (transport, tokio::runtime::Handle::try_current())
        {
            runtime.spawn(close_transport(transport));
        }
        debug!("Session manager dropped");
    }
}

impl Inner {
    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.current_generation() == generation
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn emit(&self, event: SessionEvent) {
        self.events.emit(event);
    }

    /// Write `state` only while `generation` is current
    fn set_state_if_current(
        &self,
        generation: u64,
        state: ConnectionState,
        error: Option<String>,
    ) -> bool {
        self.transition(|_| self.is_current(generation), state, error, None)
    }

    /// Apply `update` and write `state` in one core section, then emit the
    /// state change followed by `then`. Nothing is written or emitted when
    /// `update` returns false.
    fn transition<F>(
        &self,
        update: F,
        state: ConnectionState,
        error: Option<String>,
        then: Option<SessionEvent>,
    ) -> bool
    where
        F: FnOnce(&mut SessionCore) -> bool,
    {
        let _ordered = self.transition.lock();
        {
            let mut core = self.core.lock();
            if !update(&mut core) {
                return false;
            }
            if core.state != state {
                debug!("Session state transition: {:?} -> {:?}", core.state, state);
            }
            core.state = state;
        }
        self.emit(SessionEvent::StateChanged { state, error });
        if let Some(event) = then {
            self.emit(event);
        }
        true
    }

    fn get_streams(&self) {
        if !self.signaling.is_open() {
            return;
        }
        self.signaling.send(&ClientMessage::GetAvailableStreams);
    }

    /// Release everything the session holds, then report `message` as an error
    async fn fail(&self, message: String) {
        let generation = self.next_generation();
        self.tear_down_failed(generation, message).await;
    }

    /// Fail the session owned by `generation`; false when it was superseded
    async fn fail_from(&self, generation: u64, message: String) -> bool {
        if self
            .generation
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Discarding stale failure: {}", message);
            return false;
        }
        self.tear_down_failed(generation + 1, message).await;
        true
    }

    async fn tear_down_failed(&self, generation: u64, message: String) {
        let transport = {
            let mut core = self.core.lock();
            if !self.is_current(generation) {
                debug!("Session superseded while failing: {}", message);
                return;
            }
            core.cancel_watch();
            core.subscribed = None;
            core.release_media()
        };
        if self.is_current(generation) {
            self.signaling.stop();
        }
        if let Some(transport) = transport {
            close_transport(transport).await;
        }

        error!("Session failed: {}", message);
        self.set_state_if_current(generation, ConnectionState::Error, Some(message));
    }

    /// Fail the session if `generation` is still current, else drop the result
    async fn fail_if_current(&self, generation: u64, err: Error) -> Result<()> {
        if self.fail_from(generation, err.message()).await {
            Err(err)
        } else {
            Ok(())
        }
    }

    /// Open the signaling channel to the configured endpoint
    async fn open_signaling(&self, config: &SessionConfig) -> Result<()> {
        let url = resolve_endpoint(config.server_url.as_deref(), &config.page)?;
        self.signaling.connect(&url).await
    }

    /// Create a transport whose events are tagged with `generation`
    async fn create_transport(
        self: &Arc<Self>,
        generation: u64,
        config: &TransportConfig,
    ) -> Result<(Arc<dyn MediaTransport>, JoinHandle<()>)> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = self.transports.create(config, tx).await?;

        let dispatch = self.dispatch_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if dispatch.send(Dispatch::Transport { generation, event }).is_err() {
                    break;
                }
            }
        });

        Ok((transport, forwarder))
    }

    /// Start a new session for `role`; returns its generation.
    ///
    /// Whatever the previous session held is released and its transport
    /// closed before this returns.
    async fn begin(&self, role: Role, subscribed: Option<StreamId>) -> u64 {
        let generation = self.next_generation();
        let transport = {
            let mut core = self.core.lock();
            core.role = Some(role);
            core.subscribed = subscribed;
            core.release_media()
        };
        if let Some(transport) = transport {
            close_transport(transport).await;
        }
        generation
    }
}

async fn close_transport(transport: Arc<dyn MediaTransport>) {
    if let Err(e) = transport.close().await {
        warn!("Failed to close media transport: {}", e);
    }
}

async fn start_sending(inner: &Arc<Inner>) -> Result<()> {
    // Supersede an in-flight start so it releases what it acquired, then
    // wait for it before acquiring anything.
    inner.next_generation();
    let _operation = inner.operation.lock().await;

    let generation = inner.begin(Role::Sender, None).await;
    inner.set_state_if_current(generation, ConnectionState::Connecting, None);

    let config = inner.config.lock().clone();
    if let Err(e) = inner.open_signaling(&config).await {
        return inner.fail_if_current(generation, e).await;
    }
    if !inner.is_current(generation) {
        return Ok(());
    }

    let Some(device) = inner.capture_device.clone() else {
        let err = Error::CaptureError("No capture device available".to_string());
        return inner.fail_if_current(generation, err).await;
    };
    let mut capture = match device.open(&config.capture_constraints()).await {
        Ok(capture) => capture,
        Err(e) => return inner.fail_if_current(generation, e).await,
    };
    if !inner.is_current(generation) {
        capture.stop();
        return Ok(());
    }

    let local = capture.stream();
    let graph = AudioGraph::attach(&local);

    let (transport, forwarder) = match inner.create_transport(generation, &config.transport).await {
        Ok(created) => created,
        Err(e) => {
            capture.stop();
            return inner.fail_if_current(generation, e).await;
        }
    };

    if let Err(e) = transport.add_track(&local).await {
        forwarder.abort();
        capture.stop();
        close_transport(transport).await;
        return inner.fail_if_current(generation, e).await;
    }

    let mut pending = Some((transport.clone(), forwarder, capture, graph));
    let installed = inner.transition(
        |core| {
            if !inner.is_current(generation) {
                return false;
            }
            if let Some((transport, forwarder, capture, graph)) = pending.take() {
                core.transport = Some(transport);
                core.transport_forwarder = Some(forwarder);
                core.capture = Some(capture);
                core.graph = Some(graph);
            }
            inner.signaling.send(&ClientMessage::StartSending);
            true
        },
        ConnectionState::Connected,
        None,
        None,
    );
    if !installed {
        if let Some((_, forwarder, mut capture, _)) = pending {
            forwarder.abort();
            capture.stop();
        }
        debug!("Discarding stale sending session");
        close_transport(transport).await;
        return Ok(());
    }

    info!("Sending session started");
    Ok(())
}

async fn start_receiving(inner: &Arc<Inner>, stream_id: Option<StreamId>) -> Result<()> {
    inner.next_generation();
    let _operation = inner.operation.lock().await;

    let generation = inner.begin(Role::Receiver, stream_id.clone()).await;
    inner.set_state_if_current(generation, ConnectionState::Connecting, None);

    let config = inner.config.lock().clone();
    if let Err(e) = inner.open_signaling(&config).await {
        return inner.fail_if_current(generation, e).await;
    }
    if !inner.is_current(generation) {
        return Ok(());
    }

    let (transport, forwarder) = match inner.create_transport(generation, &config.transport).await {
        Ok(created) => created,
        Err(e) => return inner.fail_if_current(generation, e).await,
    };

    let installed = {
        let mut core = inner.core.lock();
        if inner.is_current(generation) {
            core.transport = Some(transport.clone());
            core.transport_forwarder = Some(forwarder);
            inner
                .signaling
                .send(&ClientMessage::StartReceiving { stream_id });
            true
        } else {
            forwarder.abort();
            false
        }
    };
    if !installed {
        debug!("Discarding stale receiving session");
        close_transport(transport).await;
        return Ok(());
    }

    info!("Receiving session started, waiting for offer");
    Ok(())
}

async fn stop_stream(inner: &Arc<Inner>) {
    let generation = inner.next_generation();
    let transport = {
        let mut core = inner.core.lock();
        core.subscribed = None;
        core.release_media()
    };
    if let Some(transport) = transport {
        close_transport(transport).await;
    }

    if inner.signaling.is_open() {
        inner.signaling.send(&ClientMessage::StopStream);
        inner.set_state_if_current(generation, ConnectionState::Connected, None);
    } else {
        inner.set_state_if_current(generation, ConnectionState::Disconnected, None);
    }
    info!("Stream stopped");
}

async fn stop(inner: &Arc<Inner>) {
    let generation = inner.next_generation();
    let transport = {
        let mut core = inner.core.lock();
        core.cancel_watch();
        core.subscribed = None;
        core.role = None;
        core.release_media()
    };
    if let Some(transport) = transport {
        close_transport(transport).await;
    }

    if inner.signaling.is_open() {
        inner.signaling.send(&ClientMessage::StopStream);
    }
    inner.signaling.stop();

    info!("Session stopped");
    inner.set_state_if_current(generation, ConnectionState::Disconnected, None);
}

async fn watch_streams(inner: &Arc<Inner>, interval: Option<Duration>) -> Result<()> {
    let interval = interval.unwrap_or_else(|| inner.config.lock().watch_interval());

    let live = inner.signaling.is_open()
        && matches!(
            inner.core.lock().state,
            ConnectionState::Connected | ConnectionState::Connecting
        );
    if !live {
        start_receiving(inner, None).await?;
    }

    let weak = Arc::downgrade(inner);
    let timer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match weak.upgrade() {
                Some(inner) => inner.get_streams(),
                None => break,
            }
        }
    });

    {
        let mut core = inner.core.lock();
        core.cancel_watch();
        core.watching = true;
        core.watch_timer = Some(timer);
    }
    info!(interval_ms = interval.as_millis() as u64, "Watching streams");
    Ok(())
}

async fn dispatch_loop(
    inner: Weak<Inner>,
    mut signaling: mpsc::UnboundedReceiver<SignalingEvent>,
    mut transport: mpsc::UnboundedReceiver<Dispatch>,
) {
    loop {
        let next = tokio::select! {
            Some(event) = signaling.recv() => Dispatch::Signaling(event),
            Some(item) = transport.recv() => item,
            else => break,
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        match next {
            Dispatch::Signaling(event) => handle_signaling_event(&inner, event).await,
            Dispatch::Transport { generation, event } => {
                handle_transport_event(&inner, generation, event).await
            }
        }
    }
    debug!("Session dispatcher terminated");
}

async fn handle_signaling_event(inner: &Arc<Inner>, event: SignalingEvent) {
    match event {
        SignalingEvent::Opened { reconnected: false } => {}
        SignalingEvent::Opened { reconnected: true } => {
            inner.transition(
                |core| core.state == ConnectionState::Connecting && !core.awaiting_track(),
                ConnectionState::Connected,
                None,
                None,
            );
        }
        SignalingEvent::Reconnecting { message, .. } => {
            // Queued behind a stop or a failure: the session is already down
            inner.transition(
                |core| core.role.is_some() && core.state != ConnectionState::Error,
                ConnectionState::Connecting,
                Some(message),
                None,
            );
        }
        SignalingEvent::Failed { message } => {
            inner.fail(message).await;
        }
        SignalingEvent::Message(msg) => handle_server_message(inner, msg).await,
    }
}

async fn handle_server_message(inner: &Arc<Inner>, msg: ServerMessage) {
    match msg {
        ServerMessage::SenderReady { connection_id } => {
            debug!(?connection_id, "Relay ready for sender");
            handle_sender_ready(inner).await;
        }
        ServerMessage::WebrtcAnswer { answer } => handle_answer(inner, answer).await,
        ServerMessage::WebrtcOffer { offer } => handle_offer(inner, offer).await,
        ServerMessage::IceCandidate { candidate } => handle_remote_candidate(inner, candidate).await,
        ServerMessage::AvailableStreams { streams } => {
            let (streams, follow) = {
                let mut core = inner.core.lock();
                core.registry.replace(streams);
                let follow = match core.registry.newest() {
                    Some(newest) if core.watching && core.subscribed.as_ref() != Some(newest) => {
                        Some(newest.clone())
                    }
                    _ => None,
                };
                (core.registry.to_vec(), follow)
            };
            inner.emit(SessionEvent::StreamsChanged { streams });
            if let Some(stream_id) = follow {
                follow_stream(inner, stream_id).await;
            }
        }
        ServerMessage::StreamAvailable { stream_id } => {
            let (added, watching) = {
                let mut core = inner.core.lock();
                (core.registry.insert(stream_id.clone()), core.watching)
            };
            if added {
                inner.emit(SessionEvent::StreamAdded {
                    stream_id: stream_id.clone(),
                });
                if watching {
                    follow_stream(inner, stream_id).await;
                }
            }
        }
        ServerMessage::StreamEnded { stream_id } => {
            let was_subscribed = {
                let mut core = inner.core.lock();
                core.registry.remove(&stream_id);
                core.subscribed.as_ref() == Some(&stream_id)
            };
            inner.emit(SessionEvent::StreamRemoved {
                stream_id: stream_id.clone(),
            });
            if was_subscribed {
                info!(stream = %stream_id, "Subscribed stream ended");
                stop_stream(inner).await;
            }
        }
        ServerMessage::AudioData { timestamp } => {
            inner.emit(SessionEvent::AudioData { timestamp });
        }
        ServerMessage::Error { message } => {
            warn!("Relay error: {}", message);
            inner.emit(SessionEvent::ServerError { message });
        }
        ServerMessage::Unknown => {}
    }
}

/// Switch the subscription to `stream_id` while watching
async fn follow_stream(inner: &Arc<Inner>, stream_id: StreamId) {
    let playing = inner.core.lock().subscribed.as_ref() == Some(&stream_id);
    if playing {
        return;
    }
    info!(stream = %stream_id, "Following newest stream");
    if let Err(e) = start_receiving(inner, Some(stream_id)).await {
        warn!("Failed to follow stream: {}", e);
    }
}

/// Transport for `role` together with the generation it belongs to
fn active_transport(inner: &Inner, role: Role) -> Option<(Arc<dyn MediaTransport>, u64)> {
    let core = inner.core.lock();
    if core.role != Some(role) {
        return None;
    }
    core.transport
        .clone()
        .map(|transport| (transport, inner.current_generation()))
}

#[instrument(skip(inner))]
async fn handle_sender_ready(inner: &Arc<Inner>) {
    let Some((transport, generation)) = active_transport(inner, Role::Sender) else {
        debug!("Ignoring sender_ready without a sending transport");
        return;
    };

    let result = async {
        let offer = transport.create_offer().await?;
        if !inner.is_current(generation) {
            return Ok(None);
        }
        let applied = transport.set_local_description(offer).await?;
        Ok::<_, Error>(inner.is_current(generation).then_some(applied))
    }
    .await;

    match result {
        Ok(Some(offer)) => {
            inner.signaling.send(&ClientMessage::WebrtcOffer { offer });
            debug!("Sent offer");
        }
        Ok(None) => debug!("Discarding stale offer"),
        Err(e) => {
            let err = Error::SdpError(format!("Failed to create offer: {}", e.message()));
            let _ = inner.fail_if_current(generation, err).await;
        }
    }
}

async fn handle_answer(inner: &Arc<Inner>, answer: SessionDescription) {
    let Some((transport, generation)) = active_transport(inner, Role::Sender) else {
        debug!("Ignoring answer without a sending transport");
        return;
    };

    if let Err(e) = transport.set_remote_description(answer).await {
        let err = Error::SdpError(format!("Failed to handle answer: {}", e.message()));
        let _ = inner.fail_if_current(generation, err).await;
        return;
    }
    debug!("Applied answer");
}

#[instrument(skip(inner, offer))]
async fn handle_offer(inner: &Arc<Inner>, offer: SessionDescription) {
    let Some((transport, generation)) = active_transport(inner, Role::Receiver) else {
        debug!("Ignoring offer without a receiving transport");
        return;
    };

    let state = transport.signaling_state();
    if state != SignalingState::Stable {
        warn!("Cannot process offer in state: {:?}", state);
        return;
    }

    let result = async {
        transport.set_remote_description(offer).await?;
        if !inner.is_current(generation) {
            return Ok(None);
        }
        let answer = transport.create_answer().await?;
        if !inner.is_current(generation) {
            return Ok(None);
        }
        let applied = transport.set_local_description(answer).await?;
        Ok::<_, Error>(inner.is_current(generation).then_some(applied))
    }
    .await;

    match result {
        Ok(Some(answer)) => {
            inner.signaling.send(&ClientMessage::WebrtcAnswer { answer });
            debug!("Sent answer");
        }
        Ok(None) => debug!("Discarding stale answer"),
        Err(e) => {
            let err = Error::SdpError(format!("Failed to handle offer: {}", e.message()));
            let _ = inner.fail_if_current(generation, err).await;
        }
    }
}

async fn handle_remote_candidate(inner: &Arc<Inner>, candidate: Option<IceCandidate>) {
    let Some(candidate) = candidate else {
        debug!("Relay finished gathering candidates");
        return;
    };
    let transport = inner.core.lock().transport.clone();
    let Some(transport) = transport else {
        debug!("Ignoring ICE candidate without a transport");
        return;
    };
    if let Err(e) = transport.add_ice_candidate(candidate).await {
        warn!("Failed to add ICE candidate: {}", e);
    }
}

async fn handle_transport_event(inner: &Arc<Inner>, generation: u64, event: TransportEvent) {
    if !inner.is_current(generation) {
        debug!("Ignoring event from a retired transport");
        return;
    }

    match event {
        TransportEvent::IceCandidate(candidate) => {
            inner.signaling.send(&ClientMessage::IceCandidate { candidate });
        }
        TransportEvent::IceConnectionState(state) => {
            debug!("ICE connection state: {:?}", state);
            if state == IceConnectionState::Failed {
                let err = Error::IceFailed(ICE_FAILED_MESSAGE.to_string());
                let _ = inner.fail_if_current(generation, err).await;
            }
        }
        TransportEvent::Track(stream) => handle_track(inner, generation, stream),
    }
}

fn handle_track(inner: &Arc<Inner>, generation: u64, stream: MediaStream) {
    let attached = inner.transition(
        |core| {
            if !inner.is_current(generation) || core.role != Some(Role::Receiver) {
                return false;
            }
            if let Some(mut previous) = core.graph.take() {
                previous.close();
            }
            core.graph = Some(AudioGraph::attach(&stream));
            true
        },
        ConnectionState::Connected,
        None,
        Some(SessionEvent::Track {
            stream: stream.clone(),
        }),
    );

    if attached {
        info!(stream = stream.id(), "Inbound track available");
    } else {
        debug!("Ignoring inbound track outside a receiving session");
    }
}
