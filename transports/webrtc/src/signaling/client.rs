//! Reconnecting signaling client
//!
//! Owns one signaling channel at a time. Inbound frames are decoded into
//! [`ServerMessage`]s and delivered, together with channel lifecycle events,
//! through a single ordered event queue. An unexpected close while the
//! channel is wanted schedules a retry with [`ReconnectPolicy`].

use super::backoff::{reconnect_message, ReconnectPolicy};
use super::connector::{FrameSink, FrameStream, SignalingConnector, WebSocketConnector};
use super::protocol::{ClientMessage, ServerMessage};
use crate::config::ReconnectConfig;
use crate::{Error, Result};
use futures::{Future, SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

/// Terminal message once the retry budget is spent
pub const MAX_RETRIES_MESSAGE: &str = "Connection lost. Max retries reached.";

/// Lifecycle of the signaling channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// No channel and none wanted
    Idle,
    /// Opening a channel
    Connecting,
    /// Channel open
    Open,
    /// Waiting for a retry timer
    Reconnecting,
    /// Retry budget spent; only `connect` restarts
    Failed,
}

/// Events delivered by the signaling client, in order
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// A channel opened; `reconnected` is true for retry-driven opens
    Opened { reconnected: bool },

    /// A decoded relay message
    Message(ServerMessage),

    /// The channel closed unexpectedly and a retry is scheduled
    Reconnecting {
        attempt: u32,
        delay: Duration,
        message: String,
    },

    /// Retries exhausted; the client stays down until `connect` is called
    Failed { message: String },
}

struct LinkState {
    status: ChannelStatus,
    wanted: bool,
    url: Option<Url>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    reader: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    policy: ReconnectPolicy,
    /// Bumped by every connect and stop; completions carrying an older
    /// epoch are discarded.
    epoch: u64,
}

impl LinkState {
    fn close_channel(&mut self) {
        // Dropping the sender lets the writer flush queued frames and close.
        self.outbound = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }
}

struct ClientInner {
    connector: Arc<dyn SignalingConnector>,
    link: Mutex<LinkState>,
    connect_lock: tokio::sync::Mutex<()>,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let link = self.link.get_mut();
        link.close_channel();
        link.cancel_timer();
    }
}

/// Reconnecting signaling client
#[derive(Clone)]
pub struct SignalingClient {
    inner: Arc<ClientInner>,
}

impl SignalingClient {
    /// Create a client that opens channels through `connector`
    pub fn new(connector: Arc<dyn SignalingConnector>, reconnect: &ReconnectConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(ClientInner {
                connector,
                link: Mutex::new(LinkState {
                    status: ChannelStatus::Idle,
                    wanted: false,
                    url: None,
                    outbound: None,
                    reader: None,
                    reconnect_timer: None,
                    policy: ReconnectPolicy::from_config(reconnect),
                    epoch: 0,
                }),
                connect_lock: tokio::sync::Mutex::new(()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    /// Create a client speaking WebSocket
    pub fn websocket(reconnect: &ReconnectConfig) -> Self {
        Self::new(Arc::new(WebSocketConnector::new()), reconnect)
    }

    /// Open the channel to `url`.
    ///
    /// Returns immediately when a channel to the same URL is already open.
    /// Concurrent calls are serialized so only one channel is ever opened.
    ///
    /// # Errors
    ///
    /// Returns the connector's error when the channel cannot be opened.
    /// An explicit connect that fails does not schedule retries.
    pub async fn connect(&self, url: &Url) -> Result<()> {
        open(&self.inner, url.clone(), true).await
    }

    /// Send a message; returns `false` and drops it when the channel is not open
    pub fn send(&self, message: &ClientMessage) -> bool {
        let link = self.inner.link.lock();
        let tx = match (&link.status, &link.outbound) {
            (ChannelStatus::Open, Some(tx)) => tx,
            _ => {
                debug!("Dropping {} message: signaling channel not open", message.kind());
                return false;
            }
        };

        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode {} message: {}", message.kind(), e);
                return false;
            }
        };

        debug!("Sending signaling message: {}", json);
        tx.send(json).is_ok()
    }

    /// Close the channel, cancel any pending retry and suppress reconnection
    pub fn stop(&self) {
        let mut link = self.inner.link.lock();
        link.epoch += 1;
        link.wanted = false;
        link.close_channel();
        link.cancel_timer();
        link.policy.reset();
        if link.status != ChannelStatus::Idle {
            info!("Signaling channel stopped");
        }
        link.status = ChannelStatus::Idle;
    }

    /// Whether the channel is currently open
    pub fn is_open(&self) -> bool {
        self.inner.link.lock().status == ChannelStatus::Open
    }

    /// Current channel status
    pub fn status(&self) -> ChannelStatus {
        self.inner.link.lock().status
    }

    /// URL of the current (or last) channel
    pub fn url(&self) -> Option<Url> {
        self.inner.link.lock().url.clone()
    }

    /// Whether a retry timer is armed
    pub fn has_pending_retry(&self) -> bool {
        self.inner
            .link
            .lock()
            .reconnect_timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    /// Take the ordered event queue. Only the first call returns `Some`.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SignalingEvent>> {
        self.inner.events_rx.lock().take()
    }

    /// Run `handler` for every inbound message, one at a time in arrival order.
    ///
    /// Each invocation completes before the next message is taken.
    ///
    /// # Errors
    ///
    /// Returns `Error::SignalingError` if the event queue was already taken.
    pub fn on_message<F, Fut>(&self, mut handler: F) -> Result<JoinHandle<()>>
    where
        F: FnMut(ServerMessage) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut events = self
            .take_events()
            .ok_or_else(|| Error::SignalingError("event queue already taken".to_string()))?;

        Ok(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let SignalingEvent::Message(msg) = event {
                    handler(msg).await;
                }
            }
        }))
    }
}

async fn open(inner: &Arc<ClientInner>, url: Url, explicit: bool) -> Result<()> {
    let _guard = inner.connect_lock.lock().await;

    let epoch = {
        let mut link = inner.link.lock();
        if explicit {
            if link.status == ChannelStatus::Open && link.url.as_ref() == Some(&url) {
                return Ok(());
            }
            link.cancel_timer();
            link.close_channel();
            link.policy.reset();
        } else if !link.wanted || link.status == ChannelStatus::Open {
            return Ok(());
        }

        link.wanted = true;
        link.url = Some(url.clone());
        link.status = ChannelStatus::Connecting;
        link.epoch += 1;
        link.epoch
    };

    let result = inner.connector.connect(&url).await;

    let mut link = inner.link.lock();
    if link.epoch != epoch || !link.wanted {
        debug!("Discarding superseded signaling connect to {}", url);
        return Err(Error::SignalingError("connection attempt superseded".to_string()));
    }

    match result {
        Ok(channel) => {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(writer_task(channel.sink, rx));
            link.outbound = Some(tx);
            link.reader = Some(tokio::spawn(reader_task(
                Arc::downgrade(inner),
                channel.stream,
                epoch,
                inner.events_tx.clone(),
            )));
            link.status = ChannelStatus::Open;
            link.policy.reset();
            drop(link);

            info!(url = %url, reconnected = !explicit, "Signaling channel open");
            let _ = inner.events_tx.send(SignalingEvent::Opened {
                reconnected: !explicit,
            });
            Ok(())
        }
        Err(e) if explicit => {
            link.wanted = false;
            link.status = ChannelStatus::Idle;
            warn!("Failed to open signaling channel to {}: {}", url, e);
            Err(e)
        }
        Err(e) => {
            drop(link);
            warn!("Signaling retry to {} failed: {}", url, e);
            schedule_reconnect(inner);
            Err(e)
        }
    }
}

fn schedule_reconnect(inner: &Arc<ClientInner>) {
    let mut link = inner.link.lock();
    if !link.wanted {
        return;
    }
    let Some(url) = link.url.clone() else {
        return;
    };

    match link.policy.next_delay() {
        None => {
            link.wanted = false;
            link.status = ChannelStatus::Failed;
            link.epoch += 1;
            link.reconnect_timer = None;
            drop(link);

            error!("{}", MAX_RETRIES_MESSAGE);
            let _ = inner.events_tx.send(SignalingEvent::Failed {
                message: MAX_RETRIES_MESSAGE.to_string(),
            });
        }
        Some(delay) => {
            let attempt = link.policy.attempt();
            let weak = Arc::downgrade(inner);
            link.status = ChannelStatus::Reconnecting;
            link.reconnect_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = weak.upgrade() {
                    retry(inner, url).await;
                }
            }));
            drop(link);

            let message = reconnect_message(delay);
            info!(attempt, delay_ms = delay.as_millis() as u64, "{}", message);
            let _ = inner.events_tx.send(SignalingEvent::Reconnecting {
                attempt,
                delay,
                message,
            });
        }
    }
}

fn retry(inner: Arc<ClientInner>, url: Url) -> futures::future::BoxFuture<'static, ()> {
    Box::pin(async move {
        // Failures reschedule from inside `open`.
        let _ = open(&inner, url, false).await;
    })
}

fn on_closed(inner: &Arc<ClientInner>, epoch: u64) {
    {
        let mut link = inner.link.lock();
        if link.epoch != epoch {
            return;
        }
        link.outbound = None;
        link.reader = None;
        if !link.wanted {
            link.status = ChannelStatus::Idle;
            return;
        }
    }

    warn!("Signaling channel closed unexpectedly");
    schedule_reconnect(inner);
}

/// Writer task: forwards queued frames to the channel
async fn writer_task(mut sink: FrameSink, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sink.send(frame).await {
            warn!("Failed to send signaling frame: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
    debug!("Signaling writer terminated");
}

/// Reader task: decodes frames into events until the channel ends
async fn reader_task(
    inner: Weak<ClientInner>,
    mut stream: FrameStream,
    epoch: u64,
    events: mpsc::UnboundedSender<SignalingEvent>,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(text) => match ServerMessage::from_json(&text) {
                Ok(ServerMessage::Unknown) => {
                    debug!("Ignoring unknown signaling message: {}", text);
                }
                Ok(msg) => {
                    debug!(kind = msg.kind(), "Received signaling message");
                    if events.send(SignalingEvent::Message(msg)).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to decode signaling message: {}", e),
            },
            Err(e) => {
                warn!("Signaling channel error: {}", e);
                break;
            }
        }
    }

    debug!("Signaling reader terminated");
    if let Some(inner) = inner.upgrade() {
        on_closed(&inner, epoch);
    }
}
