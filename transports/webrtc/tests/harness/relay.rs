//! In-memory relay
//!
//! Implements `SignalingConnector` so a session talks to it instead of a
//! WebSocket server. Frames sent by the client are recorded; the test pushes
//! relay messages and can drop or refuse connections.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use url::Url;
use voicestream_webrtc::signaling::{SignalingChannel, SignalingConnector};
use voicestream_webrtc::{Error, Result};

#[derive(Default)]
struct RelayState {
    connects: usize,
    refuse_next: usize,
    refuse_all: bool,
    to_client: Option<mpsc::UnboundedSender<Result<String>>>,
    frames: Vec<String>,
    last_url: Option<Url>,
}

/// Scripted relay endpoint
#[derive(Default)]
pub struct ScriptedRelay {
    state: Arc<Mutex<RelayState>>,
}

impl ScriptedRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver a raw JSON frame to the client; `false` if nobody is connected
    pub fn push(&self, json: &str) -> bool {
        match self.state.lock().to_client.as_ref() {
            Some(tx) => tx.unbounded_send(Ok(json.to_string())).is_ok(),
            None => false,
        }
    }

    /// Close the current connection from the relay side
    pub fn drop_connection(&self) {
        self.state.lock().to_client = None;
    }

    /// Refuse the next `n` connection attempts
    pub fn refuse_next(&self, n: usize) {
        self.state.lock().refuse_next = n;
    }

    /// Refuse every connection attempt while `refuse` is set
    pub fn refuse_all(&self, refuse: bool) {
        self.state.lock().refuse_all = refuse;
    }

    /// Successful and refused connection attempts
    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn is_connected(&self) -> bool {
        self.state
            .lock()
            .to_client
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn last_url(&self) -> Option<Url> {
        self.state.lock().last_url.clone()
    }

    /// Frames sent by the client, decoded
    pub fn sent(&self) -> Vec<Value> {
        self.state
            .lock()
            .frames
            .iter()
            .filter_map(|frame| serde_json::from_str(frame).ok())
            .collect()
    }

    /// `type` of every frame sent by the client
    pub fn sent_types(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|frame| frame["type"].as_str().map(str::to_string))
            .collect()
    }

    /// Frames of the given `type`
    pub fn sent_of(&self, kind: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|frame| frame["type"] == kind)
            .collect()
    }

    pub fn clear_sent(&self) {
        self.state.lock().frames.clear();
    }
}

#[async_trait]
impl SignalingConnector for ScriptedRelay {
    async fn connect(&self, url: &Url) -> Result<SignalingChannel> {
        {
            let mut state = self.state.lock();
            state.connects += 1;
            state.last_url = Some(url.clone());
            if state.refuse_all || state.refuse_next > 0 {
                state.refuse_next = state.refuse_next.saturating_sub(1);
                return Err(Error::WebSocketError("connection refused".to_string()));
            }
        }

        let (to_client, inbound) = mpsc::unbounded();
        let (outbound, mut from_client) = mpsc::unbounded::<String>();
        self.state.lock().to_client = Some(to_client);

        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(frame) = from_client.next().await {
                state.lock().frames.push(frame);
            }
        });

        let sink = outbound.sink_map_err(|e| Error::WebSocketError(e.to_string()));
        Ok(SignalingChannel::new(Box::pin(sink), Box::pin(inbound)))
    }
}
