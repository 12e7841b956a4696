//! Signaling channel connectors
//!
//! A connector opens one duplex text channel to the relay. The production
//! connector speaks WebSocket text frames; tests inject an in-memory relay.

use crate::{Error, Result};
use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};
use url::Url;

/// Outbound half of an open channel
pub type FrameSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;

/// Inbound half of an open channel; ends when the peer closes
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// An open signaling channel carrying one JSON document per frame
pub struct SignalingChannel {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl SignalingChannel {
    /// Build a channel from any sink/stream pair
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<String, Error = Error> + Send + 'static,
        R: Stream<Item = Result<String>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Opens signaling channels
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Open a channel to `url`, resolving once it is usable
    async fn connect(&self, url: &Url) -> Result<SignalingChannel>;
}

/// WebSocket connector built on tokio-tungstenite
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<SignalingChannel> {
        info!("Connecting to signaling server: {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        info!("Connected to signaling server");

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| Error::WebSocketError(format!("Failed to send: {}", e)))
            .with(|text: String| future::ready(Ok::<_, Error>(Message::Text(text))));

        let stream = read
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Binary(bytes)) => {
                        debug!("Ignoring binary signaling frame ({} bytes)", bytes.len());
                        None
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(Error::WebSocketError(e.to_string()))),
                })
            });

        Ok(SignalingChannel::new(sink, stream))
    }
}
