//! Live audio relay client
//!
//! This crate publishes a live audio stream to a relay server, or subscribes
//! to one of the streams other clients publish there. Media flows over a
//! WebRTC transport negotiated through a reconnecting WebSocket signaling
//! channel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Caller (UI, CLI)                                    │
//! │  ↓ operations            ↑ SessionEvent observers    │
//! │  SessionManager                                      │
//! │  ├─ SignalingClient (JSON over WebSocket, backoff)   │
//! │  ├─ MediaTransport (one live WebRTC peer connection) │
//! │  ├─ CaptureHandle (sending role)                     │
//! │  ├─ AudioGraph → AnalysisHandle                      │
//! │  └─ StreamRegistry + watch timer                     │
//! │     ↓                                                │
//! │  Relay server                                        │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use voicestream_webrtc::SessionConfig;
//!
//! let config = SessionConfig::with_server_url("relay.local:8080");
//! assert!(config.validate().is_ok());
//! assert!(config.echo_cancellation);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use voicestream_webrtc::{PcmCaptureDevice, SessionConfig, SessionEvent, SessionManager};
//!
//! # async fn example() -> voicestream_webrtc::Result<()> {
//! let (device, _feed) = PcmCaptureDevice::new();
//! let manager = SessionManager::new(SessionConfig::default(), Arc::new(device))?;
//!
//! manager.subscribe(|event| {
//!     if let SessionEvent::StateChanged { state, error } = event {
//!         println!("{state} {error:?}");
//!     }
//! });
//! manager.start_receiving(None).await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;

pub use clock::{Clock, SystemClock};
pub use config::{PageLocation, ReconnectConfig, SessionConfig, SessionOptions, TransportConfig};
pub use error::{Error, Result};
pub use media::{AnalysisHandle, CaptureDevice, MediaStream, PcmCaptureDevice, PcmFeed};
pub use session::{
    ConnectionState, Role, SessionEvent, SessionManager, SessionManagerBuilder, SubscriptionId,
};
pub use signaling::{SignalingClient, SignalingEvent, StreamId};

/// Crate version, as reported by the CLI
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
