//! Session test harness
//!
//! Provides in-process stand-ins for everything a session talks to:
//! - an in-memory relay speaking the JSON signaling protocol
//! - a scripted media transport factory
//! - a capture device that can deny access
//!
//! Basic usage pattern:
//!
//! 1. Create a `SessionFixture`
//! 2. Drive the manager and push relay messages with `fixture.relay.push(..)`
//! 3. Call `settle().await` and inspect `fixture.events`, the relay frames
//!    and the held-resource counters

#![allow(dead_code)]

pub mod fake_capture;
pub mod fake_transport;
pub mod relay;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use voicestream_webrtc::{ConnectionState, SessionConfig, SessionEvent, SessionManager};

pub use fake_capture::FakeCaptureDevice;
pub use fake_transport::{FakeTransport, FakeTransportFactory, Gate};
pub use relay::ScriptedRelay;

/// Result type for test harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error type for test harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Session error: {0}")]
    Session(#[from] voicestream_webrtc::Error),
}

/// Initialize test logging (call once per test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,voicestream_webrtc=debug")
        .with_test_writer()
        .try_init();
}

/// Let spawned tasks run until the system is quiet
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Poll `check` until it holds; for multi-thread runtimes where yielding
/// does not run the other workers
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Manager wired to in-memory collaborators
pub struct SessionFixture {
    pub manager: SessionManager,
    pub relay: Arc<ScriptedRelay>,
    pub transports: Arc<FakeTransportFactory>,
    pub capture: Arc<FakeCaptureDevice>,
    pub events: EventLog,
}

impl SessionFixture {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::with_server_url("relay.test:8080"))
    }

    pub fn with_config(config: SessionConfig) -> Self {
        init_logging();

        let relay = ScriptedRelay::new();
        let transports = Arc::new(FakeTransportFactory::new());
        let capture = Arc::new(FakeCaptureDevice::new());

        let manager = SessionManager::builder(config)
            .connector(relay.clone())
            .transport_factory(transports.clone())
            .capture_device(capture.clone())
            .build()
            .expect("valid fixture config");
        let (_, rx) = manager.subscribe_channel();

        Self {
            manager,
            relay,
            transports,
            capture,
            events: EventLog { rx },
        }
    }
}

/// Collected session events
pub struct EventLog {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl EventLog {
    /// Everything delivered since the last drain
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            out.push(event);
        }
        out
    }

    /// Wait for the next `StateChanged` to `state`, skipping other events
    pub async fn wait_for_state(
        &mut self,
        state: ConnectionState,
        timeout: Duration,
    ) -> HarnessResult<Option<String>> {
        let wait = async {
            while let Some(event) = self.rx.recv().await {
                if let SessionEvent::StateChanged { state: s, error } = event {
                    if s == state {
                        return Some(error);
                    }
                }
            }
            None
        };

        tokio::time::timeout(timeout, wait)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| HarnessError::Timeout(format!("no transition to {}", state)))
    }
}

/// States carried by the `StateChanged` events in `events`
pub fn states(events: &[SessionEvent]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

/// Number of `Track` events in `events`
pub fn track_count(events: &[SessionEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, SessionEvent::Track { .. }))
        .count()
}
