//! Audio capture devices
//!
//! The session opens exactly one capture handle while sending. Hosts plug in
//! their platform device through [`CaptureDevice`]; [`PcmCaptureDevice`] is
//! an exclusive device fed with PCM by the host through a [`PcmFeed`].

use super::stream::MediaStream;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Capture sample rate suited to voice
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;

/// Constraints applied when opening a capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub channel_count: u16,
    pub sample_rate: u32,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            channel_count: 1,
            sample_rate: CAPTURE_SAMPLE_RATE,
        }
    }
}

/// A source of local audio
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Open the device.
    ///
    /// # Errors
    ///
    /// Returns `Error::CaptureError` when the device is unavailable or
    /// permission is denied.
    async fn open(&self, constraints: &CaptureConstraints) -> Result<Box<dyn CaptureHandle>>;
}

/// An open capture; releases the device on `stop` or drop
pub trait CaptureHandle: Send + Sync {
    /// Stream of captured audio
    fn stream(&self) -> MediaStream;

    /// Release the device; idempotent
    fn stop(&mut self);
}

#[derive(Default)]
struct PcmShared {
    active: Option<MediaStream>,
    last_constraints: Option<CaptureConstraints>,
}

/// Exclusive capture device whose samples are supplied by the host.
///
/// A second concurrent `open` fails with "device busy".
#[derive(Clone)]
pub struct PcmCaptureDevice {
    shared: Arc<Mutex<PcmShared>>,
}

/// Host side of a [`PcmCaptureDevice`]
#[derive(Clone)]
pub struct PcmFeed {
    shared: Arc<Mutex<PcmShared>>,
}

impl PcmCaptureDevice {
    /// Create a device and the feed that supplies it
    pub fn new() -> (Self, PcmFeed) {
        let shared = Arc::new(Mutex::new(PcmShared::default()));
        (
            Self {
                shared: shared.clone(),
            },
            PcmFeed { shared },
        )
    }

    /// Whether a capture handle is currently open
    pub fn is_open(&self) -> bool {
        self.shared.lock().active.is_some()
    }

    /// Constraints of the most recent successful open
    pub fn last_constraints(&self) -> Option<CaptureConstraints> {
        self.shared.lock().last_constraints
    }
}

#[async_trait]
impl CaptureDevice for PcmCaptureDevice {
    async fn open(&self, constraints: &CaptureConstraints) -> Result<Box<dyn CaptureHandle>> {
        if constraints.channel_count != 1 {
            return Err(Error::CaptureError(format!(
                "unsupported channel count {}",
                constraints.channel_count
            )));
        }

        let mut shared = self.shared.lock();
        if shared.active.is_some() {
            return Err(Error::CaptureError("device busy".to_string()));
        }

        let stream = MediaStream::new(constraints.sample_rate);
        shared.active = Some(stream.clone());
        shared.last_constraints = Some(*constraints);
        info!(
            sample_rate = constraints.sample_rate,
            echo_cancellation = constraints.echo_cancellation,
            noise_suppression = constraints.noise_suppression,
            auto_gain_control = constraints.auto_gain_control,
            "Capture opened"
        );

        Ok(Box::new(PcmCaptureHandle {
            shared: self.shared.clone(),
            stream,
            stopped: false,
        }))
    }
}

impl PcmFeed {
    /// Deliver samples to the open capture; returns `false` if none is open
    pub fn push(&self, samples: &[f32]) -> bool {
        let stream = self.shared.lock().active.clone();
        match stream {
            Some(stream) => stream.push_samples(samples),
            None => false,
        }
    }

    /// Sample rate requested by the open capture
    pub fn sample_rate(&self) -> Option<u32> {
        self.shared.lock().active.as_ref().map(MediaStream::sample_rate)
    }
}

struct PcmCaptureHandle {
    shared: Arc<Mutex<PcmShared>>,
    stream: MediaStream,
    stopped: bool,
}

impl CaptureHandle for PcmCaptureHandle {
    fn stream(&self) -> MediaStream {
        self.stream.clone()
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        let mut shared = self.shared.lock();
        if shared
            .active
            .as_ref()
            .is_some_and(|active| active.same_stream(&self.stream))
        {
            shared.active = None;
        }
        drop(shared);

        self.stream.end();
        debug!("Capture stopped");
    }
}

impl Drop for PcmCaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
