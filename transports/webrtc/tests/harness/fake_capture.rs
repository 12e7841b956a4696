//! Capture device that can refuse access

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use voicestream_webrtc::media::{CaptureConstraints, CaptureDevice, CaptureHandle, MediaStream};
use voicestream_webrtc::{Error, Result};

/// Message of a denied capture
pub const PERMISSION_DENIED: &str = "Permission denied";

#[derive(Default)]
struct CaptureState {
    deny_next: usize,
    open: usize,
    max_open: usize,
    opens: usize,
    last_constraints: Option<CaptureConstraints>,
}

/// Capture device counting its open handles
#[derive(Default)]
pub struct FakeCaptureDevice {
    state: Arc<Mutex<CaptureState>>,
}

impl FakeCaptureDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deny the next `n` opens with "Permission denied"
    pub fn deny_next(&self, n: usize) {
        self.state.lock().deny_next = n;
    }

    /// Handles currently open
    pub fn open_handles(&self) -> usize {
        self.state.lock().open
    }

    /// Highest number of simultaneously open handles
    pub fn max_open(&self) -> usize {
        self.state.lock().max_open
    }

    /// Successful opens so far
    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }

    pub fn last_constraints(&self) -> Option<CaptureConstraints> {
        self.state.lock().last_constraints
    }
}

#[async_trait]
impl CaptureDevice for FakeCaptureDevice {
    async fn open(&self, constraints: &CaptureConstraints) -> Result<Box<dyn CaptureHandle>> {
        let mut state = self.state.lock();
        if state.deny_next > 0 {
            state.deny_next -= 1;
            return Err(Error::CaptureError(PERMISSION_DENIED.to_string()));
        }

        state.open += 1;
        state.opens += 1;
        state.max_open = state.max_open.max(state.open);
        state.last_constraints = Some(*constraints);

        Ok(Box::new(FakeCaptureHandle {
            state: self.state.clone(),
            stream: MediaStream::new(constraints.sample_rate),
            stopped: false,
        }))
    }
}

struct FakeCaptureHandle {
    state: Arc<Mutex<CaptureState>>,
    stream: MediaStream,
    stopped: bool,
}

impl CaptureHandle for FakeCaptureHandle {
    fn stream(&self) -> MediaStream {
        self.stream.clone()
    }

    fn stop(&mut self) {
        if std::mem::replace(&mut self.stopped, true) {
            return;
        }
        self.state.lock().open -= 1;
        self.stream.end();
    }
}

impl Drop for FakeCaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
