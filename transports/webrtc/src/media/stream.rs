//! Observable audio streams

use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Frames buffered per subscriber before the slowest one starts lagging
const STREAM_CAPACITY: usize = 64;

/// A block of mono PCM samples in `[-1.0, 1.0]`
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: impl Into<Arc<[f32]>>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Frame duration in seconds
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

struct StreamInner {
    id: String,
    sample_rate: u32,
    frames: broadcast::Sender<AudioFrame>,
    ended: watch::Sender<bool>,
}

/// Cloneable handle to a live audio stream.
///
/// Producers push frames, any number of consumers subscribe. Once ended a
/// stream accepts no more frames.
#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

impl MediaStream {
    /// Create a stream with a random id
    pub fn new(sample_rate: u32) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), sample_rate)
    }

    pub fn with_id(id: impl Into<String>, sample_rate: u32) -> Self {
        let (frames, _) = broadcast::channel(STREAM_CAPACITY);
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(StreamInner {
                id: id.into(),
                sample_rate,
                frames,
                ended,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Nominal sample rate of frames on this stream
    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    /// Push a frame; returns `false` if the stream has ended
    pub fn push(&self, frame: AudioFrame) -> bool {
        if self.is_ended() {
            return false;
        }
        // No subscribers is not an error; the frame is simply dropped.
        let _ = self.inner.frames.send(frame);
        true
    }

    /// Push raw samples at the stream's sample rate
    pub fn push_samples(&self, samples: &[f32]) -> bool {
        self.push(AudioFrame::new(samples, self.inner.sample_rate))
    }

    /// Subscribe to frames pushed from now on
    pub fn subscribe(&self) -> broadcast::Receiver<AudioFrame> {
        self.inner.frames.subscribe()
    }

    /// Mark the stream as ended; idempotent
    pub fn end(&self) {
        self.inner.ended.send_if_modified(|ended| !std::mem::replace(ended, true));
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Resolve once the stream has ended
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        // The sender lives in `inner`, so `wait_for` only fails if it is dropped.
        let _ = rx.wait_for(|ended| *ended).await;
    }

    /// Whether two handles refer to the same stream
    pub fn same_stream(&self, other: &MediaStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        self.same_stream(other)
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.inner.id)
            .field("sample_rate", &self.inner.sample_rate)
            .field("ended", &self.is_ended())
            .finish()
    }
}
