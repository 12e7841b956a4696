//! Audio analysis graph
//!
//! An [`AudioGraph`] pumps a [`MediaStream`] into an [`Analyser`] that keeps
//! the most recent `FFT_SIZE` samples and renders a byte-scaled spectrum the
//! way a browser analyser node does (Blackman window, 0.8 smoothing,
//! -100..-30 dB range). The graph is the only owner of the analyser;
//! [`AnalysisHandle`]s observe it weakly and go dark once the graph closes.

use super::stream::{AudioFrame, MediaStream};
use parking_lot::Mutex;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::debug;

/// Analysis window length
pub const FFT_SIZE: usize = 256;

/// Number of frequency bins reported
pub const FREQUENCY_BIN_COUNT: usize = FFT_SIZE / 2;

const SMOOTHING_TIME_CONSTANT: f32 = 0.8;
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

struct AnalyserState {
    window: VecDeque<f32>,
    smoothed: Vec<f32>,
}

/// Spectrum analyser over the most recent `FFT_SIZE` samples
pub struct Analyser {
    fft: Arc<dyn Fft<f32>>,
    blackman: Vec<f32>,
    state: Mutex<AnalyserState>,
}

impl Analyser {
    pub fn new() -> Self {
        let fft = FftPlanner::new().plan_fft_forward(FFT_SIZE);
        let blackman = (0..FFT_SIZE)
            .map(|i| {
                let x = i as f32 / FFT_SIZE as f32;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();

        Self {
            fft,
            blackman,
            state: Mutex::new(AnalyserState {
                window: std::iter::repeat(0.0).take(FFT_SIZE).collect(),
                smoothed: vec![0.0; FREQUENCY_BIN_COUNT],
            }),
        }
    }

    /// Append samples, keeping only the latest `FFT_SIZE`
    pub fn push(&self, samples: &[f32]) {
        let mut state = self.state.lock();
        let tail = &samples[samples.len().saturating_sub(FFT_SIZE)..];
        let overflow = (state.window.len() + tail.len()).saturating_sub(FFT_SIZE);
        state.window.drain(..overflow);
        state.window.extend(tail.iter().copied());
    }

    /// Byte-scaled magnitude spectrum, `FREQUENCY_BIN_COUNT` entries
    pub fn frequency_data(&self) -> Vec<u8> {
        let mut state = self.state.lock();

        let mut buffer: Vec<Complex<f32>> = state
            .window
            .iter()
            .zip(&self.blackman)
            .map(|(&s, &w)| Complex::new(s * w, 0.0))
            .collect();
        self.fft.process(&mut buffer);

        let scale = 1.0 / FFT_SIZE as f32;
        let range = MAX_DECIBELS - MIN_DECIBELS;
        let mut out = Vec::with_capacity(FREQUENCY_BIN_COUNT);

        for (bin, value) in buffer.iter().take(FREQUENCY_BIN_COUNT).enumerate() {
            let magnitude = value.norm() * scale;
            let smoothed = SMOOTHING_TIME_CONSTANT * state.smoothed[bin]
                + (1.0 - SMOOTHING_TIME_CONSTANT) * magnitude;
            state.smoothed[bin] = smoothed;

            let db = if smoothed > 0.0 {
                20.0 * smoothed.log10()
            } else {
                f32::NEG_INFINITY
            };
            let scaled = 255.0 * (db - MIN_DECIBELS) / range;
            out.push(scaled.clamp(0.0, 255.0) as u8);
        }

        out
    }

    /// Copy of the current time-domain window
    pub fn time_domain_data(&self) -> Vec<f32> {
        self.state.lock().window.iter().copied().collect()
    }
}

impl Default for Analyser {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-owning view of a graph's analyser
#[derive(Clone)]
pub struct AnalysisHandle {
    analyser: Weak<Analyser>,
}

impl AnalysisHandle {
    /// Spectrum of the live graph, or `None` once it is torn down
    pub fn frequency_data(&self) -> Option<Vec<u8>> {
        self.analyser.upgrade().map(|a| a.frequency_data())
    }

    pub fn time_domain_data(&self) -> Option<Vec<f32>> {
        self.analyser.upgrade().map(|a| a.time_domain_data())
    }

    pub fn frequency_bin_count(&self) -> usize {
        FREQUENCY_BIN_COUNT
    }

    /// Whether the graph behind this handle is still alive
    pub fn is_live(&self) -> bool {
        self.analyser.strong_count() > 0
    }
}

impl std::fmt::Debug for AnalysisHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisHandle")
            .field("live", &self.is_live())
            .finish()
    }
}

/// Analysis graph attached to one stream
pub struct AudioGraph {
    analyser: Option<Arc<Analyser>>,
    pump: Option<JoinHandle<()>>,
    stream: MediaStream,
}

impl AudioGraph {
    /// Attach a new graph to `stream`
    pub fn attach(stream: &MediaStream) -> Self {
        let analyser = Arc::new(Analyser::new());
        let frames = stream.subscribe();
        let pump = tokio::spawn(pump(stream.clone(), frames, Arc::downgrade(&analyser)));
        debug!(stream = stream.id(), "Audio graph attached");

        Self {
            analyser: Some(analyser),
            pump: Some(pump),
            stream: stream.clone(),
        }
    }

    pub fn analysis_handle(&self) -> AnalysisHandle {
        AnalysisHandle {
            analyser: self
                .analyser
                .as_ref()
                .map(Arc::downgrade)
                .unwrap_or_default(),
        }
    }

    /// Stream this graph analyses
    pub fn stream(&self) -> &MediaStream {
        &self.stream
    }

    /// Tear down the graph; idempotent
    pub fn close(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if self.analyser.take().is_some() {
            debug!(stream = self.stream.id(), "Audio graph closed");
        }
    }
}

impl Drop for AudioGraph {
    fn drop(&mut self) {
        self.close();
    }
}

async fn pump(
    stream: MediaStream,
    mut frames: broadcast::Receiver<AudioFrame>,
    analyser: Weak<Analyser>,
) {
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(frame) => match analyser.upgrade() {
                    Some(analyser) => analyser.push(&frame.samples),
                    None => break,
                },
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Analysis pump lagging");
                }
                Err(RecvError::Closed) => break,
            },
            _ = stream.ended() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / sample_rate).sin())
            .collect()
    }

    #[test]
    fn test_silence_is_floor() {
        let analyser = Analyser::new();
        let data = analyser.frequency_data();
        assert_eq!(data.len(), FREQUENCY_BIN_COUNT);
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_tone_peaks_at_its_bin() {
        let analyser = Analyser::new();
        // 16 kHz / 256 = 62.5 Hz per bin; 1 kHz lands in bin 16.
        let quiet: Vec<f32> = sine(1000.0, 16000.0, FFT_SIZE)
            .into_iter()
            .map(|s| s * 0.01)
            .collect();
        analyser.push(&quiet);

        let data = analyser.frequency_data();
        let peak = data
            .iter()
            .enumerate()
            .max_by_key(|(_, &v)| v)
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 16);
        assert!(data[16] > 0);
    }

    #[test]
    fn test_push_keeps_latest_window() {
        let analyser = Analyser::new();
        analyser.push(&vec![1.0; FFT_SIZE * 2]);
        analyser.push(&[0.5; 10]);

        let window = analyser.time_domain_data();
        assert_eq!(window.len(), FFT_SIZE);
        assert_eq!(window[FFT_SIZE - 1], 0.5);
        assert_eq!(window[0], 1.0);
    }

    #[tokio::test]
    async fn test_handle_goes_dark_after_close() {
        let stream = MediaStream::new(16000);
        let mut graph = AudioGraph::attach(&stream);
        let handle = graph.analysis_handle();
        assert!(handle.frequency_data().is_some());

        graph.close();
        assert!(!handle.is_live());
        assert!(handle.frequency_data().is_none());
    }

    #[tokio::test]
    async fn test_graph_follows_stream() {
        let stream = MediaStream::new(16000);
        let graph = AudioGraph::attach(&stream);
        let handle = graph.analysis_handle();

        stream.push_samples(&sine(1000.0, 16000.0, FFT_SIZE));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let window = handle.time_domain_data().unwrap();
        assert!(window.iter().any(|&s| s != 0.0));
    }
}
