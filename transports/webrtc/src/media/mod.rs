//! Media plumbing: streams, capture, analysis, Opus codec and the
//! transport abstraction the session negotiates through.

pub mod audio;
pub mod capture;
pub mod graph;
pub mod stream;
pub mod transport;

pub use capture::{CaptureConstraints, CaptureDevice, CaptureHandle, PcmCaptureDevice, PcmFeed};
pub use graph::{AnalysisHandle, AudioGraph};
pub use stream::{AudioFrame, MediaStream};
pub use transport::{
    IceConnectionState, MediaTransport, MediaTransportFactory, SignalingState, TransportEvent,
    TransportEventSender,
};
