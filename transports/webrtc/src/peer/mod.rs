//! WebRTC peer connection backed media transport

pub mod connection;

pub use connection::{RtcMediaTransport, RtcTransportFactory};
