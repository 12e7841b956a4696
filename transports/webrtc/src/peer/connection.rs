//! WebRTC peer connection backed media transport

use crate::config::TransportConfig;
use crate::media::audio::{AudioCodecConfig, AudioDecoder, AudioEncoder, FRAME_DURATION_MS, OPUS_CLOCK_RATE};
use crate::media::stream::MediaStream;
use crate::media::transport::{
    IceConnectionState, MediaTransport, MediaTransportFactory, SignalingState, TransportEvent,
    TransportEventSender,
};
use crate::signaling::protocol::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Background tasks owned by one connection
#[derive(Default)]
struct ConnectionTasks {
    handles: Vec<JoinHandle<()>>,
    inbound: Vec<MediaStream>,
}

/// Media transport over a webrtc-rs peer connection.
///
/// Sends one Opus audio track fed from a [`MediaStream`] and turns each
/// inbound audio track into a decoded [`MediaStream`].
pub struct RtcMediaTransport {
    peer_connection: Arc<RTCPeerConnection>,
    tasks: Arc<Mutex<ConnectionTasks>>,
    closed: Arc<AtomicBool>,
    connection_id: String,
}

impl RtcMediaTransport {
    /// Create a peer connection and wire its callbacks to `events`
    #[instrument(skip_all)]
    pub async fn new(config: &TransportConfig, events: TransportEventSender) -> Result<Self> {
        let connection_id = uuid::Uuid::new_v4().to_string();
        info!("Creating peer connection: connection_id={}", connection_id);

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = config
            .ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        };

        let peer_connection =
            Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
                Error::WebRtcError(format!("Failed to create peer connection: {}", e))
            })?);

        let tasks = Arc::new(Mutex::new(ConnectionTasks::default()));
        let closed = Arc::new(AtomicBool::new(false));

        let tx = events.clone();
        let is_closed = closed.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            let is_closed = is_closed.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                if is_closed.load(Ordering::SeqCst) {
                    return;
                }
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::IceCandidate(from_candidate_init(init)));
                    }
                    Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        let tx = events.clone();
        let is_closed = closed.clone();
        peer_connection.on_ice_connection_state_change(Box::new(
            move |state: RTCIceConnectionState| {
                let tx = tx.clone();
                let is_closed = is_closed.clone();
                Box::pin(async move {
                    debug!("ICE connection state: {}", state);
                    if is_closed.load(Ordering::SeqCst) {
                        return;
                    }
                    if let Some(state) = map_ice_state(state) {
                        let _ = tx.send(TransportEvent::IceConnectionState(state));
                    }
                })
            },
        ));

        let tx = events;
        let is_closed = closed.clone();
        let track_tasks = tasks.clone();
        peer_connection.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let tx = tx.clone();
            let is_closed = is_closed.clone();
            let track_tasks = track_tasks.clone();
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio || is_closed.load(Ordering::SeqCst) {
                    return;
                }
                match AudioDecoder::new(OPUS_CLOCK_RATE) {
                    Ok(decoder) => {
                        let stream = MediaStream::new(OPUS_CLOCK_RATE);
                        info!(stream = stream.id(), "Inbound audio track");
                        let reader = tokio::spawn(read_remote_track(track, decoder, stream.clone()));
                        {
                            let mut tasks = track_tasks.lock();
                            tasks.handles.push(reader);
                            tasks.inbound.push(stream.clone());
                        }
                        let _ = tx.send(TransportEvent::Track(stream));
                    }
                    Err(e) => warn!("Cannot decode inbound track: {}", e),
                }
            })
        }));

        Ok(Self {
            peer_connection,
            tasks,
            closed,
            connection_id,
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    async fn apply_local(&self, desc: RTCSessionDescription) -> Result<SessionDescription> {
        self.peer_connection
            .set_local_description(desc)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| Error::SdpError("No local description after setting it".to_string()))?;

        from_rtc_description(&local)
    }
}

#[async_trait]
impl MediaTransport for RtcMediaTransport {
    async fn add_track(&self, stream: &MediaStream) -> Result<()> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: 1,
                ..Default::default()
            },
            format!("audio-{}", self.connection_id),
            format!("stream-{}", stream.id()),
        ));

        let sender = self
            .peer_connection
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to add audio track: {}", e)))?;

        let encoder = AudioEncoder::new(AudioCodecConfig {
            sample_rate: stream.sample_rate(),
            ..Default::default()
        })?;

        // RTCP must be drained for interceptors to run.
        let rtcp = tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        let writer = tokio::spawn(write_local_track(track, encoder, stream.clone()));

        let mut tasks = self.tasks.lock();
        tasks.handles.push(rtcp);
        tasks.handles.push(writer);
        debug!(stream = stream.id(), "Local audio track added");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<SessionDescription> {
        self.apply_local(to_rtc_description(desc)?).await
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    fn signaling_state(&self) -> SignalingState {
        match self.peer_connection.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing peer connection {}", self.connection_id);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for handle in tasks.handles {
            handle.abort();
        }
        for stream in tasks.inbound {
            stream.end();
        }

        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::PeerConnectionError(format!("Failed to close connection: {}", e)))
    }
}

/// Creates [`RtcMediaTransport`]s
#[derive(Debug, Default, Clone)]
pub struct RtcTransportFactory;

#[async_trait]
impl MediaTransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        config: &TransportConfig,
        events: TransportEventSender,
    ) -> Result<Arc<dyn MediaTransport>> {
        Ok(Arc::new(RtcMediaTransport::new(config, events).await?))
    }
}

/// Encode captured audio into 20ms Opus samples
async fn write_local_track(
    track: Arc<TrackLocalStaticSample>,
    mut encoder: AudioEncoder,
    stream: MediaStream,
) {
    let mut frames = stream.subscribe();
    let frame_duration = Duration::from_millis(FRAME_DURATION_MS as u64);

    loop {
        let frame = tokio::select! {
            frame = frames.recv() => frame,
            _ = stream.ended() => break,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Local track writer lagging");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let packets = match encoder.encode(&frame.samples) {
            Ok(packets) => packets,
            Err(e) => {
                warn!("Dropping captured frame: {}", e);
                continue;
            }
        };

        for packet in packets {
            let sample = Sample {
                data: Bytes::from(packet),
                duration: frame_duration,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                warn!("Failed to write audio sample: {}", e);
                return;
            }
        }
    }
    debug!("Local track writer terminated");
}

/// Decode an inbound Opus track into `stream` until the track ends
async fn read_remote_track(track: Arc<TrackRemote>, mut decoder: AudioDecoder, stream: MediaStream) {
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                if packet.payload.is_empty() {
                    continue;
                }
                match decoder.decode(&packet.payload) {
                    Ok(samples) => {
                        stream.push_samples(&samples);
                    }
                    Err(e) => debug!("Skipping undecodable packet: {}", e),
                }
            }
            Err(e) => {
                debug!("Inbound track ended: {}", e);
                break;
            }
        }
    }
    stream.end();
}

fn from_rtc_description(desc: &RTCSessionDescription) -> Result<SessionDescription> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => {
            return Err(Error::SdpError(format!(
                "Unsupported description type: {}",
                desc.sdp_type
            )))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp.clone(),
    })
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => {
            return Err(Error::SdpError("Rollback descriptions are not supported".to_string()))
        }
    };
    parsed.map_err(|e| Error::SdpError(format!("Failed to parse description: {}", e)))
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn transport() -> (RtcMediaTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = RtcMediaTransport::new(&TransportConfig::default(), tx)
            .await
            .unwrap();
        (transport, rx)
    }

    #[tokio::test]
    async fn test_new_transport_is_stable() {
        let (transport, _rx) = transport().await;
        assert_eq!(transport.signaling_state(), SignalingState::Stable);
        assert!(!transport.connection_id().is_empty());
    }

    #[tokio::test]
    async fn test_offer_with_audio_track() {
        let (transport, _rx) = transport().await;
        transport.add_track(&MediaStream::new(16000)).await.unwrap();

        let offer = transport.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));

        let applied = transport.set_local_description(offer).await.unwrap();
        assert_eq!(applied.kind, SdpType::Offer);
        assert_eq!(transport.signaling_state(), SignalingState::HaveLocalOffer);
    }

    #[tokio::test]
    async fn test_answer_between_two_transports() {
        let (sender, _srx) = transport().await;
        let (receiver, _rrx) = transport().await;
        sender.add_track(&MediaStream::new(16000)).await.unwrap();

        let offer = sender.create_offer().await.unwrap();
        let offer = sender.set_local_description(offer).await.unwrap();

        receiver.set_remote_description(offer).await.unwrap();
        assert_eq!(receiver.signaling_state(), SignalingState::HaveRemoteOffer);
        let answer = receiver.create_answer().await.unwrap();
        let answer = receiver.set_local_description(answer).await.unwrap();
        assert_eq!(answer.kind, SdpType::Answer);

        sender.set_remote_description(answer).await.unwrap();
        assert_eq!(sender.signaling_state(), SignalingState::Stable);

        sender.close().await.unwrap();
        receiver.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_malformed_candidate() {
        let (transport, _rx) = transport().await;
        let result = transport
            .add_ice_candidate(IceCandidate {
                candidate: "not a candidate".to_string(),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(Error::IceCandidateError(_))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (transport, _rx) = transport().await;
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(transport.closed.load(Ordering::SeqCst));
    }
}
