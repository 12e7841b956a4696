//! Command line client for the audio relay
//!
//! # Usage
//!
//! ```bash
//! # Subscribe to whatever the relay offers and follow new streams
//! cargo run --bin voicestream -- --server-url relay.local:8080 listen --watch
//!
//! # List the published streams once
//! cargo run --bin voicestream -- streams
//!
//! # Publish a 440 Hz test tone
//! cargo run --bin voicestream -- send --tone 440
//! ```

use clap::{Parser, Subcommand};
use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use voicestream_webrtc::config::{PageLocation, ReconnectConfig, TransportConfig};
use voicestream_webrtc::media::audio::FRAME_DURATION_MS;
use voicestream_webrtc::signaling::{resolve_endpoint, ClientMessage, ServerMessage};
use voicestream_webrtc::{
    PcmCaptureDevice, PcmFeed, SessionConfig, SessionEvent, SessionManager, SignalingClient,
};

/// Live audio relay client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Signaling endpoint: host[:port][/path] or a full URL
    #[arg(long, env = "VOICESTREAM_SERVER_URL")]
    server_url: Option<String>,

    /// Host used to derive the endpoint when none is given
    #[arg(long, default_value = "localhost", env = "VOICESTREAM_HOST")]
    host: String,

    /// Use secure schemes when deriving the endpoint
    #[arg(long, env = "VOICESTREAM_SECURE")]
    secure: bool,

    /// Capture echo cancellation
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "VOICESTREAM_ECHO_CANCELLATION")]
    echo_cancellation: bool,

    /// Capture noise suppression
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "VOICESTREAM_NOISE_SUPPRESSION")]
    noise_suppression: bool,

    /// Capture automatic gain control
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "VOICESTREAM_AUTO_GAIN_CONTROL")]
    auto_gain_control: bool,

    /// ICE servers (comma-separated); empty keeps media on the local network
    #[arg(long, value_delimiter = ',', env = "VOICESTREAM_ICE_SERVERS")]
    ice_servers: Vec<String>,

    /// Signaling reconnect attempts before giving up
    #[arg(long, default_value_t = 5, env = "VOICESTREAM_MAX_RETRIES")]
    max_retries: u32,

    /// Initial reconnect delay in milliseconds
    #[arg(long, default_value_t = 1000, env = "VOICESTREAM_RECONNECT_BASE_MS")]
    reconnect_base_ms: u64,

    /// Maximum reconnect delay in milliseconds
    #[arg(long, default_value_t = 30000, env = "VOICESTREAM_RECONNECT_MAX_MS")]
    reconnect_max_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a stream and report events
    Listen {
        /// Stream to subscribe to; the relay picks one when omitted
        #[arg(long)]
        stream: Option<String>,

        /// Poll for streams and follow the newest one
        #[arg(long)]
        watch: bool,

        /// Poll interval in watch mode
        #[arg(long, default_value_t = 5000, env = "VOICESTREAM_WATCH_INTERVAL_MS")]
        watch_interval_ms: u64,
    },

    /// List the streams currently published
    Streams {
        /// Seconds to wait for the relay's answer
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },

    /// Publish a generated tone
    Send {
        /// Tone frequency in Hz
        #[arg(long, default_value_t = 440.0)]
        tone: f32,

        /// Tone amplitude (0.0 - 1.0)
        #[arg(long, default_value_t = 0.2)]
        amplitude: f32,
    },
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            server_url: self.server_url.clone(),
            echo_cancellation: self.echo_cancellation,
            noise_suppression: self.noise_suppression,
            auto_gain_control: self.auto_gain_control,
            page: PageLocation {
                host: self.host.clone(),
                secure: self.secure,
            },
            reconnect: ReconnectConfig {
                base_delay_ms: self.reconnect_base_ms,
                max_delay_ms: self.reconnect_max_ms,
                max_retries: self.max_retries,
                ..Default::default()
            },
            transport: TransportConfig {
                ice_servers: self.ice_servers.clone(),
            },
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    info!(
        version = voicestream_webrtc::version(),
        command = ?args.command,
        "voicestream starting"
    );

    let config = args.session_config();
    match args.command {
        Command::Listen {
            stream,
            watch,
            watch_interval_ms,
        } => listen(config, stream, watch, watch_interval_ms).await?,
        Command::Streams { timeout_secs } => list_streams(config, timeout_secs).await?,
        Command::Send { tone, amplitude } => send(config, tone, amplitude).await?,
    }

    Ok(())
}

async fn listen(
    config: SessionConfig,
    stream: Option<String>,
    watch: bool,
    watch_interval_ms: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let (device, _feed) = PcmCaptureDevice::new();
    let manager = SessionManager::new(config, Arc::new(device))?;
    let (_subscription, mut events) = manager.subscribe_channel();

    if watch {
        manager
            .watch_streams(Some(Duration::from_millis(watch_interval_ms)))
            .await?;
    } else {
        manager.start_receiving(stream.map(Into::into)).await?;
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Ctrl+C received, shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(SessionEvent::AudioData { timestamp }) => {
                    info!(latency_ms = (manager.latency_of(timestamp) * 1000.0).round(), "Audio data");
                }
                Some(SessionEvent::Track { stream }) => {
                    let handle = manager.analysis_handle();
                    info!(
                        stream = stream.id(),
                        bins = ?handle.map(|h| h.frequency_bin_count()),
                        "Playing inbound stream"
                    );
                }
                Some(event) => log_event(&event),
                None => break,
            }
        }
    }

    manager.stop().await?;
    Ok(())
}

async fn list_streams(
    config: SessionConfig,
    timeout_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let url = resolve_endpoint(config.server_url.as_deref(), &config.page)?;
    let client = SignalingClient::websocket(&config.reconnect);

    let (tx, rx) = oneshot::channel();
    let mut tx = Some(tx);
    let consumer = client.on_message(move |msg| {
        if let ServerMessage::AvailableStreams { streams } = msg {
            if let Some(tx) = tx.take() {
                let _ = tx.send(streams);
            }
        }
        futures::future::ready(())
    })?;

    client.connect(&url).await?;
    client.send(&ClientMessage::GetAvailableStreams);

    match tokio::time::timeout(Duration::from_secs(timeout_secs), rx).await {
        Ok(Ok(streams)) if streams.is_empty() => println!("No streams available"),
        Ok(Ok(streams)) => {
            for stream in streams {
                println!("{stream}");
            }
        }
        _ => warn!("Relay did not answer within {}s", timeout_secs),
    }

    client.stop();
    consumer.abort();
    Ok(())
}

async fn send(
    config: SessionConfig,
    tone: f32,
    amplitude: f32,
) -> Result<(), Box<dyn std::error::Error>> {
    let (device, feed) = PcmCaptureDevice::new();
    let manager = SessionManager::new(config, Arc::new(device))?;
    let (_subscription, mut events) = manager.subscribe_channel();

    manager.start_sending().await?;
    let generator = tokio::spawn(generate_tone(feed, tone, amplitude.clamp(0.0, 1.0)));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Ctrl+C received, shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            }
        }
    }

    generator.abort();
    manager.stop().await?;
    Ok(())
}

/// Feed a sine tone into the capture in real time
async fn generate_tone(feed: PcmFeed, frequency: f32, amplitude: f32) {
    let mut ticker = tokio::time::interval(Duration::from_millis(FRAME_DURATION_MS as u64));
    let mut phase = 0.0f32;

    loop {
        ticker.tick().await;
        let Some(sample_rate) = feed.sample_rate() else {
            continue;
        };

        let step = 2.0 * PI * frequency / sample_rate as f32;
        let frame: Vec<f32> = (0..sample_rate * FRAME_DURATION_MS / 1000)
            .map(|_| {
                let sample = phase.sin() * amplitude;
                phase = (phase + step) % (2.0 * PI);
                sample
            })
            .collect();
        feed.push(&frame);
    }
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged {
            state,
            error: Some(message),
        } if *state == voicestream_webrtc::ConnectionState::Error => {
            error!(%state, "{}", message)
        }
        SessionEvent::StateChanged { state, error } => info!(%state, ?error, "State changed"),
        SessionEvent::StreamsChanged { streams } => info!(?streams, "Streams changed"),
        SessionEvent::StreamAdded { stream_id } => info!(stream = %stream_id, "Stream added"),
        SessionEvent::StreamRemoved { stream_id } => info!(stream = %stream_id, "Stream removed"),
        SessionEvent::Track { stream } => info!(stream = stream.id(), "Track"),
        SessionEvent::AudioData { timestamp } => info!(timestamp, "Audio data"),
        SessionEvent::ServerError { message } => warn!("Relay error: {}", message),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,voicestream_webrtc=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
