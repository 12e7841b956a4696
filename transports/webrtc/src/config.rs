//! Configuration types for the voice streaming session

use crate::media::capture::CaptureConstraints;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default signaling port used when no endpoint is configured
pub const DEFAULT_SIGNALING_PORT: u16 = 8080;

/// Default signaling path used when the endpoint carries none
pub const DEFAULT_SIGNALING_PATH: &str = "/ws";

/// Default interval between stream re-polls in watch mode
pub const DEFAULT_WATCH_INTERVAL_MS: u64 = 5000;

/// Main configuration for a `SessionManager`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Signaling endpoint: bare `host[:port][/path]` or a full URL.
    /// `None` derives one from `page`.
    pub server_url: Option<String>,

    /// Capture echo cancellation (default: true)
    pub echo_cancellation: bool,

    /// Capture noise suppression (default: true)
    pub noise_suppression: bool,

    /// Capture automatic gain control (default: true)
    pub auto_gain_control: bool,

    /// Location of the embedding page, used for endpoint resolution
    pub page: PageLocation,

    /// Signaling reconnection settings
    pub reconnect: ReconnectConfig,

    /// Media transport settings
    pub transport: TransportConfig,

    /// Stream re-poll interval in watch mode (default: 5000ms)
    pub watch_interval_ms: u64,
}

/// Where the client is embedded; stands in for the browser's page location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageLocation {
    /// Host name of the embedding page
    pub host: String,

    /// Whether the page was served over a secure scheme
    pub secure: bool,
}

/// Signaling reconnection settings (exponential backoff)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry in milliseconds (default: 1000)
    pub base_delay_ms: u64,

    /// Upper bound for any retry delay in milliseconds (default: 30000)
    pub max_delay_ms: u64,

    /// Backoff multiplier (default: 1.5)
    pub factor: f64,

    /// Consecutive failures tolerated before giving up (default: 5)
    pub max_retries: u32,
}

/// Media transport settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// ICE server URLs. Empty keeps negotiation on the local network.
    pub ice_servers: Vec<String>,
}

/// Partial configuration update; only `Some` fields are merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// New signaling endpoint
    pub server_url: Option<String>,

    /// New echo cancellation setting
    pub echo_cancellation: Option<bool>,

    /// New noise suppression setting
    pub noise_suppression: Option<bool>,

    /// New automatic gain control setting
    pub auto_gain_control: Option<bool>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            page: PageLocation::default(),
            reconnect: ReconnectConfig::default(),
            transport: TransportConfig::default(),
            watch_interval_ms: DEFAULT_WATCH_INTERVAL_MS,
        }
    }
}

impl Default for PageLocation {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            secure: false,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            factor: 1.5,
            max_retries: 5,
        }
    }
}

impl SessionConfig {
    /// Create a configuration pointing at an explicit endpoint
    pub fn with_server_url(server_url: impl Into<String>) -> Self {
        Self {
            server_url: Some(server_url.into()),
            ..Default::default()
        }
    }

    /// Merge the defined fields of `options` into this configuration
    pub fn merge(&mut self, options: &SessionOptions) {
        if let Some(url) = &options.server_url {
            self.server_url = Some(url.clone());
        }
        if let Some(v) = options.echo_cancellation {
            self.echo_cancellation = v;
        }
        if let Some(v) = options.noise_suppression {
            self.noise_suppression = v;
        }
        if let Some(v) = options.auto_gain_control {
            self.auto_gain_control = v;
        }
    }

    /// Capture constraints derived from the current settings
    pub fn capture_constraints(&self) -> CaptureConstraints {
        CaptureConstraints {
            echo_cancellation: self.echo_cancellation,
            noise_suppression: self.noise_suppression,
            auto_gain_control: self.auto_gain_control,
            ..Default::default()
        }
    }

    /// Watch mode re-poll interval
    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `page.host` is empty
    /// - `reconnect.base_delay_ms` is 0 or exceeds `reconnect.max_delay_ms`
    /// - `reconnect.factor` is below 1.0
    /// - `watch_interval_ms` is 0
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.page.host.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "page host must not be empty".to_string(),
            ));
        }

        if self.reconnect.base_delay_ms == 0
            || self.reconnect.base_delay_ms > self.reconnect.max_delay_ms
        {
            return Err(Error::InvalidConfig(format!(
                "reconnect delays must satisfy 0 < base <= max, got base={} max={}",
                self.reconnect.base_delay_ms, self.reconnect.max_delay_ms
            )));
        }

        if !self.reconnect.factor.is_finite() || self.reconnect.factor < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "reconnect factor must be >= 1.0, got {}",
                self.reconnect.factor
            )));
        }

        if self.watch_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "watch_interval_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
