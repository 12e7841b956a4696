//! Signaling endpoint resolution

use crate::config::{PageLocation, DEFAULT_SIGNALING_PATH, DEFAULT_SIGNALING_PORT};
use crate::{Error, Result};
use url::Url;

/// Resolve the WebSocket URL for the relay.
///
/// With no configured endpoint the page host on port 8080 is used. A bare
/// `host[:port][/path]` inherits the page scheme. `https`/`wss` become
/// `wss`, anything else `ws`; an explicit port and path are preserved and an
/// empty path becomes `/ws`.
///
/// # Errors
///
/// Returns `Error::InvalidConfig("Invalid Server URL: ...")` when the
/// endpoint cannot be parsed.
pub fn resolve_endpoint(server_url: Option<&str>, page: &PageLocation) -> Result<Url> {
    let invalid = || Error::InvalidConfig(format!("Invalid Server URL: {}", server_url.unwrap_or("")));

    let raw = match server_url.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => raw,
        None => {
            let scheme = if page.secure { "wss" } else { "ws" };
            let url = format!(
                "{}://{}:{}{}",
                scheme, page.host, DEFAULT_SIGNALING_PORT, DEFAULT_SIGNALING_PATH
            );
            return Url::parse(&url).map_err(|_| {
                Error::InvalidConfig(format!("Invalid page host: {}", page.host))
            });
        }
    };

    let with_scheme = if has_known_scheme(raw) {
        raw.to_string()
    } else {
        let page_scheme = if page.secure { "https" } else { "http" };
        format!("{}://{}", page_scheme, raw)
    };

    let parsed = Url::parse(&with_scheme).map_err(|_| invalid())?;
    let host = parsed.host_str().filter(|h| !h.is_empty()).ok_or_else(invalid)?;

    let scheme = match parsed.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };

    let path = match parsed.path() {
        "" | "/" => DEFAULT_SIGNALING_PATH,
        p => p,
    };

    let resolved = match parsed.port() {
        Some(port) => format!("{}://{}:{}{}", scheme, host, port, path),
        None => format!("{}://{}{}", scheme, host, path),
    };

    Url::parse(&resolved).map_err(|_| invalid())
}

fn has_known_scheme(raw: &str) -> bool {
    let lower = raw.to_ascii_lowercase();
    ["http://", "https://", "ws://", "wss://"]
        .iter()
        .any(|prefix| lower.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(secure: bool) -> PageLocation {
        PageLocation {
            host: "homeassistant.local".to_string(),
            secure,
        }
    }

    #[test]
    fn test_default_endpoint_uses_page_host() {
        let url = resolve_endpoint(None, &page(false)).unwrap();
        assert_eq!(url.as_str(), "ws://homeassistant.local:8080/ws");

        let url = resolve_endpoint(Some("  "), &page(true)).unwrap();
        assert_eq!(url.as_str(), "wss://homeassistant.local:8080/ws");
    }

    #[test]
    fn test_bare_host_inherits_page_scheme() {
        let url = resolve_endpoint(Some("relay.lan:9000"), &page(false)).unwrap();
        assert_eq!(url.as_str(), "ws://relay.lan:9000/ws");

        let url = resolve_endpoint(Some("relay.lan"), &page(true)).unwrap();
        assert_eq!(url.as_str(), "wss://relay.lan/ws");
    }

    #[test]
    fn test_explicit_path_is_preserved() {
        let url = resolve_endpoint(Some("192.168.1.10:8080/audio/ws"), &page(false)).unwrap();
        assert_eq!(url.as_str(), "ws://192.168.1.10:8080/audio/ws");
    }

    #[test]
    fn test_http_schemes_map_to_websocket_schemes() {
        let url = resolve_endpoint(Some("https://relay.example.com"), &page(false)).unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com/ws");

        let url = resolve_endpoint(Some("http://relay.example.com:8080/"), &page(true)).unwrap();
        assert_eq!(url.as_str(), "ws://relay.example.com:8080/ws");

        let url = resolve_endpoint(Some("wss://relay.example.com:8443/x"), &page(false)).unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com:8443/x");
    }

    #[test]
    fn test_invalid_endpoint_is_config_error() {
        let err = resolve_endpoint(Some("http://"), &page(false)).unwrap_err();
        assert!(err.is_config_error());
        assert_eq!(err.message(), "Invalid Server URL: http://");

        let err = resolve_endpoint(Some("bad host name:99999"), &page(false)).unwrap_err();
        assert!(err.is_config_error());
    }
}
