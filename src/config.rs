//! Engine configuration

use serde::{Deserialize, Serialize};

/// Proxy engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Whether HTTPS interception is enabled; when false, `CONNECT`
    /// becomes an opaque tunnel and nothing inside it is captured
    pub enable_https: bool,
    /// Maximum number of body bytes retained per captured direction
    pub capture_body_cap_bytes: usize,
    /// Close a client connection after this much read inactivity
    pub idle_timeout_ms: u64,
    /// Budget for DNS + TCP connect (+ TLS) toward the origin
    pub upstream_connect_timeout_ms: u64,
    /// Budget for the origin to produce response headers
    pub upstream_header_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8888,
            enable_https: true,
            capture_body_cap_bytes: 10 * 1024 * 1024,
            idle_timeout_ms: 60_000,
            upstream_connect_timeout_ms: 30_000,
            upstream_header_timeout_ms: 60_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = ProxyConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8888);
        assert!(config.enable_https);
        assert_eq!(config.capture_body_cap_bytes, 10 * 1024 * 1024);
        assert_eq!(config.idle_timeout_ms, 60_000);
        assert_eq!(config.upstream_connect_timeout_ms, 30_000);
        assert_eq!(config.upstream_header_timeout_ms, 60_000);
    }
}
