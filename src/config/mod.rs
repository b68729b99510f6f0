//! Configuration management
//!
//! TOML file first, then environment overrides, then command line flags.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP configuration
    #[serde(default)]
    pub http: HttpConfig,

    /// Signaling and relay behaviour
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// WebRTC network settings
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// ICE servers handed to viewers and used by relay sessions
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// HTTP bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// CORS origin
    #[serde(default)]
    pub cors_origin: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origin: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Default topology for capture endpoints that do not say
    #[serde(default)]
    pub direct_connect: bool,

    /// Viewer long-poll timeout
    #[serde(default = "default_poll_timeout_secs")]
    pub viewer_poll_timeout_secs: u64,

    /// Capture endpoint long-poll timeout
    #[serde(default = "default_poll_timeout_secs")]
    pub capture_poll_timeout_secs: u64,

    /// A stream without capture activity for this long is unavailable
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Period of the terminal-session sweep
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Tracks a capture endpoint publishes (video + audio)
    #[serde(default = "default_expected_tracks")]
    pub expected_tracks: usize,

    /// Keyframe request period for relayed video
    #[serde(default = "default_keyframe_interval_ms")]
    pub keyframe_interval_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            direct_connect: false,
            viewer_poll_timeout_secs: default_poll_timeout_secs(),
            capture_poll_timeout_secs: default_poll_timeout_secs(),
            keepalive_secs: default_keepalive_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            expected_tracks: default_expected_tracks(),
            keyframe_interval_ms: default_keyframe_interval_ms(),
        }
    }
}

/// WebRTC network configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebRTCConfig {
    /// Public IPs advertised for host candidates
    #[serde(default)]
    pub nat1to1_ips: Vec<String>,

    /// Single UDP port shared by all sessions (0 = disabled)
    #[serde(default)]
    pub udp_mux_port: u16,

    /// Ephemeral UDP port range [min, max]
    #[serde(default)]
    pub ephemeral_udp_port_range: Option<[u16; 2]>,
}

/// ICE server descriptor, serialized the way browsers expect it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(
        default,
        rename = "credentialType",
        alias = "credential_type",
        skip_serializing_if = "Option::is_none"
    )]
    pub credential_type: Option<String>,
}

impl IceServerConfig {
    fn from_env(url: String, username: Option<String>, password: Option<String>) -> Self {
        let username = username.filter(|u| !u.is_empty());
        let credential = password.filter(|p| !p.is_empty());
        let credential_type = credential.as_ref().map(|_| "password".to_string());
        Self {
            urls: vec![url],
            username,
            credential,
            credential_type,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level / env_logger filter string
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            signaling: SignalingConfig::default(),
            webrtc: WebRTCConfig::default(),
            ice_servers: default_ice_servers(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`.
    ///
    /// TURN/STUN variables replace the configured ICE servers when either URL
    /// is set. A malformed `DIRECT_CONNECT` is an error.
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let mut servers = Vec::new();

        if let Some(url) = lookup("TURN_SERVER_URL").filter(|u| !u.is_empty()) {
            servers.push(IceServerConfig::from_env(
                url,
                lookup("TURN_SERVER_USERNAME"),
                lookup("TURN_SERVER_PASSWORD"),
            ));
        }

        if let Some(url) = lookup("STUN_SERVER_URL").filter(|u| !u.is_empty()) {
            servers.push(IceServerConfig::from_env(
                url,
                lookup("STUN_SERVER_USERNAME"),
                lookup("STUN_SERVER_PASSWORD"),
            ));
        }

        if !servers.is_empty() {
            self.ice_servers = servers;
        }

        if let Some(value) = lookup("DIRECT_CONNECT") {
            self.signaling.direct_connect = parse_bool(&value)
                .ok_or_else(|| format!("DIRECT_CONNECT must be a boolean, got {:?}", value))?;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.http.port == 0 {
            return Err("HTTP port must be non-zero".into());
        }

        let signaling = &self.signaling;
        if signaling.viewer_poll_timeout_secs == 0 || signaling.capture_poll_timeout_secs == 0 {
            return Err("Long-poll timeouts must be non-zero".into());
        }
        if signaling.keepalive_secs == 0 {
            return Err("Keepalive window must be non-zero".into());
        }
        if signaling.sweep_interval_secs == 0 {
            return Err("Sweep interval must be non-zero".into());
        }
        if signaling.expected_tracks == 0 {
            return Err("Expected track count must be non-zero".into());
        }
        if signaling.keyframe_interval_ms == 0 {
            return Err("Keyframe interval must be non-zero".into());
        }

        if let Some([min, max]) = self.webrtc.ephemeral_udp_port_range {
            if min == 0 || min > max {
                return Err("WebRTC ephemeral UDP port range must be [min, max] with 0 < min <= max".into());
            }
        }

        for ip in &self.webrtc.nat1to1_ips {
            if ip.parse::<std::net::IpAddr>().is_err() {
                return Err(format!("WebRTC nat1to1_ips entry {:?} is not an IP address", ip).into());
            }
        }

        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err("ICE server entries need at least one URL".into());
            }
        }

        Ok(())
    }
}

/// Accepts the spellings Go's strconv.ParseBool does
fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.signaling.viewer_poll_timeout_secs, 20);
        assert_eq!(cfg.signaling.keepalive_secs, 15);
        assert_eq!(cfg.signaling.sweep_interval_secs, 5);
        assert_eq!(cfg.signaling.expected_tracks, 2);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [http]
            port = 9000

            [signaling]
            direct_connect = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.http.port, 9000);
        assert_eq!(cfg.http.host, "0.0.0.0");
        assert!(cfg.signaling.direct_connect);
        assert_eq!(cfg.signaling.capture_poll_timeout_secs, 20);
        assert_eq!(cfg.ice_servers, default_ice_servers());
    }

    #[test]
    fn test_env_replaces_ice_servers() {
        let mut cfg = Config::default();
        cfg.apply_env_from(env(&[
            ("TURN_SERVER_URL", "turn:turn.example.com:3478"),
            ("TURN_SERVER_USERNAME", "relay"),
            ("TURN_SERVER_PASSWORD", "hunter2"),
            ("STUN_SERVER_URL", "stun:stun.example.com:3478"),
            ("STUN_SERVER_USERNAME", ""),
        ]))
        .unwrap();

        assert_eq!(cfg.ice_servers.len(), 2);
        assert_eq!(cfg.ice_servers[0].username.as_deref(), Some("relay"));
        assert_eq!(cfg.ice_servers[0].credential_type.as_deref(), Some("password"));
        assert_eq!(cfg.ice_servers[1].username, None);
        assert_eq!(cfg.ice_servers[1].credential_type, None);
    }

    #[test]
    fn test_direct_connect_env() {
        let mut cfg = Config::default();
        cfg.apply_env_from(env(&[("DIRECT_CONNECT", "true")])).unwrap();
        assert!(cfg.signaling.direct_connect);
        assert!(cfg.apply_env_from(env(&[("DIRECT_CONNECT", "maybe")])).is_err());
    }

    #[test]
    fn test_ice_server_json_shape() {
        let server = IceServerConfig::from_env("turn:x".to_string(), Some("u".to_string()), Some("p".to_string()));
        let value = serde_json::to_value(&server).unwrap();
        assert_eq!(value["credentialType"], "password");
        let stun = serde_json::to_value(&default_ice_servers()[0]).unwrap();
        assert!(stun.get("username").is_none());
    }

    #[test]
    fn validate_rejects_bad_port_range() {
        let mut cfg = Config::default();
        cfg.webrtc.ephemeral_udp_port_range = Some([5000, 4000]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_keepalive() {
        let mut cfg = Config::default();
        cfg.signaling.keepalive_secs = 0;
        assert!(cfg.validate().is_err());
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 { 8080 }
fn default_poll_timeout_secs() -> u64 { 20 }
fn default_keepalive_secs() -> u64 { 15 }
fn default_sweep_interval_secs() -> u64 { 5 }
fn default_expected_tracks() -> usize { 2 }
fn default_keyframe_interval_ms() -> u64 { 2000 }

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        username: None,
        credential: None,
        credential_type: None,
    }]
}
