//! Relay Coordinator configuration.
//!
//! Configuration is loaded from environment variables. Every variable is
//! optional; unparseable values are rejected rather than silently defaulted.

use crate::relay::engine::{
    RtpCodecCapability, TransportListenIp, WebRtcTransportOptions, WorkerLogLevel,
    WorkerSettings,
};
use crate::types::MediaKind;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket signaling bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default lower bound of the worker RTC port range.
pub const DEFAULT_RTC_MIN_PORT: u16 = 10000;

/// Default upper bound of the worker RTC port range.
pub const DEFAULT_RTC_MAX_PORT: u16 = 10100;

/// Default worker log level.
pub const DEFAULT_WORKER_LOG_LEVEL: &str = "debug";

/// Default worker log tags.
pub const DEFAULT_WORKER_LOG_TAGS: &str = "info,ice,dtls,rtp,srtp,rtcp";

/// Default transport listen IP.
pub const DEFAULT_LISTEN_IP: &str = "0.0.0.0";

/// Default announced IP.
pub const DEFAULT_ANNOUNCED_IP: &str = "127.0.0.1";

/// Default per-transport incoming bitrate cap (bps).
pub const DEFAULT_MAX_INCOMING_BITRATE: u32 = 1_500_000;

/// Default initial available outgoing bitrate (bps).
pub const DEFAULT_INITIAL_OUTGOING_BITRATE: u32 = 800_000;

/// Default bound on each relay call in milliseconds.
pub const DEFAULT_RELAY_CALL_TIMEOUT_MS: u64 = 10_000;

/// Default delay before exiting after worker death in milliseconds.
pub const DEFAULT_WORKER_DEATH_GRACE_MS: u64 = 2_000;

/// Relay Coordinator configuration.
#[derive(Clone)]
pub struct Config {
    /// WebSocket signaling bind address (default: "0.0.0.0:3000").
    pub signaling_bind_address: String,

    /// Health and metrics bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Lowest RTC port the worker may allocate.
    pub rtc_min_port: u16,

    /// Highest RTC port the worker may allocate.
    pub rtc_max_port: u16,

    pub worker_log_level: WorkerLogLevel,

    pub worker_log_tags: Vec<String>,

    /// IP the transports listen on.
    pub listen_ip: String,

    /// IP announced to clients in ICE candidates. `None` announces `listen_ip`.
    pub announced_ip: Option<String>,

    /// Per-transport incoming bitrate cap. `None` disables the cap.
    pub max_incoming_bitrate: Option<u32>,

    pub initial_available_outgoing_bitrate: u32,

    /// Bound on each relay engine call.
    pub relay_call_timeout: Duration,

    /// Delay between worker death and process exit.
    pub worker_death_grace: Duration,

    /// Codecs the router is created with.
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("signaling_bind_address", &self.signaling_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("rtc_min_port", &self.rtc_min_port)
            .field("rtc_max_port", &self.rtc_max_port)
            .field("worker_log_level", &self.worker_log_level.as_str())
            .field("worker_log_tags", &self.worker_log_tags.join(","))
            .field("listen_ip", &self.listen_ip)
            .field("announced_ip", &self.announced_ip)
            .field("max_incoming_bitrate", &self.max_incoming_bitrate)
            .field(
                "initial_available_outgoing_bitrate",
                &self.initial_available_outgoing_bitrate,
            )
            .field("relay_call_timeout", &self.relay_call_timeout)
            .field("worker_death_grace", &self.worker_death_grace)
            .field("media_codecs", &self.media_codecs.len())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Parse an optional variable, falling back to `default` when unset.
fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={raw}"))),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_bind_address = vars
            .get("RC_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("RC_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let rtc_min_port = parse_var(vars, "RC_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_var(vars, "RC_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "RC_RTC_MIN_PORT ({rtc_min_port}) exceeds RC_RTC_MAX_PORT ({rtc_max_port})"
            )));
        }

        let level = vars
            .get("RC_WORKER_LOG_LEVEL")
            .map_or(DEFAULT_WORKER_LOG_LEVEL, String::as_str);
        let worker_log_level = WorkerLogLevel::parse(level)
            .ok_or_else(|| ConfigError::InvalidValue(format!("RC_WORKER_LOG_LEVEL={level}")))?;

        let worker_log_tags = vars
            .get("RC_WORKER_LOG_TAGS")
            .map_or(DEFAULT_WORKER_LOG_TAGS, String::as_str)
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect();

        let listen_ip = vars
            .get("RC_LISTEN_IP")
            .cloned()
            .unwrap_or_else(|| DEFAULT_LISTEN_IP.to_string());

        // Empty string means "announce the listen IP".
        let announced_ip = match vars.get("RC_ANNOUNCED_IP") {
            Some(ip) if ip.trim().is_empty() => None,
            Some(ip) => Some(ip.trim().to_string()),
            None => Some(DEFAULT_ANNOUNCED_IP.to_string()),
        };

        let max_incoming_bitrate = match parse_var(
            vars,
            "RC_MAX_INCOMING_BITRATE",
            DEFAULT_MAX_INCOMING_BITRATE,
        )? {
            0 => None,
            bps => Some(bps),
        };

        let initial_available_outgoing_bitrate = parse_var(
            vars,
            "RC_INITIAL_OUTGOING_BITRATE",
            DEFAULT_INITIAL_OUTGOING_BITRATE,
        )?;

        let relay_call_timeout_ms =
            parse_var(vars, "RC_RELAY_CALL_TIMEOUT_MS", DEFAULT_RELAY_CALL_TIMEOUT_MS)?;
        if relay_call_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "RC_RELAY_CALL_TIMEOUT_MS must be positive".to_string(),
            ));
        }

        let worker_death_grace_ms =
            parse_var(vars, "RC_WORKER_DEATH_GRACE_MS", DEFAULT_WORKER_DEATH_GRACE_MS)?;

        Ok(Config {
            signaling_bind_address,
            health_bind_address,
            rtc_min_port,
            rtc_max_port,
            worker_log_level,
            worker_log_tags,
            listen_ip,
            announced_ip,
            max_incoming_bitrate,
            initial_available_outgoing_bitrate,
            relay_call_timeout: Duration::from_millis(relay_call_timeout_ms),
            worker_death_grace: Duration::from_millis(worker_death_grace_ms),
            media_codecs: default_media_codecs(),
        })
    }

    /// Settings the relay worker is spawned with.
    #[must_use]
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            log_level: self.worker_log_level,
            log_tags: self.worker_log_tags.clone(),
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
        }
    }

    /// Options every WebRTC transport is created with.
    #[must_use]
    pub fn transport_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ips: vec![TransportListenIp {
                ip: self.listen_ip.clone(),
                announced_ip: self.announced_ip.clone(),
            }],
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: self.initial_available_outgoing_bitrate,
        }
    }
}

/// Opus 48 kHz stereo and VP8 90 kHz.
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    let mut vp8_parameters = serde_json::Map::new();
    vp8_parameters.insert(
        "x-google-start-bitrate".to_string(),
        serde_json::Value::from(1000),
    );

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            parameters: serde_json::Map::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: vp8_parameters,
        },
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.signaling_bind_address, DEFAULT_SIGNALING_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.rtc_min_port, 10000);
        assert_eq!(config.rtc_max_port, 10100);
        assert_eq!(config.worker_log_level, WorkerLogLevel::Debug);
        assert_eq!(
            config.worker_log_tags,
            vec!["info", "ice", "dtls", "rtp", "srtp", "rtcp"]
        );
        assert_eq!(config.listen_ip, "0.0.0.0");
        assert_eq!(config.announced_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(config.max_incoming_bitrate, Some(1_500_000));
        assert_eq!(config.initial_available_outgoing_bitrate, 800_000);
        assert_eq!(config.relay_call_timeout, Duration::from_secs(10));
        assert_eq!(config.worker_death_grace, Duration::from_secs(2));
        assert_eq!(config.media_codecs.len(), 2);
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let vars = HashMap::from([
            (
                "RC_SIGNALING_BIND_ADDRESS".to_string(),
                "127.0.0.1:3001".to_string(),
            ),
            (
                "RC_HEALTH_BIND_ADDRESS".to_string(),
                "127.0.0.1:8082".to_string(),
            ),
            ("RC_RTC_MIN_PORT".to_string(), "20000".to_string()),
            ("RC_RTC_MAX_PORT".to_string(), "20010".to_string()),
            ("RC_WORKER_LOG_LEVEL".to_string(), "warn".to_string()),
            ("RC_WORKER_LOG_TAGS".to_string(), "ice, dtls".to_string()),
            ("RC_LISTEN_IP".to_string(), "10.0.0.5".to_string()),
            ("RC_ANNOUNCED_IP".to_string(), "203.0.113.7".to_string()),
            ("RC_MAX_INCOMING_BITRATE".to_string(), "0".to_string()),
            ("RC_INITIAL_OUTGOING_BITRATE".to_string(), "600000".to_string()),
            ("RC_RELAY_CALL_TIMEOUT_MS".to_string(), "2500".to_string()),
            ("RC_WORKER_DEATH_GRACE_MS".to_string(), "0".to_string()),
        ]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.signaling_bind_address, "127.0.0.1:3001");
        assert_eq!(config.health_bind_address, "127.0.0.1:8082");
        assert_eq!(config.rtc_min_port, 20000);
        assert_eq!(config.rtc_max_port, 20010);
        assert_eq!(config.worker_log_level, WorkerLogLevel::Warn);
        assert_eq!(config.worker_log_tags, vec!["ice", "dtls"]);
        assert_eq!(config.listen_ip, "10.0.0.5");
        assert_eq!(config.announced_ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(config.max_incoming_bitrate, None);
        assert_eq!(config.initial_available_outgoing_bitrate, 600_000);
        assert_eq!(config.relay_call_timeout, Duration::from_millis(2500));
        assert_eq!(config.worker_death_grace, Duration::ZERO);
    }

    #[test]
    fn test_empty_announced_ip_means_none() {
        let vars = HashMap::from([("RC_ANNOUNCED_IP".to_string(), String::new())]);
        let config = Config::from_vars(&vars).unwrap();
        assert!(config.announced_ip.is_none());

        let listen = config.transport_options();
        assert_eq!(listen.listen_ips.len(), 1);
        assert!(listen.listen_ips.first().unwrap().announced_ip.is_none());
    }

    #[test]
    fn test_invalid_port_rejected() {
        let vars = HashMap::from([("RC_RTC_MIN_PORT".to_string(), "seventy".to_string())]);
        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(v)) if v.contains("RC_RTC_MIN_PORT"))
        );
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let vars = HashMap::from([
            ("RC_RTC_MIN_PORT".to_string(), "10100".to_string()),
            ("RC_RTC_MAX_PORT".to_string(), "10000".to_string()),
        ]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_unknown_worker_log_level_rejected() {
        let vars = HashMap::from([("RC_WORKER_LOG_LEVEL".to_string(), "chatty".to_string())]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(v)) if v.contains("chatty")
        ));
    }

    #[test]
    fn test_zero_relay_timeout_rejected() {
        let vars = HashMap::from([("RC_RELAY_CALL_TIMEOUT_MS".to_string(), "0".to_string())]);
        assert!(Config::from_vars(&vars).is_err());
    }

    #[test]
    fn test_worker_settings_and_transport_options() {
        let config = Config::from_vars(&HashMap::new()).unwrap();

        let worker = config.worker_settings();
        assert_eq!(worker.rtc_min_port, 10000);
        assert_eq!(worker.rtc_max_port, 10100);
        assert_eq!(worker.log_tags.len(), 6);

        let options = config.transport_options();
        assert!(options.enable_udp && options.enable_tcp && options.prefer_udp);
        assert_eq!(options.initial_available_outgoing_bitrate, 800_000);
        let listen = options.listen_ips.first().unwrap();
        assert_eq!(listen.ip, "0.0.0.0");
        assert_eq!(listen.announced_ip.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn test_default_codecs() {
        let codecs = default_media_codecs();
        let opus = codecs.first().unwrap();
        assert_eq!(opus.mime_type, "audio/opus");
        assert_eq!(opus.clock_rate, 48000);
        assert_eq!(opus.channels, Some(2));

        let vp8 = codecs.get(1).unwrap();
        assert_eq!(vp8.kind, MediaKind::Video);
        assert_eq!(
            vp8.parameters.get("x-google-start-bitrate"),
            Some(&serde_json::Value::from(1000))
        );
    }

    #[test]
    fn test_debug_lists_fields() {
        let config = Config::from_vars(&HashMap::new()).unwrap();
        let debug_output = format!("{config:?}");
        assert!(debug_output.contains("signaling_bind_address"));
        assert!(debug_output.contains("relay_call_timeout"));
        assert!(debug_output.contains("info,ice,dtls,rtp,srtp,rtcp"));
    }
}
