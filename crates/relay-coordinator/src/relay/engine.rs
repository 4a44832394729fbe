//! Relay engine interface.
//!
//! The coordinator never touches media. Everything it needs from the relay
//! engine goes through [`RelayWorker`] and [`RelayRouter`]. ICE, DTLS and RTP
//! blobs are opaque JSON values passed through unmodified.

use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Router RTP capabilities, or the remote capabilities a client sends.
pub type RtpCapabilities = Value;

/// Negotiated RTP parameters of a producer or consumer.
pub type RtpParameters = Value;

/// DTLS parameters supplied by the client on connect.
pub type DtlsParameters = Value;

/// Errors raised by the relay engine.
///
/// These are logged server-side and mapped to a `CoordinatorError` before
/// anything reaches a client.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay object not found: {0}")]
    NotFound(String),

    #[error("invalid relay state: {0}")]
    InvalidState(String),

    #[error("relay worker died: {0}")]
    WorkerDied(String),

    #[error("relay call {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("relay call failed: {0}")]
    Failed(String),
}

/// Worker log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLogLevel {
    Debug,
    Warn,
    Error,
    None,
}

impl WorkerLogLevel {
    /// Parse a level name. Returns `None` for unknown names.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "debug" => Some(WorkerLogLevel::Debug),
            "warn" => Some(WorkerLogLevel::Warn),
            "error" => Some(WorkerLogLevel::Error),
            "none" => Some(WorkerLogLevel::None),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            WorkerLogLevel::Debug => "debug",
            WorkerLogLevel::Warn => "warn",
            WorkerLogLevel::Error => "error",
            WorkerLogLevel::None => "none",
        }
    }
}

/// Parameters a relay worker is spawned with.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

/// A codec the router is created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameters: serde_json::Map<String, Value>,
}

/// One listen address for a WebRTC transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportListenIp {
    pub ip: String,
    /// Address advertised in ICE candidates instead of `ip`.
    pub announced_ip: Option<String>,
}

/// Options for creating a WebRTC transport.
#[derive(Debug, Clone)]
pub struct WebRtcTransportOptions {
    pub listen_ips: Vec<TransportListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
}

/// Parameters of a freshly created transport, returned to the client as is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Result of a relay consume call.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerParams {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    /// Relay consumer type ("simple" for a single-encoding producer).
    pub consumer_type: String,
    pub producer_paused: bool,
    pub paused: bool,
}

/// A relay worker process.
#[async_trait]
pub trait RelayWorker: Send + Sync {
    /// Create a router bound to the given codec set.
    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn RelayRouter>, RelayError>;

    /// Watch channel that flips to `Some(reason)` when the worker dies.
    fn died(&self) -> watch::Receiver<Option<String>>;
}

/// A relay router: the source of RTP capabilities and the factory for
/// transports, producers and consumers.
#[async_trait]
pub trait RelayRouter: Send + Sync {
    fn rtp_capabilities(&self) -> RtpCapabilities;

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<TransportParams, RelayError>;

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), RelayError>;

    async fn set_max_incoming_bitrate(
        &self,
        transport_id: &TransportId,
        bitrate: u32,
    ) -> Result<(), RelayError>;

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, RelayError>;

    async fn can_consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, RelayError>;

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerParams, RelayError>;

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), RelayError>;

    /// Close a transport and everything created on it. Idempotent.
    async fn close_transport(&self, transport_id: &TransportId) -> Result<(), RelayError>;

    /// Close a producer and its consumers. Idempotent.
    async fn close_producer(&self, producer_id: &ProducerId) -> Result<(), RelayError>;

    /// Close a consumer. Idempotent.
    async fn close_consumer(&self, consumer_id: &ConsumerId) -> Result<(), RelayError>;
}
