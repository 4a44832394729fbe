//! Pre-configured test data fixtures for coordinator testing.
//!
//! RTP payloads are opaque to the coordinator and the mock relay, so these
//! only carry the codec fields a client would send.

use crate::mock_relay::MockRelay;
use relay_coordinator::registry::{Registries, RegistrySettings};
use relay_coordinator::relay::{TransportListenIp, WebRtcTransportOptions};
use serde_json::{json, Value};
use std::time::Duration;

/// Relay call timeout used by [`registry_settings`].
pub const TEST_RELAY_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Bitrate cap used by [`registry_settings`].
pub const TEST_MAX_INCOMING_BITRATE: u32 = 1_500_000;

/// Loopback transport options.
#[must_use]
pub fn transport_options() -> WebRtcTransportOptions {
    WebRtcTransportOptions {
        listen_ips: vec![TransportListenIp {
            ip: "127.0.0.1".to_string(),
            announced_ip: None,
        }],
        enable_udp: true,
        enable_tcp: true,
        prefer_udp: true,
        initial_available_outgoing_bitrate: 800_000,
    }
}

#[must_use]
pub fn registry_settings() -> RegistrySettings {
    RegistrySettings {
        transport_options: transport_options(),
        max_incoming_bitrate: Some(TEST_MAX_INCOMING_BITRATE),
        relay_call_timeout: TEST_RELAY_CALL_TIMEOUT,
    }
}

/// Registries with `relay` installed as the router.
#[must_use]
pub fn registries_with(relay: &MockRelay, settings: RegistrySettings) -> Registries {
    let registries = Registries::new(settings);
    registries.capabilities.install(relay.as_router());
    registries
}

/// Producer RTP parameters with a single VP8 encoding.
#[must_use]
pub fn vp8_rtp_parameters() -> Value {
    json!({
        "codecs": [{ "mimeType": "video/VP8", "clockRate": 90000, "payloadType": 101 }],
        "encodings": [{ "ssrc": 1111 }],
    })
}

/// Remote capabilities that can receive VP8.
#[must_use]
pub fn vp8_capabilities() -> Value {
    json!({ "codecs": [{ "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }] })
}

/// Remote capabilities that can only receive Opus.
#[must_use]
pub fn opus_only_capabilities() -> Value {
    json!({ "codecs": [{ "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000 }] })
}

/// Client DTLS parameters.
#[must_use]
pub fn client_dtls() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{ "algorithm": "sha-256", "value": "AA:BB:CC" }],
    })
}
