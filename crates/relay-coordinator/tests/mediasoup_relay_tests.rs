//! Tests against a real mediasoup worker.
//!
//! Each test uses its own RTC port range so tests can run in parallel.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]

use std::net::UdpSocket;
use std::sync::Arc;

use relay_coordinator::config::default_media_codecs;
use relay_coordinator::relay::{
    MediasoupRouter, MediasoupWorker, RelayError, RelayRouter, RelayWorker, WorkerLogLevel,
    WorkerSettings,
};
use relay_coordinator::types::TransportId;
use relay_test_utils::transport_options;

async fn router_on_ports(min: u16, max: u16) -> (MediasoupWorker, Arc<MediasoupRouter>) {
    let worker = MediasoupWorker::new(&WorkerSettings {
        log_level: WorkerLogLevel::Warn,
        log_tags: vec!["ice".to_string(), "dtls".to_string()],
        rtc_min_port: min,
        rtc_max_port: max,
    })
    .await
    .expect("worker should start");
    let router = worker
        .create_mediasoup_router(&default_media_codecs())
        .await
        .expect("router should be created");
    (worker, router)
}

#[tokio::test]
async fn test_inverted_port_range_is_rejected() {
    let result = MediasoupWorker::new(&WorkerSettings {
        log_level: WorkerLogLevel::Warn,
        log_tags: Vec::new(),
        rtc_min_port: 41_010,
        rtc_max_port: 41_000,
    })
    .await;
    assert!(matches!(result, Err(RelayError::Failed(_))));
}

#[tokio::test]
async fn test_router_capabilities_list_configured_codecs() {
    let (worker, router) = router_on_ports(41_100, 41_149).await;
    assert!(worker.died().borrow().is_none());

    let codecs = router.rtp_capabilities()["codecs"].clone();
    let mime_types: Vec<&str> = codecs
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|c| c["mimeType"].as_str())
        .collect();
    assert!(mime_types.contains(&"audio/opus"));
    assert!(mime_types.contains(&"video/VP8"));
}

#[tokio::test]
async fn test_transport_candidates_are_bound_inside_port_range() {
    let (_worker, router) = router_on_ports(41_200, 41_249).await;

    let params = router
        .create_webrtc_transport(&transport_options())
        .await
        .unwrap();
    assert!(params.ice_parameters["usernameFragment"].is_string());
    assert!(!params.dtls_parameters["fingerprints"]
        .as_array()
        .unwrap()
        .is_empty());

    let candidates = params.ice_candidates.as_array().unwrap();
    assert!(!candidates.is_empty());
    for candidate in candidates {
        let port = u16::try_from(candidate["port"].as_u64().unwrap()).unwrap();
        assert!((41_200..=41_249).contains(&port), "port {port} out of range");
    }

    // mediasoup owns the advertised UDP port
    let udp = candidates
        .iter()
        .find(|c| c["protocol"] == "udp")
        .expect("UDP candidate expected");
    let port = udp["port"].as_u64().unwrap();
    assert!(UdpSocket::bind(format!("127.0.0.1:{port}")).is_err());

    assert_eq!(router.transport_count().await, 1);
}

#[tokio::test]
async fn test_closing_transport_releases_it() {
    let (_worker, router) = router_on_ports(41_300, 41_349).await;

    let params = router
        .create_webrtc_transport(&transport_options())
        .await
        .unwrap();
    router.set_max_incoming_bitrate(&params.id, 1_500_000).await.unwrap();

    router.close_transport(&params.id).await.unwrap();
    assert_eq!(router.transport_count().await, 0);

    let unknown = TransportId("missing".to_string());
    assert!(matches!(
        router.set_max_incoming_bitrate(&unknown, 1_000).await,
        Err(RelayError::NotFound(_))
    ));
}
