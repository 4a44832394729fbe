//! mediasoup-backed relay engine.
//!
//! `MediasoupWorker` owns one mediasoup worker; `MediasoupRouter` wraps the
//! router created on it. Relay objects are kept in maps keyed by the ids the
//! coordinator sees, and closing an object means dropping the last handle
//! mediasoup gave us.

use super::engine::{
    ConsumerParams, DtlsParameters, RelayError, RelayRouter, RelayWorker, RtpCapabilities,
    RtpCodecCapability, RtpParameters, TransportParams, WebRtcTransportOptions, WorkerLogLevel,
    WorkerSettings,
};
use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId};
use ::mediasoup::consumer::{Consumer, ConsumerOptions};
use ::mediasoup::data_structures::{ListenInfo, Protocol};
use ::mediasoup::producer::{Producer, ProducerOptions};
use ::mediasoup::router::{Router, RouterOptions};
use ::mediasoup::rtp_parameters as ms_rtp;
use ::mediasoup::transport::Transport;
use ::mediasoup::webrtc_transport::{
    WebRtcTransport, WebRtcTransportListenInfos, WebRtcTransportOptions as MsTransportOptions,
    WebRtcTransportRemoteParameters,
};
use ::mediasoup::worker::{
    Worker, WorkerLogLevel as MsLogLevel, WorkerLogTag, WorkerSettings as MsWorkerSettings,
};
use ::mediasoup::worker_manager::WorkerManager;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// A mediasoup worker.
pub struct MediasoupWorker {
    // Dropping the manager shuts its workers down
    _manager: WorkerManager,
    worker: Worker,
    port_range: RangeInclusive<u16>,
    died: watch::Receiver<Option<String>>,
}

impl MediasoupWorker {
    /// Spawn a worker.
    ///
    /// # Errors
    ///
    /// `Failed` if the port range is empty or the worker cannot be started.
    pub async fn new(settings: &WorkerSettings) -> Result<Self, RelayError> {
        if settings.rtc_min_port > settings.rtc_max_port {
            return Err(RelayError::Failed(format!(
                "empty RTC port range {}..={}",
                settings.rtc_min_port, settings.rtc_max_port
            )));
        }

        let manager = WorkerManager::new();
        let mut worker_settings = MsWorkerSettings::default();
        worker_settings.log_level = log_level(settings.log_level);
        worker_settings.log_tags = log_tags(&settings.log_tags);

        let worker = manager
            .create_worker(worker_settings)
            .await
            .map_err(|e| RelayError::Failed(format!("worker start failed: {e}")))?;

        let (died_tx, died) = watch::channel(None);
        worker
            .on_dead(move |result| {
                let reason = match result {
                    Ok(()) => "worker exited".to_string(),
                    Err(e) => e.to_string(),
                };
                error!(target: "rc.relay", reason = %reason, "mediasoup worker died");
                died_tx.send_replace(Some(reason));
            })
            .detach();

        info!(
            target: "rc.relay",
            worker_id = %worker.id(),
            rtc_min_port = settings.rtc_min_port,
            rtc_max_port = settings.rtc_max_port,
            "mediasoup worker started"
        );

        Ok(Self {
            _manager: manager,
            worker,
            port_range: settings.rtc_min_port..=settings.rtc_max_port,
            died,
        })
    }

    /// Create a router and keep its concrete type.
    ///
    /// # Errors
    ///
    /// `Failed` if a codec is malformed or mediasoup rejects the codec set.
    pub async fn create_mediasoup_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<Arc<MediasoupRouter>, RelayError> {
        if let Some(reason) = self.died.borrow().as_ref() {
            return Err(RelayError::WorkerDied(reason.clone()));
        }

        let codecs = router_codecs(media_codecs)?;
        let router = self
            .worker
            .create_router(RouterOptions::new(codecs))
            .await
            .map_err(|e| RelayError::Failed(format!("router creation failed: {e}")))?;
        let capabilities = to_json("router RTP capabilities", &router.rtp_capabilities())?;

        debug!(
            target: "rc.relay",
            router_id = %router.id(),
            codecs = media_codecs.len(),
            "mediasoup router created"
        );

        Ok(Arc::new(MediasoupRouter {
            router,
            port_range: self.port_range.clone(),
            capabilities,
            died: self.died.clone(),
            state: Mutex::new(RouterState::default()),
        }))
    }
}

#[async_trait]
impl RelayWorker for MediasoupWorker {
    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn RelayRouter>, RelayError> {
        let router: Arc<dyn RelayRouter> = self.create_mediasoup_router(media_codecs).await?;
        Ok(router)
    }

    fn died(&self) -> watch::Receiver<Option<String>> {
        self.died.clone()
    }
}

struct LiveConsumer {
    transport_id: TransportId,
    producer_id: ProducerId,
    consumer: Consumer,
}

#[derive(Default)]
struct RouterState {
    transports: HashMap<TransportId, WebRtcTransport>,
    /// Producer id -> (owning transport, producer)
    producers: HashMap<ProducerId, (TransportId, Producer)>,
    consumers: HashMap<ConsumerId, LiveConsumer>,
}

impl RouterState {
    fn transport(&self, transport_id: &TransportId) -> Result<WebRtcTransport, RelayError> {
        self.transports
            .get(transport_id)
            .cloned()
            .ok_or_else(|| RelayError::NotFound(format!("transport {transport_id}")))
    }

    fn producer(&self, producer_id: &ProducerId) -> Result<Producer, RelayError> {
        self.producers
            .get(producer_id)
            .map(|(_, producer)| producer.clone())
            .ok_or_else(|| RelayError::NotFound(format!("producer {producer_id}")))
    }
}

/// A mediasoup router.
pub struct MediasoupRouter {
    router: Router,
    port_range: RangeInclusive<u16>,
    capabilities: Value,
    died: watch::Receiver<Option<String>>,
    state: Mutex<RouterState>,
}

impl MediasoupRouter {
    fn ensure_alive(&self) -> Result<(), RelayError> {
        match self.died.borrow().as_ref() {
            Some(reason) => Err(RelayError::WorkerDied(reason.clone())),
            None => Ok(()),
        }
    }

    /// Number of live transports.
    pub async fn transport_count(&self) -> usize {
        self.state.lock().await.transports.len()
    }

    /// Number of live producers.
    pub async fn producer_count(&self) -> usize {
        self.state.lock().await.producers.len()
    }

    /// Number of live consumers.
    pub async fn consumer_count(&self) -> usize {
        self.state.lock().await.consumers.len()
    }
}

#[async_trait]
impl RelayRouter for MediasoupRouter {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<TransportParams, RelayError> {
        self.ensure_alive()?;

        let mut infos = listen_infos(options, &self.port_range)?.into_iter();
        let first = infos
            .next()
            .ok_or_else(|| RelayError::Failed("no listen address configured".to_string()))?;
        let listen = infos.fold(WebRtcTransportListenInfos::new(first), |listen, info| {
            listen.insert(info)
        });

        let mut transport_options = MsTransportOptions::new(listen);
        transport_options.prefer_udp = options.prefer_udp;
        transport_options.initial_available_outgoing_bitrate =
            options.initial_available_outgoing_bitrate;

        let transport = self
            .router
            .create_webrtc_transport(transport_options)
            .await
            .map_err(|e| RelayError::Failed(format!("transport creation failed: {e}")))?;

        let id = TransportId(transport.id().to_string());
        let params = TransportParams {
            id: id.clone(),
            ice_parameters: to_json("ICE parameters", transport.ice_parameters())?,
            ice_candidates: to_json("ICE candidates", transport.ice_candidates())?,
            dtls_parameters: to_json("DTLS parameters", &transport.dtls_parameters())?,
        };

        self.state.lock().await.transports.insert(id, transport);
        Ok(params)
    }

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), RelayError> {
        self.ensure_alive()?;
        let dtls_parameters = from_json("DTLS parameters", dtls_parameters)?;
        let transport = self.state.lock().await.transport(transport_id)?;

        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| RelayError::Failed(format!("transport connect failed: {e}")))
    }

    async fn set_max_incoming_bitrate(
        &self,
        transport_id: &TransportId,
        bitrate: u32,
    ) -> Result<(), RelayError> {
        self.ensure_alive()?;
        let transport = self.state.lock().await.transport(transport_id)?;

        transport
            .set_max_incoming_bitrate(bitrate)
            .await
            .map_err(|e| RelayError::Failed(format!("bitrate cap rejected: {e}")))
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, RelayError> {
        self.ensure_alive()?;
        let rtp_parameters: ms_rtp::RtpParameters = from_json("RTP parameters", rtp_parameters)?;
        let transport = self.state.lock().await.transport(transport_id)?;

        let producer = transport
            .produce(ProducerOptions::new(media_kind(kind), rtp_parameters))
            .await
            .map_err(|e| RelayError::Failed(format!("produce failed: {e}")))?;

        let id = ProducerId(producer.id().to_string());
        let mut state = self.state.lock().await;
        if !state.transports.contains_key(transport_id) {
            // Transport closed while producing; dropping the producer closes it
            return Err(RelayError::NotFound(format!("transport {transport_id}")));
        }
        state
            .producers
            .insert(id.clone(), (transport_id.clone(), producer));
        Ok(id)
    }

    async fn can_consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, RelayError> {
        self.ensure_alive()?;
        let producer = self.state.lock().await.producer(producer_id)?;
        let Ok(capabilities) =
            serde_json::from_value::<ms_rtp::RtpCapabilities>(rtp_capabilities.clone())
        else {
            // Capabilities mediasoup cannot parse cannot receive anything
            return Ok(false);
        };
        Ok(self.router.can_consume(&producer.id(), &capabilities))
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerParams, RelayError> {
        self.ensure_alive()?;
        let capabilities: ms_rtp::RtpCapabilities =
            from_json("RTP capabilities", rtp_capabilities)?;
        let (transport, producer) = {
            let state = self.state.lock().await;
            (state.transport(transport_id)?, state.producer(producer_id)?)
        };

        let mut options = ConsumerOptions::new(producer.id(), capabilities);
        options.paused = paused;
        let consumer = transport
            .consume(options)
            .await
            .map_err(|e| RelayError::Failed(format!("consume failed: {e}")))?;

        let consumer_type = to_json("consumer type", &consumer.r#type())?
            .as_str()
            .unwrap_or("simple")
            .to_string();
        let params = ConsumerParams {
            id: ConsumerId(consumer.id().to_string()),
            producer_id: producer_id.clone(),
            kind: our_media_kind(consumer.kind()),
            rtp_parameters: to_json("consumer RTP parameters", consumer.rtp_parameters())?,
            consumer_type,
            producer_paused: consumer.producer_paused(),
            paused: consumer.paused(),
        };

        let mut state = self.state.lock().await;
        if !state.transports.contains_key(transport_id) || !state.producers.contains_key(producer_id)
        {
            return Err(RelayError::NotFound(format!(
                "transport {transport_id} or producer {producer_id}"
            )));
        }
        state.consumers.insert(
            params.id.clone(),
            LiveConsumer {
                transport_id: transport_id.clone(),
                producer_id: producer_id.clone(),
                consumer,
            },
        );
        Ok(params)
    }

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), RelayError> {
        self.ensure_alive()?;
        let consumer = self
            .state
            .lock()
            .await
            .consumers
            .get(consumer_id)
            .map(|live| live.consumer.clone())
            .ok_or_else(|| RelayError::NotFound(format!("consumer {consumer_id}")))?;

        consumer
            .resume()
            .await
            .map_err(|e| RelayError::Failed(format!("resume failed: {e}")))
    }

    async fn close_transport(&self, transport_id: &TransportId) -> Result<(), RelayError> {
        let mut state = self.state.lock().await;
        if state.transports.remove(transport_id).is_none() {
            return Ok(());
        }
        let closed_producers: Vec<ProducerId> = state
            .producers
            .iter()
            .filter(|(_, (owner, _))| owner == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        state.producers.retain(|_, (owner, _)| owner != transport_id);
        state.consumers.retain(|_, live| {
            &live.transport_id != transport_id && !closed_producers.contains(&live.producer_id)
        });
        Ok(())
    }

    async fn close_producer(&self, producer_id: &ProducerId) -> Result<(), RelayError> {
        let mut state = self.state.lock().await;
        if state.producers.remove(producer_id).is_some() {
            state
                .consumers
                .retain(|_, live| &live.producer_id != producer_id);
        }
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &ConsumerId) -> Result<(), RelayError> {
        self.state.lock().await.consumers.remove(consumer_id);
        Ok(())
    }
}

fn log_level(level: WorkerLogLevel) -> MsLogLevel {
    match level {
        WorkerLogLevel::Debug => MsLogLevel::Debug,
        WorkerLogLevel::Warn => MsLogLevel::Warn,
        WorkerLogLevel::Error => MsLogLevel::Error,
        WorkerLogLevel::None => MsLogLevel::None,
    }
}

fn log_tags(tags: &[String]) -> Vec<WorkerLogTag> {
    tags.iter()
        .filter_map(|tag| {
            let parsed = match tag.trim().to_ascii_lowercase().as_str() {
                "info" => Some(WorkerLogTag::Info),
                "ice" => Some(WorkerLogTag::Ice),
                "dtls" => Some(WorkerLogTag::Dtls),
                "rtp" => Some(WorkerLogTag::Rtp),
                "srtp" => Some(WorkerLogTag::Srtp),
                "rtcp" => Some(WorkerLogTag::Rtcp),
                "rtx" => Some(WorkerLogTag::Rtx),
                "bwe" => Some(WorkerLogTag::Bwe),
                "score" => Some(WorkerLogTag::Score),
                "simulcast" => Some(WorkerLogTag::Simulcast),
                "svc" => Some(WorkerLogTag::Svc),
                "sctp" => Some(WorkerLogTag::Sctp),
                "message" => Some(WorkerLogTag::Message),
                _ => None,
            };
            if parsed.is_none() {
                warn!(target: "rc.relay", tag = %tag, "Ignoring unknown worker log tag");
            }
            parsed
        })
        .collect()
}

fn media_kind(kind: MediaKind) -> ms_rtp::MediaKind {
    match kind {
        MediaKind::Audio => ms_rtp::MediaKind::Audio,
        MediaKind::Video => ms_rtp::MediaKind::Video,
    }
}

fn our_media_kind(kind: ms_rtp::MediaKind) -> MediaKind {
    match kind {
        ms_rtp::MediaKind::Audio => MediaKind::Audio,
        ms_rtp::MediaKind::Video => MediaKind::Video,
    }
}

/// Convert the configured codec list to mediasoup router codecs.
fn router_codecs(
    codecs: &[RtpCodecCapability],
) -> Result<Vec<ms_rtp::RtpCodecCapability>, RelayError> {
    if codecs.is_empty() {
        return Err(RelayError::Failed("router needs at least one codec".to_string()));
    }
    codecs
        .iter()
        .map(|codec| {
            let mut value = json!({
                "kind": codec.kind.as_str(),
                "mimeType": codec.mime_type,
                "clockRate": codec.clock_rate,
                "parameters": codec.parameters,
                "rtcpFeedback": [],
            });
            if let (Some(channels), Some(object)) = (codec.channels, value.as_object_mut()) {
                object.insert("channels".to_string(), Value::from(channels));
            }
            from_json("media codec", value)
        })
        .collect()
}

/// One listen entry per address and enabled protocol, each bound within
/// the worker's RTC port range.
fn listen_infos(
    options: &WebRtcTransportOptions,
    port_range: &RangeInclusive<u16>,
) -> Result<Vec<ListenInfo>, RelayError> {
    if !options.enable_udp && !options.enable_tcp {
        return Err(RelayError::Failed("neither UDP nor TCP enabled".to_string()));
    }

    let mut infos = Vec::new();
    for listen in &options.listen_ips {
        let ip: IpAddr = listen
            .ip
            .parse()
            .map_err(|e| RelayError::Failed(format!("invalid listen IP {}: {e}", listen.ip)))?;
        let protocols = [
            options.enable_udp.then_some(Protocol::Udp),
            options.enable_tcp.then_some(Protocol::Tcp),
        ];
        for protocol in protocols.into_iter().flatten() {
            infos.push(ListenInfo {
                protocol,
                ip,
                announced_address: listen.announced_ip.clone(),
                expose_internal_ip: false,
                port: None,
                port_range: Some(port_range.clone()),
                flags: None,
                send_buffer_size: None,
                recv_buffer_size: None,
            });
        }
    }
    Ok(infos)
}

fn from_json<T: DeserializeOwned>(what: &str, value: Value) -> Result<T, RelayError> {
    serde_json::from_value(value).map_err(|e| RelayError::Failed(format!("invalid {what}: {e}")))
}

fn to_json<T: Serialize + ?Sized>(what: &str, value: &T) -> Result<Value, RelayError> {
    serde_json::to_value(value)
        .map_err(|e| RelayError::Failed(format!("cannot encode {what}: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::config::default_media_codecs;
    use crate::relay::engine::TransportListenIp;

    fn options(enable_udp: bool, enable_tcp: bool) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ips: vec![TransportListenIp {
                ip: "0.0.0.0".to_string(),
                announced_ip: Some("203.0.113.7".to_string()),
            }],
            enable_udp,
            enable_tcp,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 800_000,
        }
    }

    #[test]
    fn test_listen_infos_cover_each_enabled_protocol() {
        let infos = listen_infos(&options(true, true), &(40000..=40100)).unwrap();
        assert_eq!(infos.len(), 2);
        assert!(matches!(infos[0].protocol, Protocol::Udp));
        assert!(matches!(infos[1].protocol, Protocol::Tcp));
        for info in &infos {
            assert_eq!(info.port_range, Some(40000..=40100));
            assert_eq!(info.port, None);
            assert_eq!(info.announced_address.as_deref(), Some("203.0.113.7"));
            assert_eq!(info.ip, "0.0.0.0".parse::<IpAddr>().unwrap());
        }

        let udp_only = listen_infos(&options(true, false), &(40000..=40100)).unwrap();
        assert_eq!(udp_only.len(), 1);
        assert!(matches!(udp_only[0].protocol, Protocol::Udp));
    }

    #[test]
    fn test_listen_infos_reject_bad_options() {
        assert!(matches!(
            listen_infos(&options(false, false), &(40000..=40100)),
            Err(RelayError::Failed(_))
        ));

        let mut bad_ip = options(true, true);
        bad_ip.listen_ips[0].ip = "not-an-ip".to_string();
        assert!(matches!(
            listen_infos(&bad_ip, &(40000..=40100)),
            Err(RelayError::Failed(_))
        ));
    }

    #[test]
    fn test_router_codecs_from_default_config() {
        let codecs = router_codecs(&default_media_codecs()).unwrap();
        assert_eq!(codecs.len(), 2);

        let value = serde_json::to_value(&codecs).unwrap();
        assert_eq!(value[0]["mimeType"], "audio/opus");
        assert_eq!(value[0]["channels"], 2);
        assert_eq!(value[1]["mimeType"], "video/VP8");
    }

    #[test]
    fn test_router_codecs_reject_empty_and_malformed() {
        assert!(router_codecs(&[]).is_err());

        // Audio codecs need a channel count
        let mut codecs = default_media_codecs();
        codecs[0].channels = None;
        assert!(router_codecs(&codecs).is_err());
    }

    #[test]
    fn test_log_tags_skip_unknown_names() {
        let tags = log_tags(&[
            "info".to_string(),
            " ICE ".to_string(),
            "bogus".to_string(),
        ]);
        assert_eq!(tags.len(), 2);
        assert!(matches!(tags[0], WorkerLogTag::Info));
        assert!(matches!(tags[1], WorkerLogTag::Ice));
    }
}
