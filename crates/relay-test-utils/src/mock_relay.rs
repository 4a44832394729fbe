//! Scriptable relay engine for coordinator testing.
//!
//! `MockRelay` implements `RelayRouter` and records every call. It can be
//! configured to:
//! - Fail transport creation, bitrate caps, produce or consume
//! - Report remote capabilities as incompatible
//! - Delay every async call (for timeout tests)
//! - Hold consume calls open after the consumer exists (for replacement races)
//!
//! # Example
//!
//! ```rust,ignore
//! use relay_test_utils::{MockRelay, MockWorker, RelayCall};
//!
//! let relay = MockRelay::builder()
//!     .fail_bitrate_cap()
//!     .build();
//! let worker = MockWorker::new(relay.clone());
//!
//! // ... drive sessions ...
//! assert_eq!(relay.count(|c| matches!(c, RelayCall::CreateTransport)), 2);
//! ```

use async_trait::async_trait;
use relay_coordinator::relay::{
    ConsumerParams, DtlsParameters, RelayError, RelayRouter, RelayWorker, RtpCapabilities,
    RtpCodecCapability, RtpParameters, TransportParams, WebRtcTransportOptions,
};
use relay_coordinator::types::{ConsumerId, MediaKind, ProducerId, TransportId};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// A call received by the mock relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayCall {
    CreateTransport,
    ConnectTransport(TransportId),
    SetMaxIncomingBitrate(TransportId, u32),
    Produce(TransportId, MediaKind),
    CanConsume(ProducerId),
    Consume {
        transport_id: TransportId,
        producer_id: ProducerId,
        paused: bool,
    },
    ResumeConsumer(ConsumerId),
    CloseTransport(TransportId),
    CloseProducer(ProducerId),
    CloseConsumer(ConsumerId),
}

#[derive(Debug, Clone, Default)]
struct Behavior {
    fail_transport_creation: bool,
    fail_bitrate_cap: bool,
    fail_produce: bool,
    fail_consume: bool,
    incompatible: bool,
    call_delay: Option<Duration>,
    consume_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct MockRelayInner {
    next_id: u64,
    calls: Vec<RelayCall>,
    /// Transport id -> connected
    transports: HashMap<TransportId, bool>,
    producers: HashMap<ProducerId, MediaKind>,
    /// Consumer id -> (producer, paused)
    consumers: HashMap<ConsumerId, (ProducerId, bool)>,
}

impl MockRelayInner {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

/// Mock relay router.
#[derive(Debug, Clone)]
pub struct MockRelay {
    behavior: Behavior,
    inner: Arc<Mutex<MockRelayInner>>,
}

impl Default for MockRelay {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl MockRelay {
    /// Create a new MockRelay builder.
    #[must_use]
    pub fn builder() -> MockRelayBuilder {
        MockRelayBuilder::default()
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<RelayCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Number of recorded calls matching the predicate.
    pub fn count(&self, predicate: impl Fn(&RelayCall) -> bool) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| predicate(c))
            .count()
    }

    /// Forget recorded calls. Relay objects are kept.
    pub fn clear(&self) {
        self.inner.lock().unwrap().calls.clear();
    }

    /// Number of open transports.
    pub fn transport_count(&self) -> usize {
        self.inner.lock().unwrap().transports.len()
    }

    /// Number of open producers.
    pub fn producer_count(&self) -> usize {
        self.inner.lock().unwrap().producers.len()
    }

    /// Number of open consumers.
    pub fn consumer_count(&self) -> usize {
        self.inner.lock().unwrap().consumers.len()
    }

    /// Pause flag of a consumer, `None` if it is closed.
    pub fn consumer_paused(&self, consumer_id: &ConsumerId) -> Option<bool> {
        self.inner
            .lock()
            .unwrap()
            .consumers
            .get(consumer_id)
            .map(|(_, paused)| *paused)
    }

    /// Wrap as a trait object for `CapabilityRegistry::install`.
    #[must_use]
    pub fn as_router(&self) -> Arc<dyn RelayRouter> {
        Arc::new(self.clone())
    }

    fn record(&self, call: RelayCall) {
        self.inner.lock().unwrap().calls.push(call);
    }

    async fn delay(&self) {
        if let Some(delay) = self.behavior.call_delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl RelayRouter for MockRelay {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        json!({
            "codecs": [
                { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2, "preferredPayloadType": 100 },
                { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000, "preferredPayloadType": 101 },
            ],
            "headerExtensions": [],
        })
    }

    async fn create_webrtc_transport(
        &self,
        _options: &WebRtcTransportOptions,
    ) -> Result<TransportParams, RelayError> {
        self.record(RelayCall::CreateTransport);
        self.delay().await;
        if self.behavior.fail_transport_creation {
            return Err(RelayError::Failed("no ports available".to_string()));
        }

        let mut inner = self.inner.lock().unwrap();
        let id = TransportId(inner.next_id("transport"));
        inner.transports.insert(id.clone(), false);
        Ok(TransportParams {
            id,
            ice_parameters: json!({ "usernameFragment": "mock", "password": "mock", "iceLite": true }),
            ice_candidates: json!([{ "ip": "127.0.0.1", "port": 10000, "protocol": "udp" }]),
            dtls_parameters: json!({ "role": "auto", "fingerprints": [] }),
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        _dtls_parameters: DtlsParameters,
    ) -> Result<(), RelayError> {
        self.record(RelayCall::ConnectTransport(transport_id.clone()));
        self.delay().await;

        let mut inner = self.inner.lock().unwrap();
        match inner.transports.get_mut(transport_id) {
            None => Err(RelayError::NotFound(format!("transport {transport_id}"))),
            Some(true) => Err(RelayError::InvalidState(format!(
                "transport {transport_id} already connected"
            ))),
            Some(connected) => {
                *connected = true;
                Ok(())
            }
        }
    }

    async fn set_max_incoming_bitrate(
        &self,
        transport_id: &TransportId,
        bitrate: u32,
    ) -> Result<(), RelayError> {
        self.record(RelayCall::SetMaxIncomingBitrate(
            transport_id.clone(),
            bitrate,
        ));
        self.delay().await;
        if self.behavior.fail_bitrate_cap {
            return Err(RelayError::Failed("bitrate cap rejected".to_string()));
        }
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        _rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, RelayError> {
        self.record(RelayCall::Produce(transport_id.clone(), kind));
        self.delay().await;
        if self.behavior.fail_produce {
            return Err(RelayError::Failed("produce rejected".to_string()));
        }

        let mut inner = self.inner.lock().unwrap();
        if !inner.transports.contains_key(transport_id) {
            return Err(RelayError::NotFound(format!("transport {transport_id}")));
        }
        let id = ProducerId(inner.next_id("producer"));
        inner.producers.insert(id.clone(), kind);
        Ok(id)
    }

    async fn can_consume(
        &self,
        producer_id: &ProducerId,
        _rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, RelayError> {
        self.record(RelayCall::CanConsume(producer_id.clone()));
        self.delay().await;
        if !self.inner.lock().unwrap().producers.contains_key(producer_id) {
            return Err(RelayError::NotFound(format!("producer {producer_id}")));
        }
        Ok(!self.behavior.incompatible)
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        _rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerParams, RelayError> {
        self.record(RelayCall::Consume {
            transport_id: transport_id.clone(),
            producer_id: producer_id.clone(),
            paused,
        });
        self.delay().await;
        if self.behavior.fail_consume {
            return Err(RelayError::Failed("consume rejected".to_string()));
        }

        let (id, kind) = {
            let mut inner = self.inner.lock().unwrap();
            let kind = *inner
                .producers
                .get(producer_id)
                .ok_or_else(|| RelayError::NotFound(format!("producer {producer_id}")))?;
            let id = ConsumerId(inner.next_id("consumer"));
            inner
                .consumers
                .insert(id.clone(), (producer_id.clone(), paused));
            (id, kind)
        };
        if let Some(delay) = self.behavior.consume_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(ConsumerParams {
            id,
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters: json!({ "codecs": [], "encodings": [{ "ssrc": 2222 }] }),
            consumer_type: "simple".to_string(),
            producer_paused: false,
            paused,
        })
    }

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), RelayError> {
        self.record(RelayCall::ResumeConsumer(consumer_id.clone()));
        self.delay().await;

        let mut inner = self.inner.lock().unwrap();
        match inner.consumers.get_mut(consumer_id) {
            Some((_, paused)) => {
                *paused = false;
                Ok(())
            }
            None => Err(RelayError::NotFound(format!("consumer {consumer_id}"))),
        }
    }

    async fn close_transport(&self, transport_id: &TransportId) -> Result<(), RelayError> {
        self.record(RelayCall::CloseTransport(transport_id.clone()));
        self.inner.lock().unwrap().transports.remove(transport_id);
        Ok(())
    }

    async fn close_producer(&self, producer_id: &ProducerId) -> Result<(), RelayError> {
        self.record(RelayCall::CloseProducer(producer_id.clone()));
        let mut inner = self.inner.lock().unwrap();
        inner.producers.remove(producer_id);
        inner.consumers.retain(|_, (p, _)| p != producer_id);
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &ConsumerId) -> Result<(), RelayError> {
        self.record(RelayCall::CloseConsumer(consumer_id.clone()));
        self.inner.lock().unwrap().consumers.remove(consumer_id);
        Ok(())
    }
}

/// Builder for MockRelay configuration.
#[derive(Debug, Default)]
pub struct MockRelayBuilder {
    behavior: Behavior,
}

impl MockRelayBuilder {
    /// Reject every transport allocation.
    #[must_use]
    pub fn fail_transport_creation(mut self) -> Self {
        self.behavior.fail_transport_creation = true;
        self
    }

    /// Reject the per-transport bitrate cap.
    #[must_use]
    pub fn fail_bitrate_cap(mut self) -> Self {
        self.behavior.fail_bitrate_cap = true;
        self
    }

    #[must_use]
    pub fn fail_produce(mut self) -> Self {
        self.behavior.fail_produce = true;
        self
    }

    #[must_use]
    pub fn fail_consume(mut self) -> Self {
        self.behavior.fail_consume = true;
        self
    }

    /// Answer `can_consume` with false.
    #[must_use]
    pub fn incompatible(mut self) -> Self {
        self.behavior.incompatible = true;
        self
    }

    /// Sleep before answering each async call.
    #[must_use]
    pub fn call_delay(mut self, delay: Duration) -> Self {
        self.behavior.call_delay = Some(delay);
        self
    }

    /// Keep each consume call outstanding for `delay` after the consumer was
    /// created.
    #[must_use]
    pub fn consume_delay(mut self, delay: Duration) -> Self {
        self.behavior.consume_delay = Some(delay);
        self
    }

    #[must_use]
    pub fn build(self) -> MockRelay {
        MockRelay {
            behavior: self.behavior,
            inner: Arc::new(Mutex::new(MockRelayInner::default())),
        }
    }
}

/// Mock relay worker handing out one [`MockRelay`].
#[derive(Debug)]
pub struct MockWorker {
    relay: MockRelay,
    died_tx: watch::Sender<Option<String>>,
    routers_created: Mutex<usize>,
}

impl MockWorker {
    #[must_use]
    pub fn new(relay: MockRelay) -> Self {
        let (died_tx, _) = watch::channel(None);
        Self {
            relay,
            died_tx,
            routers_created: Mutex::new(0),
        }
    }

    /// Simulate the worker process dying.
    pub fn kill(&self, reason: impl Into<String>) {
        self.died_tx.send_replace(Some(reason.into()));
    }

    pub fn routers_created(&self) -> usize {
        *self.routers_created.lock().unwrap()
    }

    #[must_use]
    pub fn relay(&self) -> &MockRelay {
        &self.relay
    }
}

#[async_trait]
impl RelayWorker for MockWorker {
    async fn create_router(
        &self,
        _media_codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn RelayRouter>, RelayError> {
        if let Some(reason) = self.died_tx.borrow().clone() {
            return Err(RelayError::WorkerDied(reason));
        }
        *self.routers_created.lock().unwrap() += 1;
        Ok(self.relay.as_router())
    }

    fn died(&self) -> watch::Receiver<Option<String>> {
        self.died_tx.subscribe()
    }
}

/// Placeholder payload for calls whose contents the mock ignores.
#[must_use]
pub fn opaque(label: &str) -> Value {
    json!({ "mock": label })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls_and_tracks_objects() {
        let relay = MockRelay::builder().build();
        let params = relay
            .create_webrtc_transport(&crate::transport_options())
            .await
            .unwrap();
        relay
            .connect_transport(&params.id, opaque("dtls"))
            .await
            .unwrap();
        let producer = relay
            .produce(&params.id, MediaKind::Video, opaque("rtp"))
            .await
            .unwrap();

        assert_eq!(relay.transport_count(), 1);
        assert_eq!(relay.producer_count(), 1);
        assert_eq!(
            relay.calls(),
            vec![
                RelayCall::CreateTransport,
                RelayCall::ConnectTransport(params.id.clone()),
                RelayCall::Produce(params.id.clone(), MediaKind::Video),
            ]
        );

        relay.close_producer(&producer).await.unwrap();
        assert_eq!(relay.producer_count(), 0);
    }

    #[tokio::test]
    async fn test_second_connect_is_invalid_state() {
        let relay = MockRelay::default();
        let params = relay
            .create_webrtc_transport(&crate::transport_options())
            .await
            .unwrap();
        relay
            .connect_transport(&params.id, opaque("dtls"))
            .await
            .unwrap();
        assert!(matches!(
            relay.connect_transport(&params.id, opaque("dtls")).await,
            Err(RelayError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_configured_failures() {
        let relay = MockRelay::builder()
            .fail_transport_creation()
            .fail_bitrate_cap()
            .build();
        assert!(relay
            .create_webrtc_transport(&crate::transport_options())
            .await
            .is_err());
        assert!(relay
            .set_max_incoming_bitrate(&TransportId("t".to_string()), 1)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_worker_kill_is_observed() {
        let worker = MockWorker::new(MockRelay::default());
        let mut died = worker.died();
        worker.create_router(&[]).await.unwrap();
        assert_eq!(worker.routers_created(), 1);

        worker.kill("boom");
        died.changed().await.unwrap();
        assert_eq!(died.borrow().as_deref(), Some("boom"));
        assert!(matches!(
            worker.create_router(&[]).await,
            Err(RelayError::WorkerDied(_))
        ));
    }
}
