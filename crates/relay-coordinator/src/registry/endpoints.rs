//! The process-wide producer slot and the consumers bound to it.
//!
//! Both live behind one lock. Every producer registration bumps a
//! generation counter; a consumer is only committed if the generation it was
//! created against is still current, so no consumer outlives a replacement.

use super::{relay_unavailable, CapabilityRegistry, RegistrySettings, TransportRegistry};
use crate::bus::{Notification, NotificationBus};
use crate::errors::CoordinatorError;
use crate::observability::metrics::record_producer_replacement;
use crate::relay::{with_timeout, RelayError, RelayRouter, RtpCapabilities, RtpParameters};
use crate::types::{ConsumerId, Direction, MediaKind, ProducerId, SessionId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct ProducerEntry {
    id: ProducerId,
    kind: MediaKind,
    owner: SessionId,
    generation: u64,
}

#[derive(Debug, Clone)]
struct ConsumerEntry {
    id: ConsumerId,
    producer_id: ProducerId,
    paused: bool,
}

#[derive(Debug, Default)]
struct EndpointState {
    producer: Option<ProducerEntry>,
    generation: u64,
    consumers: HashMap<SessionId, ConsumerEntry>,
}

impl EndpointState {
    fn current_generation(&self) -> Option<u64> {
        self.producer.as_ref().map(|p| p.generation)
    }

    /// Remove every consumer bound to `producer_id`.
    fn take_consumers_of(&mut self, producer_id: &ProducerId) -> Vec<(SessionId, ConsumerId)> {
        let orphaned: Vec<SessionId> = self
            .consumers
            .iter()
            .filter(|(_, c)| &c.producer_id == producer_id)
            .map(|(session, _)| *session)
            .collect();
        orphaned
            .into_iter()
            .filter_map(|session| self.consumers.remove(&session).map(|c| (session, c.id)))
            .collect()
    }
}

/// The active producer as seen by other sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerSnapshot {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub owner: SessionId,
}

/// Consume result returned to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescriptor {
    pub producer_id: ProducerId,
    pub id: ConsumerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(rename = "type")]
    pub consumer_type: String,
    pub producer_paused: bool,
    pub paused: bool,
}

/// Tracks the single active producer and its consumers.
pub struct MediaEndpointRegistry {
    capabilities: Arc<CapabilityRegistry>,
    transports: Arc<TransportRegistry>,
    bus: Arc<NotificationBus>,
    settings: Arc<RegistrySettings>,
    state: Mutex<EndpointState>,
}

impl MediaEndpointRegistry {
    #[must_use]
    pub fn new(
        capabilities: Arc<CapabilityRegistry>,
        transports: Arc<TransportRegistry>,
        bus: Arc<NotificationBus>,
        settings: Arc<RegistrySettings>,
    ) -> Self {
        Self {
            capabilities,
            transports,
            bus,
            settings,
            state: Mutex::new(EndpointState::default()),
        }
    }

    /// Create a producer on the session's producing transport and make it
    /// the active one.
    ///
    /// Any previous producer is closed, its consumers are closed and their
    /// sessions get `producerClosed`. Every other session gets `newProducer`.
    ///
    /// # Errors
    ///
    /// `TransportNotReady` if the producing transport is missing or not
    /// connected, `RelayUnavailable` if the relay rejects the call.
    pub async fn register_producer(
        &self,
        session_id: SessionId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, CoordinatorError> {
        let transport_id = self
            .transports
            .connected_transport(session_id, Direction::Producing)
            .await?;
        let router = self.capabilities.router()?;

        let producer_id = with_timeout(
            "produce",
            self.settings.relay_call_timeout,
            router.produce(&transport_id, kind, rtp_parameters),
        )
        .await
        .map_err(|e| relay_unavailable("produce", e))?;

        let (replaced, orphans) = {
            let mut state = self.state.lock().await;
            state.generation += 1;
            let generation = state.generation;
            let previous = state.producer.replace(ProducerEntry {
                id: producer_id.clone(),
                kind,
                owner: session_id,
                generation,
            });
            let orphans = previous
                .as_ref()
                .map(|p| state.take_consumers_of(&p.id))
                .unwrap_or_default();
            (previous, orphans)
        };

        info!(
            target: "rc.registry.endpoint",
            session_id = %session_id,
            producer_id = %producer_id,
            kind = kind.as_str(),
            replaced = replaced.is_some(),
            "Producer registered"
        );

        if let Some(previous) = replaced {
            record_producer_replacement();
            self.retire_producer(&router, &previous.id, orphans).await;
        }

        self.bus
            .publish(
                Notification::NewProducer {
                    producer_id: producer_id.clone(),
                    kind,
                },
                Some(session_id),
            )
            .await;

        Ok(producer_id)
    }

    /// Create a paused consumer of the active producer for the session.
    ///
    /// `producer_id`, when given, must name the active producer.
    ///
    /// # Errors
    ///
    /// In check order: `NoActiveProducer`, `TransportNotReady`,
    /// `IncompatibleCapabilities`, `ConsumeFailed`. `ProducerReplaced` if the
    /// producer changed while the relay call was outstanding.
    pub async fn create_consumer(
        &self,
        session_id: SessionId,
        producer_id: Option<&ProducerId>,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerDescriptor, CoordinatorError> {
        let producer = self
            .state
            .lock()
            .await
            .producer
            .clone()
            .ok_or(CoordinatorError::NoActiveProducer)?;
        if producer_id.is_some_and(|requested| requested != &producer.id) {
            return Err(CoordinatorError::NoActiveProducer);
        }

        let transport_id = self
            .transports
            .connected_transport(session_id, Direction::Consuming)
            .await?;
        let router = self.capabilities.router()?;
        let limit = self.settings.relay_call_timeout;

        let can_consume = match with_timeout(
            "can_consume",
            limit,
            router.can_consume(&producer.id, &rtp_capabilities),
        )
        .await
        {
            Ok(can_consume) => can_consume,
            Err(e) => return Err(self.consume_error(producer.generation, e).await),
        };
        if !can_consume {
            debug!(
                target: "rc.registry.endpoint",
                session_id = %session_id,
                producer_id = %producer.id,
                "Remote capabilities cannot consume producer"
            );
            return Err(CoordinatorError::IncompatibleCapabilities);
        }

        let params = match with_timeout(
            "consume",
            limit,
            router.consume(&transport_id, &producer.id, rtp_capabilities, true),
        )
        .await
        {
            Ok(params) => params,
            Err(e) => return Err(self.consume_error(producer.generation, e).await),
        };

        let previous = {
            let mut state = self.state.lock().await;
            if state.current_generation() == Some(producer.generation) {
                Ok(state.consumers.insert(
                    session_id,
                    ConsumerEntry {
                        id: params.id.clone(),
                        producer_id: producer.id.clone(),
                        paused: params.paused,
                    },
                ))
            } else {
                Err(CoordinatorError::ProducerReplaced)
            }
        };

        let previous = match previous {
            Ok(previous) => previous,
            Err(e) => {
                info!(
                    target: "rc.registry.endpoint",
                    session_id = %session_id,
                    producer_id = %producer.id,
                    consumer_id = %params.id,
                    "Producer replaced during consume, discarding consumer"
                );
                self.close_consumer_at_relay(&router, &params.id).await;
                return Err(e);
            }
        };

        if let Some(previous) = previous {
            self.close_consumer_at_relay(&router, &previous.id).await;
        }

        info!(
            target: "rc.registry.endpoint",
            session_id = %session_id,
            producer_id = %producer.id,
            consumer_id = %params.id,
            "Consumer created"
        );

        Ok(ConsumerDescriptor {
            producer_id: params.producer_id,
            id: params.id,
            kind: params.kind,
            rtp_parameters: params.rtp_parameters,
            consumer_type: params.consumer_type,
            // No media reaches a consumer until it is resumed
            producer_paused: params.producer_paused || params.paused,
            paused: params.paused,
        })
    }

    /// Unpause the session's consumer.
    ///
    /// # Errors
    ///
    /// `NoActiveConsumer` if the session has none, `RelayUnavailable` if the
    /// relay call fails.
    pub async fn resume_consumer(&self, session_id: SessionId) -> Result<ConsumerId, CoordinatorError> {
        let consumer_id = self
            .state
            .lock()
            .await
            .consumers
            .get(&session_id)
            .map(|c| c.id.clone())
            .ok_or(CoordinatorError::NoActiveConsumer)?;
        let router = self.capabilities.router()?;

        with_timeout(
            "resume_consumer",
            self.settings.relay_call_timeout,
            router.resume_consumer(&consumer_id),
        )
        .await
        .map_err(|e| match e {
            RelayError::NotFound(_) => CoordinatorError::NoActiveConsumer,
            other => relay_unavailable("resume_consumer", other),
        })?;

        let mut state = self.state.lock().await;
        match state.consumers.get_mut(&session_id) {
            Some(consumer) if consumer.id == consumer_id => consumer.paused = false,
            // Closed by a producer replacement while the call was outstanding
            _ => return Err(CoordinatorError::NoActiveConsumer),
        }
        drop(state);

        debug!(
            target: "rc.registry.endpoint",
            session_id = %session_id,
            consumer_id = %consumer_id,
            "Consumer resumed"
        );
        Ok(consumer_id)
    }

    /// Drop the session's consumer, if any.
    pub async fn release_consumer(&self, session_id: SessionId) -> Option<ConsumerId> {
        let removed = self.state.lock().await.consumers.remove(&session_id)?;
        if let Ok(router) = self.capabilities.router() {
            self.close_consumer_at_relay(&router, &removed.id).await;
        }
        Some(removed.id)
    }

    /// Clear the producer slot if the session owns it. Its consumers are
    /// closed and notified.
    pub async fn release_producer(&self, session_id: SessionId) -> Option<ProducerId> {
        let (producer, orphans) = {
            let mut state = self.state.lock().await;
            if state.producer.as_ref().map(|p| p.owner) != Some(session_id) {
                return None;
            }
            let producer = state.producer.take()?;
            let orphans = state.take_consumers_of(&producer.id);
            (producer, orphans)
        };

        info!(
            target: "rc.registry.endpoint",
            session_id = %session_id,
            producer_id = %producer.id,
            consumers = orphans.len(),
            "Producer released"
        );

        match self.capabilities.router() {
            Ok(router) => self.retire_producer(&router, &producer.id, orphans).await,
            Err(_) => self.notify_orphans(&producer.id, orphans).await,
        }
        Some(producer.id)
    }

    /// Drop everything the session owns.
    pub async fn release_session(&self, session_id: SessionId) {
        self.release_consumer(session_id).await;
        self.release_producer(session_id).await;
    }

    pub async fn current_producer(&self) -> Option<ProducerSnapshot> {
        self.state.lock().await.producer.as_ref().map(|p| ProducerSnapshot {
            id: p.id.clone(),
            kind: p.kind,
            owner: p.owner,
        })
    }

    pub async fn consumer_count(&self) -> usize {
        self.state.lock().await.consumers.len()
    }

    /// Pause flag of the session's consumer.
    pub async fn consumer_paused(&self, session_id: SessionId) -> Option<bool> {
        self.state
            .lock()
            .await
            .consumers
            .get(&session_id)
            .map(|c| c.paused)
    }

    /// Map a relay failure during consume, distinguishing a replacement race.
    async fn consume_error(&self, generation: u64, err: RelayError) -> CoordinatorError {
        if self.state.lock().await.current_generation() != Some(generation) {
            return CoordinatorError::ProducerReplaced;
        }
        warn!(
            target: "rc.registry.endpoint",
            error = %err,
            "Relay consume failed"
        );
        CoordinatorError::ConsumeFailed(err.to_string())
    }

    async fn retire_producer(
        &self,
        router: &Arc<dyn RelayRouter>,
        producer_id: &ProducerId,
        orphans: Vec<(SessionId, ConsumerId)>,
    ) {
        if let Err(e) = with_timeout(
            "close_producer",
            self.settings.relay_call_timeout,
            router.close_producer(producer_id),
        )
        .await
        {
            warn!(
                target: "rc.registry.endpoint",
                producer_id = %producer_id,
                error = %e,
                "Failed to close producer at relay"
            );
        }
        for (_, consumer_id) in &orphans {
            self.close_consumer_at_relay(router, consumer_id).await;
        }
        self.notify_orphans(producer_id, orphans).await;
    }

    async fn notify_orphans(&self, producer_id: &ProducerId, orphans: Vec<(SessionId, ConsumerId)>) {
        for (session_id, consumer_id) in orphans {
            self.bus
                .send_to(
                    session_id,
                    Notification::ProducerClosed {
                        producer_id: producer_id.clone(),
                        consumer_id,
                    },
                )
                .await;
        }
    }

    async fn close_consumer_at_relay(&self, router: &Arc<dyn RelayRouter>, id: &ConsumerId) {
        if let Err(e) = with_timeout(
            "close_consumer",
            self.settings.relay_call_timeout,
            router.close_consumer(id),
        )
        .await
        {
            warn!(
                target: "rc.registry.endpoint",
                consumer_id = %id,
                error = %e,
                "Failed to close consumer at relay"
            );
        }
    }
}
