//! `SessionActor` - one per signaling connection.
//!
//! Each `SessionActor`:
//! - Processes its client's requests in arrival order
//! - Tracks the producer and consumer branches of the session state machine
//! - Forwards bus notifications to the client sink
//!
//! # Lifecycle
//!
//! 1. Spawned by the coordinator when a client connects
//! 2. Runs until disconnected, cancelled, or every handle is dropped
//! 3. On exit releases everything the session owns through the registries

use super::messages::{
    ConsumerPhase, ProducerPhase, SessionMessage, SessionReply, SessionRequest, SessionResult,
    SessionSnapshot,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::bus::Notification;
use crate::errors::CoordinatorError;
use crate::observability::metrics::{record_notification_dropped, record_signaling_request};
use crate::registry::Registries;
use crate::types::{ConsumerId, Direction, ProducerId, SessionId};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Channel buffer size for the session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 64;

/// Channel buffer size for bus notifications addressed to one session.
pub const NOTIFICATION_CHANNEL_BUFFER: usize = 32;

/// Handle to a `SessionActor`.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    session_id: SessionId,
    mailbox: Arc<MailboxMonitor>,
}

impl SessionHandle {
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Send a request and wait for its result.
    ///
    /// # Errors
    ///
    /// The request's own error, or `Internal` if the actor is gone.
    pub async fn call(&self, request: SessionRequest) -> SessionResult {
        let rx = self.dispatch(request).await?;
        rx.await
            .map_err(|e| CoordinatorError::Internal(format!("response receive failed: {e}")))?
    }

    /// Enqueue a request without waiting for it.
    ///
    /// Requests are handled in the order they were dispatched. The receiver
    /// resolves with an error if the session is disconnected first.
    ///
    /// # Errors
    ///
    /// `Internal` if the actor is gone.
    pub async fn dispatch(
        &self,
        request: SessionRequest,
    ) -> Result<oneshot::Receiver<SessionResult>, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::Request {
            request,
            respond_to: tx,
        })
        .await?;
        Ok(rx)
    }

    /// Current state of the session.
    ///
    /// # Errors
    ///
    /// `Internal` if the actor is gone.
    pub async fn state(&self) -> Result<SessionSnapshot, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::GetState { respond_to: tx }).await?;

        rx.await
            .map_err(|e| CoordinatorError::Internal(format!("response receive failed: {e}")))
    }

    /// Messages sent to the session and not yet handled, including the one
    /// in progress.
    #[must_use]
    pub fn mailbox_depth(&self) -> usize {
        self.mailbox.current_depth()
    }

    async fn send(&self, message: SessionMessage) -> Result<(), CoordinatorError> {
        self.mailbox.record_enqueue();
        self.sender.send(message).await.map_err(|e| {
            self.mailbox.record_send_failed();
            CoordinatorError::Internal(format!("channel send failed: {e}"))
        })
    }

    /// Disconnect the session. Cleanup runs in the actor.
    pub fn disconnect(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Where a session stands on one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportStage {
    Missing,
    Created,
    Connected,
}

/// The `SessionActor` implementation.
pub struct SessionActor {
    session_id: SessionId,
    receiver: mpsc::Receiver<SessionMessage>,
    /// Notifications published to this session on the bus.
    notifications: mpsc::Receiver<Notification>,
    /// Outbound notifications for the client connection.
    client_sink: mpsc::Sender<Notification>,
    registries: Registries,
    /// Cancellation token (child of the coordinator's token).
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    /// Shared with every handle; handles count sends, the actor counts
    /// handled messages.
    mailbox: Arc<MailboxMonitor>,
    producer_phase: ProducerPhase,
    consumer_phase: ConsumerPhase,
    /// Consumer currently bound to this session, if any.
    consumer_id: Option<ConsumerId>,
    /// Last producer announced to the client with `newProducer`.
    last_announced: Option<ProducerId>,
    connected_at: i64,
}

impl SessionActor {
    /// Spawn a new session actor.
    ///
    /// `notifications` must be the receiving side of the sender subscribed
    /// on the bus for `session_id`. Returns a handle and the task join handle.
    pub fn spawn(
        session_id: SessionId,
        notifications: mpsc::Receiver<Notification>,
        client_sink: mpsc::Sender<Notification>,
        registries: Registries,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let mailbox = Arc::new(MailboxMonitor::new(
            ActorType::Session,
            session_id.to_string(),
        ));

        let actor = Self {
            session_id,
            receiver,
            notifications,
            client_sink,
            registries,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: Arc::clone(&mailbox),
            producer_phase: ProducerPhase::Connected,
            consumer_phase: ConsumerPhase::Connected,
            consumer_id: None,
            last_announced: None,
            connected_at: chrono::Utc::now().timestamp(),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = SessionHandle {
            sender,
            cancel_token,
            session_id,
            mailbox,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "rc.actor.session", fields(session_id = %self.session_id))]
    async fn run(mut self) {
        debug!(
            target: "rc.actor.session",
            session_id = %self.session_id,
            "SessionActor started"
        );

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "rc.actor.session",
                        session_id = %self.session_id,
                        "SessionActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            debug!(
                                target: "rc.actor.session",
                                session_id = %self.session_id,
                                "SessionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }

                Some(notification) = self.notifications.recv() => {
                    self.forward(notification);
                }
            }
        }

        self.cleanup().await;

        info!(
            target: "rc.actor.session",
            session_id = %self.session_id,
            messages_processed = self.mailbox.messages_processed(),
            "SessionActor stopped"
        );
    }

    async fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Request {
                request,
                respond_to,
            } => {
                let method = request.method();
                let start = Instant::now();
                let result = self.handle_request(request).await;

                let status = match &result {
                    Ok(_) => "ok",
                    Err(e) => e.code(),
                };
                record_signaling_request(method, status, start.elapsed());

                if let Err(e) = &result {
                    debug!(
                        target: "rc.actor.session",
                        session_id = %self.session_id,
                        method = method,
                        code = e.code(),
                        error = %e,
                        "Request failed"
                    );
                }

                if self.cancel_token.is_cancelled() {
                    // Disconnected mid-call; cleanup releases whatever the call created
                    debug!(
                        target: "rc.actor.session",
                        session_id = %self.session_id,
                        method = method,
                        "Discarding response for disconnected session"
                    );
                    return;
                }
                let _ = respond_to.send(result);
            }

            SessionMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    async fn handle_request(&mut self, request: SessionRequest) -> SessionResult {
        match request {
            SessionRequest::GetRouterRtpCapabilities => {
                let capabilities = self.registries.capabilities.capabilities()?;
                self.producer_phase = self.producer_phase.max(ProducerPhase::CapabilitiesFetched);
                self.consumer_phase = self.consumer_phase.max(ConsumerPhase::CapabilitiesFetched);
                Ok(SessionReply::Capabilities(capabilities))
            }

            SessionRequest::CreateTransport { direction } => {
                let params = self
                    .registries
                    .transports
                    .create_transport(self.session_id, direction)
                    .await?;
                self.reset_branch(direction).await;
                Ok(SessionReply::Transport(params))
            }

            SessionRequest::ConnectTransport {
                direction,
                dtls_parameters,
            } => {
                match self.transport_stage(direction) {
                    TransportStage::Missing => {
                        return Err(CoordinatorError::UnknownTransport(direction))
                    }
                    TransportStage::Connected => {
                        return Err(CoordinatorError::TransportAlreadyConnected(direction))
                    }
                    TransportStage::Created => {}
                }
                self.registries
                    .transports
                    .connect_transport(self.session_id, direction, dtls_parameters)
                    .await?;
                match direction {
                    Direction::Producing => {
                        self.producer_phase = ProducerPhase::TransportConnected;
                    }
                    Direction::Consuming => {
                        self.consumer_phase = ConsumerPhase::TransportConnected;
                    }
                }
                Ok(SessionReply::Ack)
            }

            SessionRequest::Produce {
                kind,
                rtp_parameters,
            } => {
                if self.transport_stage(Direction::Producing) != TransportStage::Connected {
                    return Err(CoordinatorError::TransportNotReady(Direction::Producing));
                }
                let id = self
                    .registries
                    .endpoints
                    .register_producer(self.session_id, kind, rtp_parameters)
                    .await?;
                self.producer_phase = ProducerPhase::Producing;
                Ok(SessionReply::Produced { id })
            }

            SessionRequest::Consume {
                producer_id,
                rtp_capabilities,
            } => {
                // The registry owns the check order (producer, transport, capabilities)
                let descriptor = self
                    .registries
                    .endpoints
                    .create_consumer(self.session_id, producer_id.as_ref(), rtp_capabilities)
                    .await?;
                self.consumer_phase = ConsumerPhase::ConsumerCreated;
                self.consumer_id = Some(descriptor.id.clone());
                Ok(SessionReply::Consumed(descriptor))
            }

            SessionRequest::Resume => {
                if self.consumer_phase < ConsumerPhase::ConsumerCreated {
                    return Err(CoordinatorError::NoActiveConsumer);
                }
                match self
                    .registries
                    .endpoints
                    .resume_consumer(self.session_id)
                    .await
                {
                    Ok(_) => {
                        self.consumer_phase = ConsumerPhase::ConsumerResumed;
                        Ok(SessionReply::Ack)
                    }
                    Err(CoordinatorError::NoActiveConsumer) => {
                        self.drop_consumer();
                        Err(CoordinatorError::NoActiveConsumer)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn transport_stage(&self, direction: Direction) -> TransportStage {
        match direction {
            Direction::Producing => match self.producer_phase {
                ProducerPhase::Connected | ProducerPhase::CapabilitiesFetched => {
                    TransportStage::Missing
                }
                ProducerPhase::TransportReady => TransportStage::Created,
                ProducerPhase::TransportConnected | ProducerPhase::Producing => {
                    TransportStage::Connected
                }
            },
            Direction::Consuming => match self.consumer_phase {
                ConsumerPhase::Connected | ConsumerPhase::CapabilitiesFetched => {
                    TransportStage::Missing
                }
                ConsumerPhase::TransportReady => TransportStage::Created,
                ConsumerPhase::TransportConnected
                | ConsumerPhase::ConsumerCreated
                | ConsumerPhase::ConsumerResumed => TransportStage::Connected,
            },
        }
    }

    /// A new transport replaced the old one; what was built on it is gone.
    async fn reset_branch(&mut self, direction: Direction) {
        match direction {
            Direction::Producing => {
                if self.producer_phase == ProducerPhase::Producing {
                    self.registries
                        .endpoints
                        .release_producer(self.session_id)
                        .await;
                }
                self.producer_phase = ProducerPhase::TransportReady;
            }
            Direction::Consuming => {
                if self.consumer_id.is_some() {
                    self.registries
                        .endpoints
                        .release_consumer(self.session_id)
                        .await;
                    self.consumer_id = None;
                }
                self.consumer_phase = ConsumerPhase::TransportReady;
            }
        }
    }

    fn drop_consumer(&mut self) {
        self.consumer_id = None;
        if self.consumer_phase >= ConsumerPhase::ConsumerCreated {
            self.consumer_phase = ConsumerPhase::TransportConnected;
        }
    }

    /// Pass a bus notification on to the client.
    ///
    /// A producer is announced at most once: the connect snapshot and the
    /// registration broadcast can both carry the same producer.
    fn forward(&mut self, notification: Notification) {
        match &notification {
            Notification::ProducerClosed { consumer_id, .. } => {
                if self.consumer_id.as_ref() == Some(consumer_id) {
                    self.drop_consumer();
                }
            }
            Notification::NewProducer { producer_id, .. } => {
                if self.last_announced.as_ref() == Some(producer_id) {
                    debug!(
                        target: "rc.actor.session",
                        session_id = %self.session_id,
                        producer_id = %producer_id,
                        "Producer already announced, skipping"
                    );
                    return;
                }
                self.last_announced = Some(producer_id.clone());
            }
        }

        let method = notification.method();
        if let Err(e) = self.client_sink.try_send(notification) {
            warn!(
                target: "rc.actor.session",
                session_id = %self.session_id,
                method = method,
                error = %e,
                "Failed to forward notification to client"
            );
            record_notification_dropped(method);
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id,
            producer_phase: self.producer_phase,
            consumer_phase: self.consumer_phase,
            requests_handled: self.mailbox.messages_processed(),
            connected_at: self.connected_at,
        }
    }

    /// Release everything the session owns.
    async fn cleanup(&mut self) {
        self.registries.bus.unsubscribe(self.session_id).await;
        self.registries
            .endpoints
            .release_session(self.session_id)
            .await;
        let transports = self
            .registries
            .transports
            .release_session(self.session_id)
            .await;

        debug!(
            target: "rc.actor.session",
            session_id = %self.session_id,
            transports_released = transports.len(),
            "Session resources released"
        );
    }
}
