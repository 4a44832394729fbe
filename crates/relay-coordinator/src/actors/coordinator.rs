//! `SessionCoordinator` - singleton supervisor for session actors.
//!
//! - Spawns one `SessionActor` per signaling connection
//! - Subscribes each session to the notification bus and sends the
//!   `newProducer` snapshot on connect
//! - Owns the root `CancellationToken`
//! - Monitors session health (panic detection via `JoinHandle`)
//!
//! # Graceful Shutdown
//!
//! On shutdown or worker death the coordinator:
//! 1. Sets `accepting_new = false`
//! 2. Cancels every session (each releases its relay resources)
//! 3. Waits for the sessions up to the deadline

use super::messages::{CoordinatorMessage, CoordinatorStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::session::{SessionActor, SessionHandle, NOTIFICATION_CHANNEL_BUFFER};
use crate::bus::Notification;
use crate::errors::CoordinatorError;
use crate::registry::Registries;
use crate::types::SessionId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Channel buffer size for the coordinator mailbox.
const COORDINATOR_CHANNEL_BUFFER: usize = 256;

/// Upper bound on one session's cleanup after a disconnect.
const SESSION_CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline used when the root token is cancelled without `shutdown`.
const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Handle to the coordinator actor.
#[derive(Clone)]
pub struct SessionCoordinator {
    sender: mpsc::Sender<CoordinatorMessage>,
    cancel_token: CancellationToken,
    registries: Registries,
    mailbox: Arc<MailboxMonitor>,
}

impl SessionCoordinator {
    /// Spawn the coordinator actor and return a handle to it.
    #[must_use]
    pub fn new(registries: Registries, metrics: Arc<ActorMetrics>) -> Self {
        let (sender, receiver) = mpsc::channel(COORDINATOR_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Coordinator, "coordinator"));

        let actor = CoordinatorActor {
            receiver,
            cancel_token: cancel_token.clone(),
            registries: registries.clone(),
            sessions: HashMap::new(),
            accepting_new: true,
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            registries,
            mailbox,
        }
    }

    #[must_use]
    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    /// Open a session for a new signaling connection.
    ///
    /// Notifications for the session are delivered on `client_sink`.
    ///
    /// # Errors
    ///
    /// `ShuttingDown` once the coordinator stopped accepting sessions.
    pub async fn connect(
        &self,
        client_sink: mpsc::Sender<Notification>,
    ) -> Result<SessionHandle, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorMessage::Connect {
            client_sink,
            respond_to: tx,
        })
        .await
        .map_err(|_| CoordinatorError::ShuttingDown)?;

        rx.await
            .map_err(|e| CoordinatorError::Internal(format!("response receive failed: {e}")))?
    }

    /// Disconnect a session and wait for its cleanup.
    ///
    /// Returns `false` if the session was unknown.
    pub async fn disconnect(&self, session_id: SessionId) -> Result<bool, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorMessage::Disconnect {
            session_id,
            respond_to: tx,
        })
        .await
        .map_err(|e| CoordinatorError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CoordinatorError::Internal(format!("response receive failed: {e}")))
    }

    /// Get the current coordinator status.
    pub async fn status(&self) -> Result<CoordinatorStatus, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| CoordinatorError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CoordinatorError::Internal(format!("response receive failed: {e}")))
    }

    /// Refuse new sessions. Existing sessions keep running.
    pub async fn stop_accepting(&self, reason: impl Into<String>) -> Result<(), CoordinatorError> {
        self.send(CoordinatorMessage::StopAccepting {
            reason: reason.into(),
        })
        .await
        .map_err(|e| CoordinatorError::Internal(format!("channel send failed: {e}")))
    }

    /// Stop accepting sessions, disconnect every session and wait for them
    /// up to `deadline`.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorMessage::Shutdown {
            deadline,
            respond_to: tx,
        })
        .await
        .map_err(|e| CoordinatorError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CoordinatorError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn send(
        &self,
        message: CoordinatorMessage,
    ) -> Result<(), mpsc::error::SendError<CoordinatorMessage>> {
        self.mailbox.record_enqueue();
        self.sender.send(message).await.inspect_err(|_| {
            self.mailbox.record_send_failed();
        })
    }
}

/// Wait for the relay worker to die, then stop accepting sessions.
///
/// Returns the death reason.
pub async fn monitor_worker(
    mut died: watch::Receiver<Option<String>>,
    coordinator: SessionCoordinator,
) -> String {
    let reason = loop {
        if let Some(reason) = died.borrow_and_update().clone() {
            break reason;
        }
        if died.changed().await.is_err() {
            break "relay worker handle dropped".to_string();
        }
    };

    error!(
        target: "rc.relay",
        reason = %reason,
        "Relay worker died"
    );
    if let Err(e) = coordinator.stop_accepting(reason.clone()).await {
        warn!(
            target: "rc.relay",
            error = %e,
            "Failed to stop accepting sessions after worker death"
        );
    }
    reason
}

struct ManagedSession {
    handle: SessionHandle,
    task_handle: JoinHandle<()>,
    /// Unix timestamp (seconds).
    created_at: i64,
}

/// The coordinator actor implementation.
struct CoordinatorActor {
    receiver: mpsc::Receiver<CoordinatorMessage>,
    /// Cancellation token (root).
    cancel_token: CancellationToken,
    registries: Registries,
    sessions: HashMap<SessionId, ManagedSession>,
    accepting_new: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl CoordinatorActor {
    #[instrument(skip_all, name = "rc.actor.coordinator")]
    async fn run(mut self) {
        info!(target: "rc.actor.coordinator", "SessionCoordinator started");

        loop {
            // Reap sessions that stopped on their own
            self.check_session_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "rc.actor.coordinator",
                        "SessionCoordinator received cancellation signal"
                    );
                    self.graceful_shutdown(DEFAULT_SHUTDOWN_DEADLINE).await;
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
                            info!(
                                target: "rc.actor.coordinator",
                                "SessionCoordinator channel closed, exiting"
                            );
                            self.graceful_shutdown(DEFAULT_SHUTDOWN_DEADLINE).await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "rc.actor.coordinator",
            sessions_remaining = self.sessions.len(),
            messages_processed = self.mailbox.messages_processed(),
            "SessionCoordinator stopped"
        );
    }

    async fn handle_message(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::Connect {
                client_sink,
                respond_to,
            } => {
                let result = self.connect(client_sink).await;
                let _ = respond_to.send(result);
            }

            CoordinatorMessage::Disconnect {
                session_id,
                respond_to,
            } => {
                self.disconnect(session_id, respond_to);
            }

            CoordinatorMessage::GetStatus { respond_to } => {
                self.check_session_health().await;
                let status = self.status().await;
                let _ = respond_to.send(status);
            }

            CoordinatorMessage::StopAccepting { reason } => {
                if self.accepting_new {
                    warn!(
                        target: "rc.actor.coordinator",
                        reason = %reason,
                        sessions = self.sessions.len(),
                        "No longer accepting sessions"
                    );
                }
                self.accepting_new = false;
            }

            CoordinatorMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                self.graceful_shutdown(deadline).await;
                let _ = respond_to.send(());
            }
        }
    }

    async fn connect(
        &mut self,
        client_sink: mpsc::Sender<Notification>,
    ) -> Result<SessionHandle, CoordinatorError> {
        if !self.accepting_new {
            return Err(CoordinatorError::ShuttingDown);
        }

        let session_id = SessionId::new();

        // Subscribe before the snapshot so a concurrent produce is not missed
        let (bus_tx, bus_rx) = mpsc::channel(NOTIFICATION_CHANNEL_BUFFER);
        self.registries.bus.subscribe(session_id, bus_tx).await;

        let (handle, task_handle) = SessionActor::spawn(
            session_id,
            bus_rx,
            client_sink,
            self.registries.clone(),
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        if let Some(producer) = self.registries.endpoints.current_producer().await {
            self.registries
                .bus
                .send_to(
                    session_id,
                    Notification::NewProducer {
                        producer_id: producer.id,
                        kind: producer.kind,
                    },
                )
                .await;
        }

        self.sessions.insert(
            session_id,
            ManagedSession {
                handle: handle.clone(),
                task_handle,
                created_at: chrono::Utc::now().timestamp(),
            },
        );
        self.metrics.session_created();

        info!(
            target: "rc.actor.coordinator",
            session_id = %session_id,
            total_sessions = self.sessions.len(),
            "Session connected"
        );

        Ok(handle)
    }

    /// Cancel a session. The wait for its cleanup runs off the message loop.
    fn disconnect(&mut self, session_id: SessionId, respond_to: oneshot::Sender<bool>) {
        let Some(managed) = self.sessions.remove(&session_id) else {
            let _ = respond_to.send(false);
            return;
        };

        managed.handle.disconnect();
        self.metrics.session_closed();

        info!(
            target: "rc.actor.coordinator",
            session_id = %session_id,
            connected_for_secs = chrono::Utc::now().timestamp() - managed.created_at,
            total_sessions = self.sessions.len(),
            "Session disconnected"
        );

        let registries = self.registries.clone();
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            match tokio::time::timeout(SESSION_CLEANUP_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "rc.actor.coordinator",
                        session_id = %session_id,
                        "Session actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    if e.is_panic() {
                        metrics.record_panic(ActorType::Session);
                    }
                    release_abandoned(&registries, session_id).await;
                }
                Err(_) => {
                    warn!(
                        target: "rc.actor.coordinator",
                        session_id = %session_id,
                        "Session actor cleanup timed out"
                    );
                }
            }
            let _ = respond_to.send(true);
        });
    }

    async fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            session_count: self.sessions.len(),
            producer_active: self.registries.endpoints.current_producer().await.is_some(),
            consumer_count: self.registries.endpoints.consumer_count().await,
            accepting: self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    async fn graceful_shutdown(&mut self, deadline: Duration) {
        info!(
            target: "rc.actor.coordinator",
            session_count = self.sessions.len(),
            deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        for managed in self.sessions.values() {
            managed.handle.disconnect();
        }

        let sessions: Vec<(SessionId, JoinHandle<()>)> = self
            .sessions
            .drain()
            .map(|(session_id, managed)| (session_id, managed.task_handle))
            .collect();
        let total = sessions.len();
        for _ in 0..total {
            self.metrics.session_closed();
        }

        let (ids, tasks): (Vec<SessionId>, Vec<JoinHandle<()>>) = sessions.into_iter().unzip();
        match tokio::time::timeout(deadline, futures_util::future::join_all(tasks)).await {
            Ok(results) => {
                for (session_id, result) in ids.into_iter().zip(results) {
                    if let Err(e) = result {
                        if e.is_panic() {
                            self.metrics.record_panic(ActorType::Session);
                        }
                        release_abandoned(&self.registries, session_id).await;
                    }
                }
                info!(
                    target: "rc.actor.coordinator",
                    sessions_closed = total,
                    "Graceful shutdown complete"
                );
            }
            Err(_) => {
                warn!(
                    target: "rc.actor.coordinator",
                    sessions = total,
                    "Session shutdown exceeded deadline"
                );
            }
        }
    }

    async fn check_session_health(&mut self) {
        let finished: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(session_id, _)| *session_id)
            .collect();

        for session_id in finished {
            let Some(managed) = self.sessions.remove(&session_id) else {
                continue;
            };

            match managed.task_handle.await {
                Ok(()) => {
                    debug!(
                        target: "rc.actor.coordinator",
                        session_id = %session_id,
                        "Session actor exited"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "rc.actor.coordinator",
                            session_id = %session_id,
                            error = ?join_error,
                            "Session actor panicked"
                        );
                        self.metrics.record_panic(ActorType::Session);
                    }
                    release_abandoned(&self.registries, session_id).await;
                }
            }

            self.metrics.session_closed();
        }
    }
}

/// Release what a session owned when its actor died before cleanup.
async fn release_abandoned(registries: &Registries, session_id: SessionId) {
    registries.bus.unsubscribe(session_id).await;
    registries.endpoints.release_session(session_id).await;
    registries.transports.release_session(session_id).await;
}
