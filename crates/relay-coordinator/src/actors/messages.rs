//! Message types exchanged with the coordinator actors.

use super::session::SessionHandle;
use crate::bus::Notification;
use crate::errors::CoordinatorError;
use crate::registry::ConsumerDescriptor;
use crate::relay::{DtlsParameters, RtpCapabilities, RtpParameters, TransportParams};
use crate::types::{Direction, MediaKind, ProducerId, SessionId};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// A signaling request from one client, already decoded.
#[derive(Debug, Clone)]
pub enum SessionRequest {
    GetRouterRtpCapabilities,
    CreateTransport {
        direction: Direction,
    },
    ConnectTransport {
        direction: Direction,
        dtls_parameters: DtlsParameters,
    },
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    Consume {
        /// Must match the active producer when present.
        producer_id: Option<ProducerId>,
        rtp_capabilities: RtpCapabilities,
    },
    Resume,
}

impl SessionRequest {
    /// Wire method name, used for logs and metrics.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            SessionRequest::GetRouterRtpCapabilities => "getRouterRtpCapabilities",
            SessionRequest::CreateTransport {
                direction: Direction::Producing,
            } => "createProducerTransport",
            SessionRequest::CreateTransport {
                direction: Direction::Consuming,
            } => "createConsumerTransport",
            SessionRequest::ConnectTransport {
                direction: Direction::Producing,
                ..
            } => "connectProducerTransport",
            SessionRequest::ConnectTransport {
                direction: Direction::Consuming,
                ..
            } => "connectConsumerTransport",
            SessionRequest::Produce { .. } => "produce",
            SessionRequest::Consume { .. } => "consume",
            SessionRequest::Resume => "resume",
        }
    }
}

/// Successful outcome of a [`SessionRequest`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SessionReply {
    Capabilities(RtpCapabilities),
    Transport(TransportParams),
    /// Serializes as `null`.
    Ack,
    Produced { id: ProducerId },
    Consumed(ConsumerDescriptor),
}

pub type SessionResult = Result<SessionReply, CoordinatorError>;

/// Messages handled by a `SessionActor`.
#[derive(Debug)]
pub enum SessionMessage {
    Request {
        request: SessionRequest,
        respond_to: oneshot::Sender<SessionResult>,
    },
    GetState {
        respond_to: oneshot::Sender<SessionSnapshot>,
    },
}

/// Producer branch of the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ProducerPhase {
    Connected,
    CapabilitiesFetched,
    TransportReady,
    TransportConnected,
    Producing,
}

/// Consumer branch of the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ConsumerPhase {
    Connected,
    CapabilitiesFetched,
    TransportReady,
    TransportConnected,
    ConsumerCreated,
    ConsumerResumed,
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub producer_phase: ProducerPhase,
    pub consumer_phase: ConsumerPhase,
    pub requests_handled: u64,
    /// Unix timestamp (seconds) of the connection.
    pub connected_at: i64,
}

/// Messages handled by the coordinator actor.
#[derive(Debug)]
pub enum CoordinatorMessage {
    Connect {
        client_sink: mpsc::Sender<Notification>,
        respond_to: oneshot::Sender<Result<SessionHandle, CoordinatorError>>,
    },
    /// Remove a session. Responds once its cleanup has finished.
    Disconnect {
        session_id: SessionId,
        respond_to: oneshot::Sender<bool>,
    },
    GetStatus {
        respond_to: oneshot::Sender<CoordinatorStatus>,
    },
    /// Refuse new sessions from now on.
    StopAccepting {
        reason: String,
    },
    Shutdown {
        deadline: Duration,
        respond_to: oneshot::Sender<()>,
    },
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorStatus {
    pub session_count: usize,
    pub producer_active: bool,
    pub consumer_count: usize,
    pub accepting: bool,
    /// Messages sent to the coordinator and not yet handled, this status
    /// request included.
    pub mailbox_depth: usize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_method_names() {
        assert_eq!(
            SessionRequest::GetRouterRtpCapabilities.method(),
            "getRouterRtpCapabilities"
        );
        assert_eq!(
            SessionRequest::CreateTransport {
                direction: Direction::Consuming
            }
            .method(),
            "createConsumerTransport"
        );
        assert_eq!(
            SessionRequest::ConnectTransport {
                direction: Direction::Producing,
                dtls_parameters: json!({}),
            }
            .method(),
            "connectProducerTransport"
        );
        assert_eq!(SessionRequest::Resume.method(), "resume");
    }

    #[test]
    fn test_reply_serialization() {
        assert_eq!(serde_json::to_value(SessionReply::Ack).unwrap(), json!(null));
        assert_eq!(
            serde_json::to_value(SessionReply::Produced {
                id: ProducerId("p-1".to_string())
            })
            .unwrap(),
            json!({ "id": "p-1" })
        );
    }

    #[test]
    fn test_phases_are_ordered() {
        assert!(ProducerPhase::Connected < ProducerPhase::TransportReady);
        assert!(ProducerPhase::TransportConnected < ProducerPhase::Producing);
        assert!(ConsumerPhase::TransportConnected < ConsumerPhase::ConsumerCreated);
        assert!(ConsumerPhase::ConsumerCreated < ConsumerPhase::ConsumerResumed);
    }
}
