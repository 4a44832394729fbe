//! Relay coordinator error types.
//!
//! Every error maps to a stable wire `code()` that clients can branch on.
//! Relay internals are logged server-side but not exposed to clients.

use crate::types::Direction;
use thiserror::Error;

/// Coordinator error type returned to the originating session.
///
/// Wire codes:
/// - `NotReady`, `RelayUnavailable`: dependency problems
/// - `UnknownTransport`, `TransportAlreadyConnected`, `TransportNotReady`,
///   `NoActiveProducer`, `NoActiveConsumer`: protocol-order violations
/// - `IncompatibleCapabilities`: negotiation mismatch
/// - `ConsumeFailed`, `ProducerReplaced`: consume outcome
/// - `InvalidRequest`, `ShuttingDown`, `Internal`
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The relay router has not been created yet.
    #[error("Relay router not ready")]
    NotReady,

    /// A relay engine call failed or timed out.
    #[error("Relay unavailable: {0}")]
    RelayUnavailable(String),

    /// No transport of this direction exists for the session.
    #[error("Unknown {0} transport")]
    UnknownTransport(Direction),

    /// The transport already received its DTLS parameters.
    #[error("The {0} transport is already connected")]
    TransportAlreadyConnected(Direction),

    /// The transport is missing or not yet connected.
    #[error("The {0} transport is not ready")]
    TransportNotReady(Direction),

    /// No producer is registered.
    #[error("No active producer")]
    NoActiveProducer,

    /// The session has no consumer.
    #[error("No active consumer")]
    NoActiveConsumer,

    /// The remote capabilities cannot consume the producer.
    #[error("Incompatible RTP capabilities")]
    IncompatibleCapabilities,

    /// The relay engine rejected the consume call.
    #[error("Consume failed: {0}")]
    ConsumeFailed(String),

    /// The producer was replaced while the consume call was outstanding.
    #[error("Producer replaced during consume")]
    ProducerReplaced,

    /// Malformed or unknown request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The coordinator no longer accepts sessions.
    #[error("Coordinator is shutting down")]
    ShuttingDown,

    /// Internal error (actor channel failures).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Returns the wire error code for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            CoordinatorError::NotReady => "NotReady",
            CoordinatorError::RelayUnavailable(_) => "RelayUnavailable",
            CoordinatorError::UnknownTransport(_) => "UnknownTransport",
            CoordinatorError::TransportAlreadyConnected(_) => "TransportAlreadyConnected",
            CoordinatorError::TransportNotReady(_) => "TransportNotReady",
            CoordinatorError::NoActiveProducer => "NoActiveProducer",
            CoordinatorError::NoActiveConsumer => "NoActiveConsumer",
            CoordinatorError::IncompatibleCapabilities => "IncompatibleCapabilities",
            CoordinatorError::ConsumeFailed(_) => "ConsumeFailed",
            CoordinatorError::ProducerReplaced => "ProducerReplaced",
            CoordinatorError::InvalidRequest(_) => "InvalidRequest",
            CoordinatorError::ShuttingDown => "ShuttingDown",
            CoordinatorError::Internal(_) => "Internal",
        }
    }

    /// Returns a client-safe error message (no relay internals).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            CoordinatorError::RelayUnavailable(_) => {
                "The media relay is unavailable, please retry".to_string()
            }
            CoordinatorError::ConsumeFailed(_) => "The media relay could not consume".to_string(),
            CoordinatorError::Internal(_) => "An internal error occurred".to_string(),
            CoordinatorError::InvalidRequest(reason) => format!("Invalid request: {reason}"),
            other => other.to_string(),
        }
    }

    /// Whether the error is a protocol-order violation by the client.
    #[must_use]
    pub const fn is_order_violation(&self) -> bool {
        matches!(
            self,
            CoordinatorError::UnknownTransport(_)
                | CoordinatorError::TransportAlreadyConnected(_)
                | CoordinatorError::TransportNotReady(_)
                | CoordinatorError::NoActiveProducer
                | CoordinatorError::NoActiveConsumer
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(CoordinatorError::NotReady.code(), "NotReady");
        assert_eq!(
            CoordinatorError::UnknownTransport(Direction::Producing).code(),
            "UnknownTransport"
        );
        assert_eq!(
            CoordinatorError::TransportNotReady(Direction::Consuming).code(),
            "TransportNotReady"
        );
        assert_eq!(CoordinatorError::NoActiveProducer.code(), "NoActiveProducer");
        assert_eq!(CoordinatorError::NoActiveConsumer.code(), "NoActiveConsumer");
        assert_eq!(
            CoordinatorError::IncompatibleCapabilities.code(),
            "IncompatibleCapabilities"
        );
        assert_eq!(
            CoordinatorError::ConsumeFailed("boom".to_string()).code(),
            "ConsumeFailed"
        );
    }

    #[test]
    fn test_client_messages_hide_relay_details() {
        let err = CoordinatorError::RelayUnavailable("worker pid 4242 EPIPE".to_string());
        assert!(!err.client_message().contains("4242"));

        let err = CoordinatorError::ConsumeFailed("rtpParameters mismatch at ssrc".to_string());
        assert!(!err.client_message().contains("ssrc"));

        let err = CoordinatorError::Internal("channel send failed".to_string());
        assert_eq!(err.client_message(), "An internal error occurred");
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            CoordinatorError::UnknownTransport(Direction::Producing).to_string(),
            "Unknown producing transport"
        );
        assert_eq!(
            CoordinatorError::TransportAlreadyConnected(Direction::Consuming).to_string(),
            "The consuming transport is already connected"
        );
    }

    #[test]
    fn test_order_violations() {
        assert!(CoordinatorError::NoActiveProducer.is_order_violation());
        assert!(CoordinatorError::UnknownTransport(Direction::Consuming).is_order_violation());
        assert!(!CoordinatorError::IncompatibleCapabilities.is_order_violation());
        assert!(!CoordinatorError::NotReady.is_order_violation());
    }
}
