//! JSON wire frames of the signaling protocol.
//!
//! Client → server: `{"id": 1, "method": "produce", "data": {...}}`
//!
//! Server → client:
//! - `{"type": "response", "id": 1, "ok": true, "data": ...}`
//! - `{"type": "response", "id": 1, "ok": false, "error": {"code": ..., "message": ...}}`
//! - `{"type": "notification", "method": "newProducer", "data": {...}}`

use crate::actors::{SessionReply, SessionRequest, SessionResult};
use crate::bus::Notification;
use crate::errors::CoordinatorError;
use crate::relay::{DtlsParameters, RtpCapabilities, RtpParameters};
use crate::types::{Direction, MediaKind, ProducerId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A request frame as sent by the client.
#[derive(Debug, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectTransportData {
    dtls_parameters: DtlsParameters,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProduceData {
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumeData {
    #[serde(default)]
    producer_id: Option<ProducerId>,
    rtp_capabilities: RtpCapabilities,
}

impl RequestFrame {
    /// Decode the method and payload.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for unknown methods and malformed payloads.
    pub fn into_request(self) -> Result<SessionRequest, CoordinatorError> {
        let method = self.method.as_str();
        match method {
            "getRouterRtpCapabilities" => Ok(SessionRequest::GetRouterRtpCapabilities),
            "createProducerTransport" => Ok(SessionRequest::CreateTransport {
                direction: Direction::Producing,
            }),
            "createConsumerTransport" => Ok(SessionRequest::CreateTransport {
                direction: Direction::Consuming,
            }),
            "connectProducerTransport" | "connectConsumerTransport" => {
                let direction = if method == "connectProducerTransport" {
                    Direction::Producing
                } else {
                    Direction::Consuming
                };
                let data: ConnectTransportData = payload(method, self.data)?;
                Ok(SessionRequest::ConnectTransport {
                    direction,
                    dtls_parameters: data.dtls_parameters,
                })
            }
            "produce" => {
                let data: ProduceData = payload(method, self.data)?;
                Ok(SessionRequest::Produce {
                    kind: data.kind,
                    rtp_parameters: data.rtp_parameters,
                })
            }
            "consume" => {
                let data: ConsumeData = payload(method, self.data)?;
                Ok(SessionRequest::Consume {
                    producer_id: data.producer_id,
                    rtp_capabilities: data.rtp_capabilities,
                })
            }
            "resume" => Ok(SessionRequest::Resume),
            other => Err(CoordinatorError::InvalidRequest(format!(
                "unknown method: {other}"
            ))),
        }
    }
}

fn payload<T: DeserializeOwned>(method: &str, data: Value) -> Result<T, CoordinatorError> {
    serde_json::from_value(data)
        .map_err(|e| CoordinatorError::InvalidRequest(format!("{method}: {e}")))
}

/// Why an inbound text frame could not become a request.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// No usable request id, so nothing can be answered.
    #[error("unidentified frame: {0}")]
    Unidentified(String),

    /// The frame has an id but is otherwise invalid.
    #[error("invalid request {id}: {error}")]
    Invalid { id: u64, error: CoordinatorError },
}

/// Decode one inbound text frame.
///
/// # Errors
///
/// `Unidentified` if the frame is not JSON or has no numeric `id`,
/// `Invalid` if it has an id but the rest does not decode.
pub fn decode_request(text: &str) -> Result<(u64, SessionRequest), DecodeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Unidentified(e.to_string()))?;
    let id = value
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| DecodeError::Unidentified("missing numeric id".to_string()))?;

    let frame: RequestFrame = serde_json::from_value(value).map_err(|e| DecodeError::Invalid {
        id,
        error: CoordinatorError::InvalidRequest(e.to_string()),
    })?;
    let request = frame
        .into_request()
        .map_err(|error| DecodeError::Invalid { id, error })?;
    Ok((id, request))
}

/// Error body of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// A frame sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Response {
        id: u64,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    Notification {
        method: &'static str,
        data: Value,
    },
}

impl ServerFrame {
    /// Response frame for a request result.
    #[must_use]
    pub fn response(id: u64, result: SessionResult) -> Self {
        match result.and_then(reply_data) {
            Ok(data) => ServerFrame::Response {
                id,
                ok: true,
                data: Some(data),
                error: None,
            },
            Err(e) => Self::error(id, &e),
        }
    }

    #[must_use]
    pub fn error(id: u64, error: &CoordinatorError) -> Self {
        ServerFrame::Response {
            id,
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code: error.code(),
                message: error.client_message(),
            }),
        }
    }

    #[must_use]
    pub fn notification(notification: &Notification) -> Self {
        ServerFrame::Notification {
            method: notification.method(),
            data: notification.data(),
        }
    }
}

fn reply_data(reply: SessionReply) -> Result<Value, CoordinatorError> {
    serde_json::to_value(reply)
        .map_err(|e| CoordinatorError::Internal(format!("reply serialization failed: {e}")))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::types::ConsumerId;
    use serde_json::json;

    #[test]
    fn test_decode_methods_without_data() {
        let (id, request) = decode_request(r#"{"id":7,"method":"getRouterRtpCapabilities"}"#).unwrap();
        assert_eq!(id, 7);
        assert!(matches!(request, SessionRequest::GetRouterRtpCapabilities));

        let (_, request) = decode_request(r#"{"id":8,"method":"createConsumerTransport"}"#).unwrap();
        assert!(matches!(
            request,
            SessionRequest::CreateTransport {
                direction: Direction::Consuming
            }
        ));

        let (_, request) = decode_request(r#"{"id":9,"method":"resume","data":{}}"#).unwrap();
        assert!(matches!(request, SessionRequest::Resume));
    }

    #[test]
    fn test_decode_connect_and_produce() {
        let text = json!({
            "id": 2,
            "method": "connectProducerTransport",
            "data": { "dtlsParameters": { "role": "client" } }
        })
        .to_string();
        let (_, request) = decode_request(&text).unwrap();
        match request {
            SessionRequest::ConnectTransport {
                direction,
                dtls_parameters,
            } => {
                assert_eq!(direction, Direction::Producing);
                assert_eq!(dtls_parameters, json!({ "role": "client" }));
            }
            other => panic!("unexpected request: {other:?}"),
        }

        let text = json!({
            "id": 3,
            "method": "produce",
            "data": { "kind": "audio", "rtpParameters": { "codecs": [] } }
        })
        .to_string();
        let (_, request) = decode_request(&text).unwrap();
        assert!(matches!(
            request,
            SessionRequest::Produce {
                kind: MediaKind::Audio,
                ..
            }
        ));
    }

    #[test]
    fn test_decode_consume_with_optional_producer() {
        let text = json!({
            "id": 4,
            "method": "consume",
            "data": { "rtpCapabilities": { "codecs": [] } }
        })
        .to_string();
        let (_, request) = decode_request(&text).unwrap();
        assert!(matches!(
            request,
            SessionRequest::Consume {
                producer_id: None,
                ..
            }
        ));

        let text = json!({
            "id": 5,
            "method": "consume",
            "data": { "producerId": "p-1", "rtpCapabilities": {} }
        })
        .to_string();
        let (_, request) = decode_request(&text).unwrap();
        match request {
            SessionRequest::Consume { producer_id, .. } => {
                assert_eq!(producer_id, Some(ProducerId("p-1".to_string())));
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_method_and_bad_payload_are_invalid() {
        match decode_request(r#"{"id":1,"method":"teleport"}"#) {
            Err(DecodeError::Invalid { id, error }) => {
                assert_eq!(id, 1);
                assert_eq!(error.code(), "InvalidRequest");
            }
            other => panic!("unexpected: {other:?}"),
        }

        // Missing required payload
        assert!(matches!(
            decode_request(r#"{"id":2,"method":"produce"}"#),
            Err(DecodeError::Invalid { id: 2, .. })
        ));
        assert!(matches!(
            decode_request(r#"{"id":3,"method":"produce","data":{"kind":"smell","rtpParameters":{}}}"#),
            Err(DecodeError::Invalid { id: 3, .. })
        ));
        // Method of the wrong type
        assert!(matches!(
            decode_request(r#"{"id":4,"method":12}"#),
            Err(DecodeError::Invalid { id: 4, .. })
        ));
    }

    #[test]
    fn test_unidentified_frames() {
        assert!(matches!(
            decode_request("not json"),
            Err(DecodeError::Unidentified(_))
        ));
        assert!(matches!(
            decode_request(r#"{"method":"resume"}"#),
            Err(DecodeError::Unidentified(_))
        ));
        assert!(matches!(
            decode_request(r#"{"id":"abc","method":"resume"}"#),
            Err(DecodeError::Unidentified(_))
        ));
    }

    #[test]
    fn test_response_frames() {
        let ack = serde_json::to_value(ServerFrame::response(1, Ok(SessionReply::Ack))).unwrap();
        assert_eq!(ack, json!({ "type": "response", "id": 1, "ok": true, "data": null }));

        let produced = serde_json::to_value(ServerFrame::response(
            2,
            Ok(SessionReply::Produced {
                id: ProducerId("p-9".to_string()),
            }),
        ))
        .unwrap();
        assert_eq!(produced["data"], json!({ "id": "p-9" }));

        let failed = serde_json::to_value(ServerFrame::response(
            3,
            Err(CoordinatorError::UnknownTransport(Direction::Producing)),
        ))
        .unwrap();
        assert_eq!(failed["ok"], json!(false));
        assert_eq!(failed["error"]["code"], json!("UnknownTransport"));
        assert!(failed.get("data").is_none());
    }

    #[test]
    fn test_relay_detail_is_not_sent_to_client() {
        let frame = ServerFrame::error(
            4,
            &CoordinatorError::RelayUnavailable("worker pipe broken at 0xdead".to_string()),
        );
        let text = serde_json::to_string(&frame).unwrap();
        assert!(text.contains("RelayUnavailable"));
        assert!(!text.contains("0xdead"));
    }

    #[test]
    fn test_notification_frame() {
        let frame = ServerFrame::notification(&Notification::ProducerClosed {
            producer_id: ProducerId("p-1".to_string()),
            consumer_id: ConsumerId("c-1".to_string()),
        });
        assert_eq!(
            serde_json::to_value(frame).unwrap(),
            json!({
                "type": "notification",
                "method": "producerClosed",
                "data": { "producerId": "p-1", "consumerId": "c-1" }
            })
        );
    }
}
