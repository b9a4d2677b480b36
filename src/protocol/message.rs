//! Signaling messages
//!
//! Frames are JSON text messages. Requests carry a client-chosen numeric id
//! that the matching response echoes back; events are unsolicited.
//!
//! ```text
//! client → server   {"id": 3, "method": "produce", "data": {...}}
//! server → client   {"type": "response", "id": 3, "data": {"id": "..."}}
//! server → client   {"type": "response", "id": 3, "error": {"kind": "invalidState", "message": "..."}}
//! server → client   {"type": "event", "event": "newProducer", "data": {...}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::methods;
use crate::engine::{
    ConsumerId, ConsumerType, DtlsParameters, MediaKind, ProducerId, RtpCapabilities,
    RtpParameters, TransportId,
};
use crate::error::{Error, ErrorKind};

/// Payload of `createProducerTransport` / `createConsumerTransport`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateTransportParams {
    /// Only offer TCP candidates
    pub force_tcp: bool,
    /// Device capabilities, sent by publishers
    pub rtp_capabilities: Option<RtpCapabilities>,
}

/// Payload of `connectProducerTransport` / `connectConsumerTransport`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportParams {
    #[serde(default)]
    pub transport_id: Option<TransportId>,
    pub dtls_parameters: DtlsParameters,
}

/// Payload of `produce`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceParams {
    #[serde(default)]
    pub transport_id: Option<TransportId>,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Payload of `consume`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeParams {
    pub rtp_capabilities: RtpCapabilities,
    /// Consume this producer instead of the room's current one
    #[serde(default)]
    pub producer_id: Option<ProducerId>,
    /// Consume the room's current producer of this kind
    #[serde(default)]
    pub kind: Option<MediaKind>,
}

/// Payload of `resume`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResumeParams {
    /// Resume only this consumer; all paused consumers otherwise
    pub consumer_id: Option<ConsumerId>,
}

/// A decoded client request
#[derive(Debug, Clone)]
pub enum Request {
    GetRouterRtpCapabilities,
    CreateProducerTransport(CreateTransportParams),
    CreateConsumerTransport(CreateTransportParams),
    ConnectProducerTransport(ConnectTransportParams),
    ConnectConsumerTransport(ConnectTransportParams),
    Produce(ProduceParams),
    Consume(ConsumeParams),
    Resume(ResumeParams),
}

impl Request {
    /// Decode the payload of `method`
    pub fn parse(method: &str, data: Value) -> Result<Self, Error> {
        // Requests without a payload arrive with `data` absent or null
        let data = if data.is_null() {
            Value::Object(Default::default())
        } else {
            data
        };

        let request = match method {
            methods::GET_ROUTER_RTP_CAPABILITIES => Request::GetRouterRtpCapabilities,
            methods::CREATE_PRODUCER_TRANSPORT => {
                Request::CreateProducerTransport(serde_json::from_value(data)?)
            }
            methods::CREATE_CONSUMER_TRANSPORT => {
                Request::CreateConsumerTransport(serde_json::from_value(data)?)
            }
            methods::CONNECT_PRODUCER_TRANSPORT => {
                Request::ConnectProducerTransport(serde_json::from_value(data)?)
            }
            methods::CONNECT_CONSUMER_TRANSPORT => {
                Request::ConnectConsumerTransport(serde_json::from_value(data)?)
            }
            methods::PRODUCE => Request::Produce(serde_json::from_value(data)?),
            methods::CONSUME => Request::Consume(serde_json::from_value(data)?),
            methods::RESUME => Request::Resume(serde_json::from_value(data)?),
            other => return Err(Error::BadRequest(format!("Unknown method: {}", other))),
        };

        Ok(request)
    }

    /// Wire name of the request
    pub fn method(&self) -> &'static str {
        match self {
            Request::GetRouterRtpCapabilities => methods::GET_ROUTER_RTP_CAPABILITIES,
            Request::CreateProducerTransport(_) => methods::CREATE_PRODUCER_TRANSPORT,
            Request::CreateConsumerTransport(_) => methods::CREATE_CONSUMER_TRANSPORT,
            Request::ConnectProducerTransport(_) => methods::CONNECT_PRODUCER_TRANSPORT,
            Request::ConnectConsumerTransport(_) => methods::CONNECT_CONSUMER_TRANSPORT,
            Request::Produce(_) => methods::PRODUCE,
            Request::Consume(_) => methods::CONSUME,
            Request::Resume(_) => methods::RESUME,
        }
    }
}

/// Decode a request frame
///
/// On failure returns the request id (0 if none could be read) alongside the
/// error, so the peer still gets a correlated error response.
pub fn decode_request(text: &str) -> Result<(u64, Request), (u64, Error)> {
    let frame: Value = serde_json::from_str(text).map_err(|e| (0, Error::from(e)))?;

    let id = frame.get("id").and_then(Value::as_u64).unwrap_or(0);
    let method = frame
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| (id, Error::BadRequest("missing method".into())))?;
    let data = frame.get("data").cloned().unwrap_or(Value::Null);

    Request::parse(method, data)
        .map(|request| (id, request))
        .map_err(|e| (id, e))
}

/// Response to `produce`
#[derive(Debug, Clone, Serialize)]
pub struct ProduceResponse {
    pub id: ProducerId,
}

/// Response to `consume`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescriptor {
    pub producer_id: ProducerId,
    pub id: ConsumerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(rename = "type")]
    pub consumer_type: ConsumerType,
    pub producer_paused: bool,
}

/// Error payload of a failed request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for ErrorBody {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Unsolicited server → client notification
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A producer went live; subscribers may enable their subscribe affordance
    NewProducer {
        producer_id: ProducerId,
        kind: MediaKind,
    },
    /// A producer went away; consumers bound to it were closed
    ProducerClosed {
        producer_id: ProducerId,
        kind: MediaKind,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::NewProducer { .. } => methods::NEW_PRODUCER,
            ServerEvent::ProducerClosed { .. } => methods::PRODUCER_CLOSED,
        }
    }
}

/// A frame sent to the client
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Response {
        id: u64,
        outcome: Result<Value, ErrorBody>,
    },
    Event(ServerEvent),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProducerEventData<'a> {
    producer_id: &'a ProducerId,
    kind: MediaKind,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Wire<'a> {
    Response {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<&'a Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<&'a ErrorBody>,
    },
    Event {
        event: &'static str,
        data: ProducerEventData<'a>,
    },
}

impl ServerMessage {
    pub fn ok(id: u64, data: Value) -> Self {
        ServerMessage::Response {
            id,
            outcome: Ok(data),
        }
    }

    pub fn error(id: u64, error: &Error) -> Self {
        ServerMessage::Response {
            id,
            outcome: Err(ErrorBody::from(error)),
        }
    }

    /// Encode as a JSON text frame
    pub fn to_json(&self) -> serde_json::Result<String> {
        let wire = match self {
            ServerMessage::Response { id, outcome } => Wire::Response {
                id: *id,
                data: outcome.as_ref().ok(),
                error: outcome.as_ref().err(),
            },
            ServerMessage::Event(event) => {
                let (producer_id, kind) = match event {
                    ServerEvent::NewProducer { producer_id, kind }
                    | ServerEvent::ProducerClosed { producer_id, kind } => (producer_id, *kind),
                };
                Wire::Event {
                    event: event.name(),
                    data: ProducerEventData { producer_id, kind },
                }
            }
        };
        serde_json::to_string(&wire)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_decode_payloadless_request() {
        let (id, request) =
            decode_request(r#"{"id": 1, "method": "getRouterRtpCapabilities"}"#).unwrap();
        assert_eq!(id, 1);
        assert!(matches!(request, Request::GetRouterRtpCapabilities));

        let (_, request) = decode_request(r#"{"id": 2, "method": "resume", "data": null}"#).unwrap();
        assert!(matches!(request, Request::Resume(ResumeParams { consumer_id: None })));
    }

    #[test]
    fn test_decode_produce() {
        let text = json!({
            "id": 7,
            "method": "produce",
            "data": {
                "transportId": "t-1",
                "kind": "video",
                "rtpParameters": {"codecs": [], "encodings": [{"ssrc": 1111}]}
            }
        })
        .to_string();

        let (id, request) = decode_request(&text).unwrap();
        assert_eq!(id, 7);
        match request {
            Request::Produce(params) => {
                assert_eq!(params.transport_id, Some(TransportId::from("t-1")));
                assert_eq!(params.kind, MediaKind::Video);
                assert_eq!(params.rtp_parameters.as_value()["encodings"][0]["ssrc"], 1111);
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_decode_create_transport_defaults() {
        let (_, request) =
            decode_request(r#"{"id": 3, "method": "createConsumerTransport", "data": {"forceTcp": true}}"#)
                .unwrap();
        match request {
            Request::CreateConsumerTransport(params) => {
                assert!(params.force_tcp);
                assert!(params.rtp_capabilities.is_none());
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_decode_errors_keep_request_id() {
        let (id, err) = decode_request(r#"{"id": 9, "method": "fly"}"#).unwrap_err();
        assert_eq!(id, 9);
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        let (id, err) =
            decode_request(r#"{"id": 4, "method": "connectProducerTransport", "data": {}}"#)
                .unwrap_err();
        assert_eq!(id, 4);
        assert!(err.to_string().contains("dtlsParameters"));

        let (id, _) = decode_request("not json").unwrap_err();
        assert_eq!(id, 0);
    }

    #[test]
    fn test_encode_ack_and_error() {
        let ack = ServerMessage::ok(5, Value::Null).to_json().unwrap();
        let ack: Value = serde_json::from_str(&ack).unwrap();
        assert_eq!(ack, json!({"type": "response", "id": 5, "data": null}));

        let err = ServerMessage::error(6, &Error::NoSendTransport).to_json().unwrap();
        let err: Value = serde_json::from_str(&err).unwrap();
        assert_eq!(err["type"], "response");
        assert_eq!(err["id"], 6);
        assert_eq!(err["error"]["kind"], "invalidState");
        assert!(err.get("data").is_none());
    }

    #[test]
    fn test_encode_event() {
        let event = ServerMessage::Event(ServerEvent::NewProducer {
            producer_id: ProducerId::from("p-1"),
            kind: MediaKind::Video,
        });
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "event", "event": "newProducer", "data": {"producerId": "p-1", "kind": "video"}})
        );
    }

    #[test]
    fn test_consumer_descriptor_field_names() {
        let descriptor = ConsumerDescriptor {
            producer_id: ProducerId::from("p"),
            id: ConsumerId::from("c"),
            kind: MediaKind::Video,
            rtp_parameters: RtpParameters(json!({})),
            consumer_type: ConsumerType::Simulcast,
            producer_paused: false,
        };
        let value = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(value["producerId"], "p");
        assert_eq!(value["type"], "simulcast");
        assert_eq!(value["producerPaused"], false);
    }
}
