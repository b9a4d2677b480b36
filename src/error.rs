//! Error types
//!
//! Per-request errors are reported to the requesting peer as structured error
//! responses and never end the session. Only configuration failures and a
//! dead engine worker are fatal to the process.

use serde::Serialize;

use crate::engine::{EngineError, MediaKind, ProducerId, TransportId};

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Message arrived out of the allowed sequence
    InvalidState,
    /// Unknown transport, producer or consumer
    NotFound,
    /// Capability mismatch between consumer and producer
    Incompatible,
    /// The media engine rejected the call, timed out, or is gone
    EngineFailure,
    /// Process cannot serve with the given configuration
    ConfigurationFailure,
    /// Undecodable frame or unknown method
    BadRequest,
}

/// Transport direction relative to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client → server media (producing)
    Send,
    /// Server → client media (consuming)
    Recv,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Recv => f.write_str("recv"),
        }
    }
}

/// Error type for signaling operations
#[derive(Debug)]
pub enum Error {
    /// `produce` without a send transport
    NoSendTransport,
    /// `consume` without a receive transport
    NoReceiveTransport,
    /// The transport has not completed its DTLS connect
    TransportNotConnected(TransportId),
    /// The transport failed or was closed by the engine
    TransportUnusable(TransportId),
    /// `connect` issued twice for one transport
    AlreadyConnected(TransportId),
    /// Another produce/consume is already negotiating on this transport
    NegotiationInFlight(TransportId),
    /// Another session already publishes this kind
    KindAlreadyPublished(MediaKind),
    /// No transport with this id in the session
    UnknownTransport {
        direction: Direction,
        id: TransportId,
    },
    /// No producer to consume
    NoProducer(Option<ProducerId>),
    /// `resume` without any consumer
    NoConsumer,
    /// Consumer capabilities cannot receive the producer
    Incompatible(ProducerId),
    /// Media engine failure
    Engine(EngineError),
    /// Invalid configuration or engine start-up failure
    Config(String),
    /// Malformed request frame or unknown method
    BadRequest(String),
    /// Socket I/O error
    Io(std::io::Error),
    /// WebSocket protocol error
    WebSocket(tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Wire classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoSendTransport
            | Error::NoReceiveTransport
            | Error::TransportNotConnected(_)
            | Error::TransportUnusable(_)
            | Error::AlreadyConnected(_)
            | Error::NegotiationInFlight(_)
            | Error::KindAlreadyPublished(_) => ErrorKind::InvalidState,
            Error::UnknownTransport { .. } | Error::NoProducer(_) | Error::NoConsumer => {
                ErrorKind::NotFound
            }
            Error::Incompatible(_) => ErrorKind::Incompatible,
            Error::Engine(_) => ErrorKind::EngineFailure,
            Error::Config(_) => ErrorKind::ConfigurationFailure,
            Error::BadRequest(_) => ErrorKind::BadRequest,
            Error::Io(_) | Error::WebSocket(_) => ErrorKind::EngineFailure,
        }
    }

    /// Whether the process must stop
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::Engine(EngineError::WorkerDied)
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NoSendTransport => write!(f, "No send transport; call createProducerTransport first"),
            Error::NoReceiveTransport => {
                write!(f, "No receive transport; call createConsumerTransport first")
            }
            Error::TransportNotConnected(id) => write!(f, "Transport not connected: {}", id),
            Error::TransportUnusable(id) => write!(f, "Transport failed or closed: {}", id),
            Error::AlreadyConnected(id) => write!(f, "Transport already connected: {}", id),
            Error::NegotiationInFlight(id) => {
                write!(f, "Another negotiation is in flight on transport {}", id)
            }
            Error::KindAlreadyPublished(kind) => {
                write!(f, "A {} producer is already live in this room", kind)
            }
            Error::UnknownTransport { direction, id } => {
                write!(f, "Unknown {} transport: {}", direction, id)
            }
            Error::NoProducer(Some(id)) => write!(f, "Producer not found: {}", id),
            Error::NoProducer(None) => write!(f, "No producer available"),
            Error::NoConsumer => write!(f, "No consumer to resume"),
            Error::Incompatible(id) => write!(f, "Cannot consume producer {}", id),
            Error::Engine(e) => write!(f, "Media engine error: {}", e),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::WebSocket(e) => write!(f, "WebSocket error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Engine(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::WebSocket(e) => Some(e),
            _ => None,
        }
    }
}

impl From<EngineError> for Error {
    fn from(e: EngineError) -> Self {
        Error::Engine(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::BadRequest(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::NoSendTransport.kind(), ErrorKind::InvalidState);
        assert_eq!(
            Error::AlreadyConnected(TransportId::from("t")).kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(Error::NoConsumer.kind(), ErrorKind::NotFound);
        assert_eq!(
            Error::Incompatible(ProducerId::from("p")).kind(),
            ErrorKind::Incompatible
        );
        assert_eq!(
            Error::Engine(EngineError::rejected("port exhaustion")).kind(),
            ErrorKind::EngineFailure
        );
    }

    #[test]
    fn test_engine_message_is_relayed_verbatim() {
        let err = Error::from(EngineError::rejected("no more ports"));
        assert!(err.to_string().ends_with("no more ports"));
    }

    #[test]
    fn test_fatal_errors() {
        assert!(Error::Config("no listen ip".into()).is_fatal());
        assert!(Error::Engine(EngineError::WorkerDied).is_fatal());
        assert!(!Error::NoConsumer.is_fatal());
    }

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(
            serde_json::to_value(ErrorKind::InvalidState).unwrap(),
            "invalidState"
        );
        assert_eq!(
            serde_json::to_value(ErrorKind::ConfigurationFailure).unwrap(),
            "configurationFailure"
        );
    }
}
