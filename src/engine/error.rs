//! Media engine error types

use std::time::Duration;

/// Error raised by a media engine call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine rejected the request (message is relayed to the client)
    Rejected(String),
    /// The engine did not answer within the configured bound
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    /// The target object was already closed on the engine side
    Closed,
    /// The engine worker is gone
    WorkerDied,
}

impl EngineError {
    pub fn rejected(message: impl Into<String>) -> Self {
        EngineError::Rejected(message.into())
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Rejected(msg) => write!(f, "{}", msg),
            EngineError::Timeout { operation, after } => {
                write!(f, "{} timed out after {}ms", operation, after.as_millis())
            }
            EngineError::Closed => write!(f, "Engine object already closed"),
            EngineError::WorkerDied => write!(f, "Media engine worker died"),
        }
    }
}

impl std::error::Error for EngineError {}
