//! Engine error kinds and their HTTP classification

use axum::http::StatusCode;

use crate::client::ClientError;
use crate::jid::JidParseError;
use crate::storage::StorageError;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Credential store could not be opened
    #[error("failed to open credential store: {0}")]
    Open(#[source] StorageError),

    #[error("credential store error: {0}")]
    Store(#[from] StorageError),

    #[error("AlreadyConnected")]
    AlreadyConnected,

    #[error("AlreadyConnecting")]
    AlreadyConnecting,

    #[error("InvalidRecipient")]
    InvalidRecipient(#[from] JidParseError),

    #[error("NotConnected")]
    NotConnected,

    #[error("NotFound")]
    NotFound,

    /// Library refused or failed to deliver an outbound message
    #[error("{0}")]
    Send(#[source] ClientError),

    /// Library failed outside of a send (connect, QR channel)
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("webhook delivery failed: {0}")]
    Webhook(#[from] reqwest::Error),

    #[error("invalid payload: {0}")]
    Payload(String),
}

impl EngineError {
    /// HTTP status for a control API reply carrying this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::AlreadyConnected
            | EngineError::AlreadyConnecting
            | EngineError::InvalidRecipient(_)
            | EngineError::NotConnected
            | EngineError::Payload(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound => StatusCode::NOT_FOUND,
            EngineError::Open(_)
            | EngineError::Store(_)
            | EngineError::Send(_)
            | EngineError::Client(_)
            | EngineError::Webhook(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Payload(e.to_string())
    }
}
