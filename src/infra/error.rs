//! Error types for quote-relay infrastructure

use thiserror::Error;

use crate::domain::{
    DocumentId, SchemaValidationError, TokenId, TokenNamespace, TokenState, TokenStateMismatch,
};

/// Errors that can occur in the relay infrastructure
#[derive(Error, Debug)]
pub enum RelayError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Token not found
    #[error("token not found: {document_id}/{namespace}/{token_id}")]
    TokenNotFound {
        document_id: DocumentId,
        namespace: TokenNamespace,
        token_id: TokenId,
    },

    /// Token write not permitted by the state machine
    #[error("invalid state transition for token {token_id}: {from} -> {to}")]
    InvalidStateTransition {
        token_id: TokenId,
        from: String,
        to: TokenState,
    },

    /// Token read back in an unexpected state
    #[error(transparent)]
    UnexpectedTokenState(#[from] TokenStateMismatch),

    /// Encoded event does not conform to its schema
    #[error("schema validation failed: {}", format_violations(.errors))]
    SchemaViolation { errors: Vec<SchemaValidationError> },

    /// Schema definition could not be compiled
    #[error("invalid event schema: {0}")]
    InvalidSchema(String),

    /// Delta kind has no external event type
    #[error("unknown delta kind: {0}")]
    UnknownDeltaKind(String),

    /// Binary encoder failure
    #[error("encoding error: {0}")]
    Encoding(String),

    /// JSON (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No publishing channel is available
    #[error("broker unavailable: no open channel")]
    BrokerUnavailable,

    /// Broker client error
    #[error("broker error: {0}")]
    Broker(String),

    /// Reconnection attempts exhausted; publishing cannot make progress
    #[error("could not re-establish broker connection after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Document is flagged as failed and skipped by the publisher
    #[error("document {0} is flagged with a publish error")]
    DocumentFlagged(DocumentId),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Broker and database availability problems are transient; schema and
    /// state machine violations are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::Database(_) | RelayError::BrokerUnavailable | RelayError::Broker(_)
        )
    }
}

fn format_violations(errors: &[SchemaValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
