//! quote-relay library
//!
//! Request precedence tokens and durable delta publication for quote
//! documents.
//!
//! ## Modules
//!
//! - [`domain`] - Core domain types (documents, tokens, deltas, schemas)
//! - [`infra`] - Token store, guarded requests, broker, encoder, publisher
//! - [`config`] - Environment configuration
//! - [`daemon`] - Relay process bootstrap
//! - [`metrics`] - Observability and metrics
//! - [`telemetry`] - Logging and OpenTelemetry integration

pub mod config;
pub mod daemon;
pub mod domain;
pub mod infra;
pub mod metrics;
pub mod migrations;
pub mod telemetry;

// Re-export commonly used types
pub use domain::{
    AnyToken, DeltaKind, DocumentId, DocumentMeta, PendingDelta, Precedence, Token, TokenId,
    TokenNamespace, TokenState,
};

pub use infra::{
    DeltaPublisher, GuardedRequest, GuardedRequestError, RelayError, RequestOperation, Result,
    TokenDao, TokenStore,
};
