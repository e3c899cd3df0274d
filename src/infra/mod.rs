//! Infrastructure layer for quote-relay
//!
//! Contains trait definitions and implementations for:
//! - Token storage (PostgreSQL, in-memory) and the typed token store
//! - Precedence-guarded requests
//! - Resilient broker connection (AMQP, in-memory)
//! - Delta event encoding (tagging, schema validation, CBOR)
//! - Delta publication driver
//! - Graceful shutdown

pub mod broker;
pub mod encoder;
mod error;
mod graceful_shutdown;
mod guarded_request;
pub mod memory;
pub mod postgres;
mod publisher;
pub mod retry;
mod token_store;
mod traits;

pub use error::*;
pub use graceful_shutdown::{
    join_with_timeout, shutdown_signal, ShutdownCoordinator, ShutdownSignal,
};
pub use guarded_request::{
    CallbackError, CallbackOperation, Completion, GuardedRequest, GuardedRequestError,
    RequestOperation,
};
pub use memory::{MemoryDeltaStore, MemoryTokenDao};
pub use postgres::{PendingSummary, PgDeltaStore, PgTokenDao};
pub use publisher::{
    headers, CycleReport, DeltaPublisher, DocumentOutcome, PublisherConfig, PublisherStats,
};
pub use token_store::TokenStore;
pub use traits::*;
