//! PostgreSQL storage for tokens and deltas

mod delta_store;
mod token_dao;

pub use delta_store::{PendingSummary, PgDeltaStore};
pub use token_dao::PgTokenDao;
