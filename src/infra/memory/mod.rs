//! In-memory storage implementations
//!
//! Used by tests and by local runs without a database.

mod delta_store;
mod token_dao;

pub use delta_store::MemoryDeltaStore;
pub use token_dao::MemoryTokenDao;
