//! Domain models for quote-relay
//!
//! Request tokens, document deltas, and event schemas.

mod delta;
mod schema;
mod token;
mod types;

pub use delta::*;
pub use schema::*;
pub use token::*;
pub use types::*;
