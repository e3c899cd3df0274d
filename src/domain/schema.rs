//! Event schema types
//!
//! Published events are validated against a JSON Schema describing the
//! tagged envelope before they are binary encoded.

use serde::{Deserialize, Serialize};

/// Schema bundled with the crate for delta events
pub const DELTA_EVENT_SCHEMA: &str = include_str!("../../schemas/delta_event.schema.json");

/// Name of the bundled delta event schema
pub const DELTA_EVENT_SCHEMA_NAME: &str = "quote.delta_event";

/// A named, versioned event schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSchema {
    /// Schema name (also sent as a message header)
    pub name: String,
    /// Schema version (monotonically increasing per name)
    pub version: u32,
    /// The JSON Schema definition
    pub schema_json: serde_json::Value,
}

impl EventSchema {
    pub fn new(name: impl Into<String>, version: u32, schema_json: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            version,
            schema_json,
        }
    }

    /// The bundled delta event schema
    pub fn delta_event() -> Result<Self, serde_json::Error> {
        let schema_json = serde_json::from_str(DELTA_EVENT_SCHEMA)?;
        Ok(Self::new(DELTA_EVENT_SCHEMA_NAME, 1, schema_json))
    }
}

/// A single schema validation error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaValidationError {
    /// JSON pointer to the invalid field
    pub path: String,
    /// Offending value
    pub value: serde_json::Value,
    /// Error message
    pub message: String,
}

impl SchemaValidationError {
    pub fn new(
        path: impl Into<String>,
        value: serde_json::Value,
        message: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            value,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} = {}: {}", self.path, self.value, self.message)
    }
}
