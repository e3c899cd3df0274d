//! Delta event encoder
//!
//! Turns a [`DeltaRecord`] into publishable bytes:
//!
//! 1. tag the bucket, delta and ratedata payloads ([`tagging`])
//! 2. wrap them in the event envelope ([`envelope`])
//! 3. validate the envelope against the event JSON Schema
//! 4. encode it with the binary codec ([`codec`])
//!
//! A record that fails validation is rejected with every offending path
//! and value; the codec is not invoked for it.

pub mod codec;
pub mod envelope;
pub mod tagging;

use std::path::Path;
use std::sync::Arc;

use jsonschema::Validator;
use serde_json::Value;
use tracing::debug;

use crate::domain::{DeltaRecord, EventSchema, SchemaValidationError};
use crate::infra::{RelayError, Result};

pub use codec::{CborCodec, PayloadCodec};
pub use envelope::{build_envelope, EventTypeMap, ProgramInfo, RATE_EVENT, STEP_SAVE_EVENT};
pub use tagging::{tag_payload, tag_value};

/// An encoded event ready for publication
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedEvent {
    pub event_type: String,
    pub content_type: &'static str,
    pub payload: Vec<u8>,
}

/// Validating encoder for delta events
pub struct DeltaEncoder {
    schema: EventSchema,
    validator: Validator,
    codec: Arc<dyn PayloadCodec>,
    event_types: EventTypeMap,
    program: ProgramInfo,
}

impl DeltaEncoder {
    /// Encoder for `schema`, using CBOR and the default event types.
    pub fn new(schema: EventSchema, program: ProgramInfo) -> Result<Self> {
        let validator = Validator::new(&schema.schema_json)
            .map_err(|e| RelayError::InvalidSchema(format!("failed to compile schema: {e}")))?;

        Ok(Self {
            schema,
            validator,
            codec: Arc::new(CborCodec),
            event_types: EventTypeMap::default(),
            program,
        })
    }

    /// Encoder for the bundled delta event schema
    pub fn with_bundled_schema(program: ProgramInfo) -> Result<Self> {
        Self::new(EventSchema::delta_event()?, program)
    }

    /// Encoder for a schema read from a JSON file
    pub fn from_schema_file(path: impl AsRef<Path>, program: ProgramInfo) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Configuration(format!("cannot read schema {}: {e}", path.display()))
        })?;
        let schema_json: Value = serde_json::from_str(&raw)?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("custom")
            .to_string();
        Self::new(EventSchema::new(name, 1, schema_json), program)
    }

    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_event_types(mut self, event_types: EventTypeMap) -> Self {
        self.event_types = event_types;
        self
    }

    pub fn schema(&self) -> &EventSchema {
        &self.schema
    }

    pub fn program(&self) -> &ProgramInfo {
        &self.program
    }

    /// Collect every validation error for `envelope`
    pub fn validate(&self, envelope: &Value) -> Result<()> {
        let errors: Vec<SchemaValidationError> = self
            .validator
            .iter_errors(envelope)
            .map(|e| {
                SchemaValidationError::new(
                    e.instance_path.to_string(),
                    e.instance.clone().into_owned(),
                    e.to_string(),
                )
            })
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RelayError::SchemaViolation { errors })
        }
    }

    /// Build and validate the envelope for `record`
    pub fn envelope(&self, record: &DeltaRecord) -> Result<Value> {
        let envelope = build_envelope(record, &self.event_types, &self.program)?;
        self.validate(&envelope)?;
        Ok(envelope)
    }

    /// Encode `record` for publication
    pub fn encode(&self, record: &DeltaRecord) -> Result<EncodedEvent> {
        let envelope = self.envelope(record)?;
        let payload = self.codec.encode(&envelope)?;

        let event_type = self.event_types.resolve(&record.kind)?.to_string();
        debug!(
            document_id = %record.meta.id,
            event_type = %event_type,
            bytes = payload.len(),
            "encoded delta event"
        );

        Ok(EncodedEvent {
            event_type,
            content_type: self.codec.content_type(),
            payload,
        })
    }
}
