//! Event envelope assembly
//!
//! Wraps tagged payloads in the fixed envelope consumers expect. Timestamps
//! are milliseconds since the Unix epoch. Optional fields are written as
//! `null`, never omitted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::tagging::tag_payload;
use crate::domain::{DeltaKind, DeltaRecord, StepTransition};
use crate::infra::{RelayError, Result};

/// Event type published for data deltas
pub const STEP_SAVE_EVENT: &str = "STEP_SAVE";
/// Event type published for rating deltas
pub const RATE_EVENT: &str = "RATE";

/// Maps internal delta kinds to external event type names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTypeMap {
    types: HashMap<DeltaKind, String>,
}

impl Default for EventTypeMap {
    fn default() -> Self {
        Self::empty()
            .with(DeltaKind::data(), STEP_SAVE_EVENT)
            .with(DeltaKind::ratedata(), RATE_EVENT)
    }
}

impl EventTypeMap {
    pub fn empty() -> Self {
        Self {
            types: HashMap::new(),
        }
    }

    pub fn with(mut self, kind: DeltaKind, event_type: impl Into<String>) -> Self {
        self.types.insert(kind, event_type.into());
        self
    }

    /// External event type for `kind`
    pub fn resolve(&self, kind: &DeltaKind) -> Result<&str> {
        self.types
            .get(kind)
            .map(String::as_str)
            .ok_or_else(|| RelayError::UnknownDeltaKind(kind.to_string()))
    }
}

/// Identity of the program publishing events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramInfo {
    pub id: String,
    pub version: String,
}

impl ProgramInfo {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }
}

impl Default for ProgramInfo {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }
}

fn step(step: Option<&StepTransition>) -> Value {
    match step {
        Some(s) => json!({
            "transition": {"type": s.kind, "src": s.src, "dest": s.dest}
        }),
        None => Value::Null,
    }
}

fn bucket(data: &Value) -> Value {
    json!({ "bucket": tag_payload(data) })
}

/// Build the envelope for one delta record
pub fn build_envelope(
    record: &DeltaRecord,
    event_types: &EventTypeMap,
    program: &ProgramInfo,
) -> Result<Value> {
    let event_type = event_types.resolve(&record.kind)?;

    Ok(json!({
        "event": {
            "id": event_type,
            "ts": record.timestamp.timestamp_millis(),
            "actor": record.actor,
            "step": step(record.step.as_ref()),
        },
        "document": {
            "id": record.meta.id.as_u64(),
            "created": record.meta.created.timestamp_millis(),
            "modified": record.meta.modified.timestamp_millis(),
        },
        "session": {
            "entity_id": record.meta.entity_id,
            "entity_name": record.meta.entity_name,
        },
        "data": bucket(&record.bucket),
        "ratedata": record.ratedata.as_ref().map_or(Value::Null, bucket),
        "delta": bucket(&record.delta),
        "program": {
            "id": program.id,
            "version": program.version,
        },
    }))
}
