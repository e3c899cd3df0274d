//! Document deltas and the event records built from them
//!
//! A delta is the set of changes made to a quote document's data since its
//! last published state. Pending deltas are read from durable storage by
//! the publisher, turned into [`DeltaRecord`]s and handed to the encoder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DeltaKind, DocumentId};

/// Actor recorded on events published by the server process
pub const SERVER_ACTOR: &str = "SERVER";

/// Metadata of the document a delta belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub id: DocumentId,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    /// Owning entity (agency/account) identifier
    pub entity_id: Option<String>,
    /// Owning entity display name
    pub entity_name: Option<String>,
}

impl DocumentMeta {
    pub fn new(id: DocumentId, created: DateTime<Utc>, modified: DateTime<Utc>) -> Self {
        Self {
            id,
            created,
            modified,
            entity_id: None,
            entity_name: None,
        }
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>, entity_name: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self.entity_name = Some(entity_name.into());
        self
    }
}

/// Step transition that caused a delta, when known
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTransition {
    /// Transition kind (e.g. `forward`, `back`)
    pub kind: String,
    pub src: u32,
    pub dest: u32,
}

/// A delta waiting to be published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDelta {
    pub id: Uuid,
    pub document_id: DocumentId,
    pub kind: DeltaKind,
    /// When the change was made (publication order)
    pub timestamp: DateTime<Utc>,
    /// Changed fields only
    pub data: serde_json::Value,
    pub step: Option<StepTransition>,
}

impl PendingDelta {
    pub fn new(
        document_id: DocumentId,
        kind: DeltaKind,
        timestamp: DateTime<Utc>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id,
            kind,
            timestamp,
            data,
            step: None,
        }
    }

    pub fn with_step(mut self, step: StepTransition) -> Self {
        self.step = Some(step);
        self
    }
}

/// A document together with its unpublished deltas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaDocument {
    pub meta: DocumentMeta,
    /// Current full data bucket
    pub bucket: serde_json::Value,
    /// Current rating results, if the document has been rated
    pub ratedata: Option<serde_json::Value>,
    /// Unpublished deltas, oldest first
    pub deltas: Vec<PendingDelta>,
}

impl DeltaDocument {
    /// Deltas in publication order
    pub fn ordered_deltas(&self) -> Vec<&PendingDelta> {
        let mut deltas: Vec<&PendingDelta> = self.deltas.iter().collect();
        deltas.sort_by_key(|d| d.timestamp);
        deltas
    }
}

/// Application-level event record handed to the encoder
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaRecord {
    pub kind: DeltaKind,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub step: Option<StepTransition>,
    pub meta: DocumentMeta,
    pub bucket: serde_json::Value,
    pub delta: serde_json::Value,
    pub ratedata: Option<serde_json::Value>,
}

impl DeltaRecord {
    pub fn from_pending(document: &DeltaDocument, delta: &PendingDelta) -> Self {
        Self {
            kind: delta.kind.clone(),
            timestamp: delta.timestamp,
            actor: SERVER_ACTOR.to_string(),
            step: delta.step.clone(),
            meta: document.meta.clone(),
            bucket: document.bucket.clone(),
            delta: delta.data.clone(),
            ratedata: document.ratedata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_ordered_deltas_sorts_by_timestamp() {
        let now = Utc::now();
        let doc_id = DocumentId::new(7);
        let later = PendingDelta::new(doc_id, DeltaKind::data(), now, json!({"b": ["2"]}));
        let earlier = PendingDelta::new(
            doc_id,
            DeltaKind::data(),
            now - Duration::seconds(5),
            json!({"a": ["1"]}),
        );

        let document = DeltaDocument {
            meta: DocumentMeta::new(doc_id, now, now),
            bucket: json!({}),
            ratedata: None,
            deltas: vec![later.clone(), earlier.clone()],
        };

        let ordered = document.ordered_deltas();
        assert_eq!(ordered[0].id, earlier.id);
        assert_eq!(ordered[1].id, later.id);
    }

    #[test]
    fn test_record_from_pending_carries_document_state() {
        let now = Utc::now();
        let doc_id = DocumentId::new(8);
        let delta = PendingDelta::new(doc_id, DeltaKind::ratedata(), now, json!({"premium": [10]}));
        let document = DeltaDocument {
            meta: DocumentMeta::new(doc_id, now, now).with_entity("123", "Acme Agency"),
            bucket: json!({"name": ["Foo"]}),
            ratedata: Some(json!({"premium": [10]})),
            deltas: vec![delta.clone()],
        };

        let record = DeltaRecord::from_pending(&document, &delta);
        assert_eq!(record.kind, DeltaKind::ratedata());
        assert_eq!(record.actor, SERVER_ACTOR);
        assert_eq!(record.bucket, json!({"name": ["Foo"]}));
        assert_eq!(record.delta, json!({"premium": [10]}));
        assert_eq!(record.meta.entity_name.as_deref(), Some("Acme Agency"));
    }
}
