//! In-memory delta store

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{DeltaDocument, DocumentId, DocumentMeta, PendingDelta};
use crate::infra::{DeltaSource, RelayError, Result};

#[derive(Debug, Clone)]
struct DocumentEntry {
    meta: DocumentMeta,
    bucket: serde_json::Value,
    ratedata: Option<serde_json::Value>,
    pending: Vec<PendingDelta>,
    published: Vec<Uuid>,
    error: Option<String>,
}

/// Delta queue backed by process memory
#[derive(Debug, Default)]
pub struct MemoryDeltaStore {
    documents: RwLock<BTreeMap<DocumentId, DocumentEntry>>,
}

impl MemoryDeltaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a document's metadata and current state.
    ///
    /// Pending deltas, publish history and the error flag are kept.
    pub async fn upsert_document(
        &self,
        meta: DocumentMeta,
        bucket: serde_json::Value,
        ratedata: Option<serde_json::Value>,
    ) {
        let mut documents = self.documents.write().await;
        match documents.get_mut(&meta.id) {
            Some(entry) => {
                entry.meta = meta;
                entry.bucket = bucket;
                entry.ratedata = ratedata;
            }
            None => {
                documents.insert(
                    meta.id,
                    DocumentEntry {
                        meta,
                        bucket,
                        ratedata,
                        pending: Vec::new(),
                        published: Vec::new(),
                        error: None,
                    },
                );
            }
        }
    }

    /// Queue a delta for publication
    pub async fn append_delta(&self, delta: PendingDelta) -> Result<()> {
        let mut documents = self.documents.write().await;
        let entry = documents
            .get_mut(&delta.document_id)
            .ok_or_else(|| RelayError::Internal(format!("unknown document {}", delta.document_id)))?;
        entry.pending.push(delta);
        Ok(())
    }

    /// Ids of published deltas, in publication order
    pub async fn published(&self, document_id: DocumentId) -> Vec<Uuid> {
        let documents = self.documents.read().await;
        documents
            .get(&document_id)
            .map(|e| e.published.clone())
            .unwrap_or_default()
    }

    /// Number of deltas still pending for a document
    pub async fn pending_count(&self, document_id: DocumentId) -> usize {
        let documents = self.documents.read().await;
        documents
            .get(&document_id)
            .map(|e| e.pending.len())
            .unwrap_or(0)
    }

    /// Error flag reason, if the document is flagged
    pub async fn error_flag(&self, document_id: DocumentId) -> Option<String> {
        let documents = self.documents.read().await;
        documents.get(&document_id).and_then(|e| e.error.clone())
    }
}

#[async_trait]
impl DeltaSource for MemoryDeltaStore {
    async fn unpublished_documents(&self, limit: usize) -> Result<Vec<DeltaDocument>> {
        let documents = self.documents.read().await;
        let mut ready: Vec<&DocumentEntry> = documents
            .values()
            .filter(|e| e.error.is_none() && !e.pending.is_empty())
            .collect();
        ready.sort_by_key(|e| e.meta.modified);

        Ok(ready
            .into_iter()
            .take(limit)
            .map(|e| DeltaDocument {
                meta: e.meta.clone(),
                bucket: e.bucket.clone(),
                ratedata: e.ratedata.clone(),
                deltas: e.pending.clone(),
            })
            .collect())
    }

    async fn mark_published(&self, document_id: DocumentId, delta_id: Uuid) -> Result<()> {
        let mut documents = self.documents.write().await;
        let entry = documents
            .get_mut(&document_id)
            .ok_or_else(|| RelayError::Internal(format!("unknown document {document_id}")))?;

        let position = entry
            .pending
            .iter()
            .position(|d| d.id == delta_id)
            .ok_or_else(|| {
                RelayError::Internal(format!("delta {delta_id} is not pending for {document_id}"))
            })?;
        entry.pending.remove(position);
        entry.published.push(delta_id);
        Ok(())
    }

    async fn flag_error(&self, document_id: DocumentId, reason: &str) -> Result<()> {
        let mut documents = self.documents.write().await;
        if let Some(entry) = documents.get_mut(&document_id) {
            entry.error = Some(reason.to_string());
        }
        Ok(())
    }

    async fn clear_error(&self, document_id: DocumentId) -> Result<bool> {
        let mut documents = self.documents.write().await;
        Ok(documents
            .get_mut(&document_id)
            .and_then(|e| e.error.take())
            .is_some())
    }
}
