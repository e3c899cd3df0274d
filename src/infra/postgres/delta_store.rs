//! PostgreSQL delta store
//!
//! Documents live in `documents`; their deltas in `document_deltas`. A
//! delta is pending while `published_at` is NULL, so the table itself is
//! the retry queue and nothing is lost across restarts.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::domain::{
    DeltaDocument, DeltaKind, DocumentId, DocumentMeta, PendingDelta, StepTransition,
};
use crate::infra::{DeltaSource, RelayError, Result};

#[derive(Debug, FromRow)]
struct DocumentRow {
    document_id: i64,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
    entity_id: Option<String>,
    entity_name: Option<String>,
    bucket: Value,
    ratedata: Option<Value>,
}

impl DocumentRow {
    fn meta(&self) -> DocumentMeta {
        DocumentMeta {
            id: DocumentId::new(self.document_id as u64),
            created: self.created_at,
            modified: self.modified_at,
            entity_id: self.entity_id.clone(),
            entity_name: self.entity_name.clone(),
        }
    }
}

#[derive(Debug, FromRow)]
struct DeltaRow {
    delta_id: Uuid,
    document_id: i64,
    kind: String,
    created_at: DateTime<Utc>,
    data: Value,
    step_kind: Option<String>,
    step_src: Option<i32>,
    step_dest: Option<i32>,
}

impl From<DeltaRow> for PendingDelta {
    fn from(row: DeltaRow) -> Self {
        let step = match (row.step_kind, row.step_src, row.step_dest) {
            (Some(kind), Some(src), Some(dest)) => Some(StepTransition {
                kind,
                src: src as u32,
                dest: dest as u32,
            }),
            _ => None,
        };

        PendingDelta {
            id: row.delta_id,
            document_id: DocumentId::new(row.document_id as u64),
            kind: DeltaKind::new(row.kind),
            timestamp: row.created_at,
            data: row.data,
            step,
        }
    }
}

/// Pending work for one document, as shown to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct PendingSummary {
    pub document_id: i64,
    pub pending: i64,
    pub oldest: DateTime<Utc>,
    pub error_flag: Option<String>,
}

/// Delta store backed by PostgreSQL
#[derive(Clone)]
pub struct PgDeltaStore {
    pool: PgPool,
}

impl PgDeltaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn from_url(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert or update a document's metadata and current state.
    ///
    /// The error flag is left untouched.
    pub async fn upsert_document(
        &self,
        meta: &DocumentMeta,
        bucket: &Value,
        ratedata: Option<&Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (
                document_id, created_at, modified_at, entity_id, entity_name, bucket, ratedata
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (document_id) DO UPDATE SET
                modified_at = EXCLUDED.modified_at,
                entity_id = EXCLUDED.entity_id,
                entity_name = EXCLUDED.entity_name,
                bucket = EXCLUDED.bucket,
                ratedata = EXCLUDED.ratedata
            "#,
        )
        .bind(meta.id.as_i64())
        .bind(meta.created)
        .bind(meta.modified)
        .bind(meta.entity_id.as_deref())
        .bind(meta.entity_name.as_deref())
        .bind(bucket)
        .bind(ratedata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Queue a delta for publication
    pub async fn append_delta(&self, delta: &PendingDelta) -> Result<()> {
        let step = delta.step.as_ref();
        sqlx::query(
            r#"
            INSERT INTO document_deltas (
                delta_id, document_id, kind, created_at, data, step_kind, step_src, step_dest
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(delta.id)
        .bind(delta.document_id.as_i64())
        .bind(delta.kind.as_str())
        .bind(delta.timestamp)
        .bind(&delta.data)
        .bind(step.map(|s| s.kind.as_str()))
        .bind(step.map(|s| s.src as i32))
        .bind(step.map(|s| s.dest as i32))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Documents with pending deltas, flagged ones included, oldest first
    pub async fn pending(&self, limit: i64) -> Result<Vec<PendingSummary>> {
        let rows = sqlx::query_as::<_, PendingSummary>(
            r#"
            SELECT d.document_id,
                   COUNT(x.delta_id) AS pending,
                   MIN(x.created_at) AS oldest,
                   d.error_flag
            FROM documents d
            JOIN document_deltas x ON x.document_id = d.document_id
            WHERE x.published_at IS NULL
            GROUP BY d.document_id, d.error_flag
            ORDER BY oldest
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl DeltaSource for PgDeltaStore {
    #[instrument(skip(self))]
    async fn unpublished_documents(&self, limit: usize) -> Result<Vec<DeltaDocument>> {
        let documents = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT d.document_id, d.created_at, d.modified_at, d.entity_id, d.entity_name,
                   d.bucket, d.ratedata
            FROM documents d
            WHERE d.error_flag IS NULL
              AND EXISTS (
                  SELECT 1 FROM document_deltas x
                  WHERE x.document_id = d.document_id AND x.published_at IS NULL
              )
            ORDER BY d.modified_at
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = documents.iter().map(|d| d.document_id).collect();
        let rows = sqlx::query_as::<_, DeltaRow>(
            r#"
            SELECT delta_id, document_id, kind, created_at, data, step_kind, step_src, step_dest
            FROM document_deltas
            WHERE document_id = ANY($1) AND published_at IS NULL
            ORDER BY document_id, created_at
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut deltas: HashMap<i64, Vec<PendingDelta>> = HashMap::new();
        for row in rows {
            deltas.entry(row.document_id).or_default().push(row.into());
        }

        Ok(documents
            .into_iter()
            .map(|row| DeltaDocument {
                meta: row.meta(),
                deltas: deltas.remove(&row.document_id).unwrap_or_default(),
                bucket: row.bucket,
                ratedata: row.ratedata,
            })
            .collect())
    }

    async fn mark_published(&self, document_id: DocumentId, delta_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE document_deltas SET published_at = NOW()
            WHERE delta_id = $1 AND document_id = $2 AND published_at IS NULL
            "#,
        )
        .bind(delta_id)
        .bind(document_id.as_i64())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RelayError::Internal(format!(
                "delta {delta_id} is not pending for {document_id}"
            )));
        }
        Ok(())
    }

    async fn flag_error(&self, document_id: DocumentId, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE documents SET error_flag = $2, error_flagged_at = NOW()
            WHERE document_id = $1
            "#,
        )
        .bind(document_id.as_i64())
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_error(&self, document_id: DocumentId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE documents SET error_flag = NULL, error_flagged_at = NULL
            WHERE document_id = $1 AND error_flag IS NOT NULL
            "#,
        )
        .bind(document_id.as_i64())
        .execute(&self.pool)
        .await?;

        let cleared = result.rows_affected() > 0;
        if cleared {
            info!(document_id = %document_id, "cleared document error flag");
        }
        Ok(cleared)
    }
}
