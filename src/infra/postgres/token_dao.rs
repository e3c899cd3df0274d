//! PostgreSQL token DAO
//!
//! Tokens live in `request_tokens`; the per-namespace pointers live in one
//! `token_namespaces` row. Every write locks that row:
//!
//! ```sql
//! BEGIN;
//! INSERT INTO token_namespaces (document_id, namespace) ... ON CONFLICT DO NOTHING;
//! SELECT last_token, last_active, ... FROM token_namespaces ... FOR UPDATE;
//! -- validate transition, upsert token, move pointers
//! COMMIT;
//! ```
//!
//! so concurrent writers in one namespace are serialized and each sees the
//! pointers exactly as the previous writer left them.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::{FromRow, Postgres, Transaction};
use tracing::instrument;

use crate::domain::{DocumentId, TokenData, TokenId, TokenNamespace, TokenState, TokenStatus};
use crate::infra::{RelayError, Result, TokenDao};

#[derive(Debug, Default, FromRow)]
struct NamespaceRow {
    last_token: Option<String>,
    last_active: Option<String>,
    last_done: Option<String>,
    last_accepted: Option<String>,
    last_dead: Option<String>,
}

impl NamespaceRow {
    fn last(&self) -> Option<TokenId> {
        self.last_token.clone().map(TokenId::new)
    }

    fn last_state(&self) -> HashMap<TokenState, TokenId> {
        [
            (TokenState::Active, &self.last_active),
            (TokenState::Done, &self.last_done),
            (TokenState::Accepted, &self.last_accepted),
            (TokenState::Dead, &self.last_dead),
        ]
        .into_iter()
        .filter_map(|(state, id)| id.clone().map(|id| (state, TokenId::new(id))))
        .collect()
    }

    fn point(&mut self, state: TokenState, token_id: &TokenId) {
        let id = Some(token_id.as_str().to_string());
        self.last_token = id.clone();
        match state {
            TokenState::Active => self.last_active = id,
            TokenState::Done => self.last_done = id,
            TokenState::Accepted => self.last_accepted = id,
            TokenState::Dead => self.last_dead = id,
        }
    }
}

#[derive(Debug, FromRow)]
struct TokenRow {
    state: String,
    data: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TokenRow {
    fn into_status(self) -> Result<TokenStatus> {
        let state = TokenState::parse(&self.state)
            .ok_or_else(|| RelayError::Internal(format!("unknown token state {}", self.state)))?;
        Ok(TokenStatus {
            state,
            timestamp: self.updated_at,
            data: self.data,
        })
    }
}

/// Token DAO backed by PostgreSQL
#[derive(Clone)]
pub struct PgTokenDao {
    pool: PgPool,
}

impl PgTokenDao {
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

    async fn lock_namespace(
        tx: &mut Transaction<'_, Postgres>,
        document_id: DocumentId,
        namespace: &TokenNamespace,
    ) -> Result<NamespaceRow> {
        sqlx::query(
            r#"
            INSERT INTO token_namespaces (document_id, namespace)
            VALUES ($1, $2)
            ON CONFLICT (document_id, namespace) DO NOTHING
            "#,
        )
        .bind(document_id.as_i64())
        .bind(namespace.as_str())
        .execute(&mut **tx)
        .await?;

        let row = sqlx::query_as::<_, NamespaceRow>(
            r#"
            SELECT last_token, last_active, last_done, last_accepted, last_dead
            FROM token_namespaces
            WHERE document_id = $1 AND namespace = $2
            FOR UPDATE
            "#,
        )
        .bind(document_id.as_i64())
        .bind(namespace.as_str())
        .fetch_one(&mut **tx)
        .await?;

        Ok(row)
    }
}

#[async_trait]
impl TokenDao for PgTokenDao {
    #[instrument(skip(self), fields(document_id = %document_id, namespace = %namespace))]
    async fn get_token(
        &self,
        document_id: DocumentId,
        namespace: &TokenNamespace,
        token_id: &TokenId,
    ) -> Result<TokenData> {
        let token = sqlx::query_as::<_, TokenRow>(
            r#"
            SELECT state, data, updated_at
            FROM request_tokens
            WHERE document_id = $1 AND namespace = $2 AND token_id = $3
            "#,
        )
        .bind(document_id.as_i64())
        .bind(namespace.as_str())
        .bind(token_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RelayError::TokenNotFound {
            document_id,
            namespace: namespace.clone(),
            token_id: token_id.clone(),
        })?;

        let pointers = sqlx::query_as::<_, NamespaceRow>(
            r#"
            SELECT last_token, last_active, last_done, last_accepted, last_dead
            FROM token_namespaces
            WHERE document_id = $1 AND namespace = $2
            "#,
        )
        .bind(document_id.as_i64())
        .bind(namespace.as_str())
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or_default();

        Ok(TokenData {
            id: token_id.clone(),
            status: token.into_status()?,
            prev_status: None,
            prev_last: pointers.last(),
            prev_state: pointers.last_state(),
        })
    }

    #[instrument(skip(self, data), fields(document_id = %document_id, namespace = %namespace, state = %state))]
    async fn update_token(
        &self,
        document_id: DocumentId,
        namespace: &TokenNamespace,
        token_id: &TokenId,
        state: TokenState,
        data: Option<String>,
    ) -> Result<TokenData> {
        let mut tx = self.pool.begin().await?;
        let mut pointers = Self::lock_namespace(&mut tx, document_id, namespace).await?;

        let prev_status = sqlx::query_as::<_, TokenRow>(
            r#"
            SELECT state, data, updated_at
            FROM request_tokens
            WHERE document_id = $1 AND namespace = $2 AND token_id = $3
            "#,
        )
        .bind(document_id.as_i64())
        .bind(namespace.as_str())
        .bind(token_id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .map(TokenRow::into_status)
        .transpose()?;

        let from = prev_status.as_ref().map(|s| s.state);
        if !TokenState::is_valid_transition(from, state) {
            // Dropping the transaction rolls it back
            return Err(RelayError::InvalidStateTransition {
                token_id: token_id.clone(),
                from: from.map_or_else(|| "NONE".to_string(), |s| s.to_string()),
                to: state,
            });
        }

        let status = TokenStatus {
            state,
            timestamp: Utc::now(),
            data,
        };

        sqlx::query(
            r#"
            INSERT INTO request_tokens (document_id, namespace, token_id, state, data, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (document_id, namespace, token_id) DO UPDATE SET
                state = EXCLUDED.state,
                data = EXCLUDED.data,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(document_id.as_i64())
        .bind(namespace.as_str())
        .bind(token_id.as_str())
        .bind(state.as_str())
        .bind(status.data.as_deref())
        .bind(status.timestamp)
        .execute(&mut *tx)
        .await?;

        let prev_last = pointers.last();
        let prev_state = pointers.last_state();
        pointers.point(state, token_id);

        sqlx::query(
            r#"
            UPDATE token_namespaces SET
                last_token = $3,
                last_active = $4,
                last_done = $5,
                last_accepted = $6,
                last_dead = $7
            WHERE document_id = $1 AND namespace = $2
            "#,
        )
        .bind(document_id.as_i64())
        .bind(namespace.as_str())
        .bind(pointers.last_token.as_deref())
        .bind(pointers.last_active.as_deref())
        .bind(pointers.last_done.as_deref())
        .bind(pointers.last_accepted.as_deref())
        .bind(pointers.last_dead.as_deref())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(TokenData {
            id: token_id.clone(),
            status,
            prev_status,
            prev_last,
            prev_state,
        })
    }
}
