//! In-memory token DAO
//!
//! Every read-modify-write happens under a single lock, which makes the
//! capture of the previous namespace pointers and the write of the new
//! state one atomic step. Suitable for tests and single-process runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::domain::{DocumentId, TokenData, TokenId, TokenNamespace, TokenState, TokenStatus};
use crate::infra::{RelayError, Result, TokenDao};

#[derive(Debug, Default)]
struct NamespaceState {
    last: Option<TokenId>,
    last_state: HashMap<TokenState, TokenId>,
    tokens: HashMap<TokenId, TokenStatus>,
}

/// Token DAO backed by process memory
#[derive(Debug, Default)]
pub struct MemoryTokenDao {
    namespaces: Mutex<HashMap<(DocumentId, TokenNamespace), NamespaceState>>,
}

impl MemoryTokenDao {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of every token in a namespace
    pub async fn states(
        &self,
        document_id: DocumentId,
        namespace: &TokenNamespace,
    ) -> HashMap<TokenId, TokenState> {
        let namespaces = self.namespaces.lock().await;
        namespaces
            .get(&(document_id, namespace.clone()))
            .map(|ns| {
                ns.tokens
                    .iter()
                    .map(|(id, status)| (id.clone(), status.state))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl TokenDao for MemoryTokenDao {
    async fn get_token(
        &self,
        document_id: DocumentId,
        namespace: &TokenNamespace,
        token_id: &TokenId,
    ) -> Result<TokenData> {
        let namespaces = self.namespaces.lock().await;
        let not_found = || RelayError::TokenNotFound {
            document_id,
            namespace: namespace.clone(),
            token_id: token_id.clone(),
        };

        let ns = namespaces
            .get(&(document_id, namespace.clone()))
            .ok_or_else(not_found)?;
        let status = ns.tokens.get(token_id).cloned().ok_or_else(not_found)?;

        Ok(TokenData {
            id: token_id.clone(),
            status,
            prev_status: None,
            prev_last: ns.last.clone(),
            prev_state: ns.last_state.clone(),
        })
    }

    async fn update_token(
        &self,
        document_id: DocumentId,
        namespace: &TokenNamespace,
        token_id: &TokenId,
        state: TokenState,
        data: Option<String>,
    ) -> Result<TokenData> {
        let mut namespaces = self.namespaces.lock().await;
        let ns = namespaces
            .entry((document_id, namespace.clone()))
            .or_default();

        let prev_status = ns.tokens.get(token_id).cloned();
        let from = prev_status.as_ref().map(|s| s.state);
        if !TokenState::is_valid_transition(from, state) {
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

        let prev_last = ns.last.replace(token_id.clone());
        let prev_state = ns.last_state.clone();
        ns.last_state.insert(state, token_id.clone());
        ns.tokens.insert(token_id.clone(), status.clone());

        Ok(TokenData {
            id: token_id.clone(),
            status,
            prev_status,
            prev_last,
            prev_state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> TokenNamespace {
        TokenNamespace::from("loc")
    }

    #[tokio::test]
    async fn test_create_records_pointers() {
        let dao = MemoryTokenDao::new();
        let doc = DocumentId::new(1);

        let first = dao
            .update_token(doc, &ns(), &TokenId::from("a"), TokenState::Active, None)
            .await
            .unwrap();
        assert_eq!(first.prev_last, None);
        assert!(first.prev_state.is_empty());
        assert_eq!(first.prev_status, None);

        let second = dao
            .update_token(doc, &ns(), &TokenId::from("b"), TokenState::Active, None)
            .await
            .unwrap();
        assert_eq!(second.prev_last, Some(TokenId::from("a")));
        assert_eq!(
            second.prev_state.get(&TokenState::Active),
            Some(&TokenId::from("a"))
        );
    }

    #[tokio::test]
    async fn test_rejects_invalid_transition_without_writing() {
        let dao = MemoryTokenDao::new();
        let doc = DocumentId::new(1);
        let id = TokenId::from("a");

        dao.update_token(doc, &ns(), &id, TokenState::Active, None)
            .await
            .unwrap();

        let err = dao
            .update_token(doc, &ns(), &id, TokenState::Accepted, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::InvalidStateTransition { to: TokenState::Accepted, .. }
        ));

        let read = dao.get_token(doc, &ns(), &id).await.unwrap();
        assert_eq!(read.status.state, TokenState::Active);
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let dao = MemoryTokenDao::new();
        let doc = DocumentId::new(1);
        let id = TokenId::from("a");

        dao.update_token(doc, &ns(), &id, TokenState::Active, None)
            .await
            .unwrap();
        assert!(dao
            .update_token(doc, &ns(), &id, TokenState::Active, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated_per_document() {
        let dao = MemoryTokenDao::new();
        let id = TokenId::from("a");

        dao.update_token(DocumentId::new(1), &ns(), &id, TokenState::Active, None)
            .await
            .unwrap();

        let err = dao
            .get_token(DocumentId::new(2), &ns(), &id)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::TokenNotFound { .. }));

        let other = dao
            .update_token(DocumentId::new(2), &ns(), &id, TokenState::Active, None)
            .await
            .unwrap();
        assert_eq!(other.prev_last, None);
    }

    #[tokio::test]
    async fn test_get_returns_current_pointers_and_data() {
        let dao = MemoryTokenDao::new();
        let doc = DocumentId::new(1);

        dao.update_token(doc, &ns(), &TokenId::from("a"), TokenState::Active, None)
            .await
            .unwrap();
        dao.update_token(
            doc,
            &ns(),
            &TokenId::from("a"),
            TokenState::Done,
            Some("{\"ok\":true}".into()),
        )
        .await
        .unwrap();

        let read = dao.get_token(doc, &ns(), &TokenId::from("a")).await.unwrap();
        assert_eq!(read.status.state, TokenState::Done);
        assert_eq!(read.status.data.as_deref(), Some("{\"ok\":true}"));
        assert_eq!(read.prev_last, Some(TokenId::from("a")));
        assert_eq!(read.prev_state.get(&TokenState::Done), Some(&TokenId::from("a")));

        let states = dao.states(doc, &ns()).await;
        assert_eq!(states.get(&TokenId::from("a")), Some(&TokenState::Done));
    }
}
