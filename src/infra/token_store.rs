//! Token store
//!
//! Creates tokens and moves them through the token state machine for one
//! (document, namespace) pair, computing precedence metadata from the
//! pointers the DAO returns with every write.
//!
//! # Precedence
//!
//! After completing a token, `last_created` tells the caller whether any
//! newer token was created in the namespace since this one. If so, the
//! result is stale and the token should be killed rather than accepted.
//! Staleness depends only on creation order: the DAO's last-ACTIVE pointer
//! moves exactly when a token is created.
//!
//! The store keeps no pointer state of its own; every decision is made from
//! what the DAO returned for that write.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::domain::{
    Accepted, Active, AnyToken, Dead, DocumentId, Done, Precedence, Token, TokenData, TokenId,
    TokenNamespace, TokenState, TokenStateMarker,
};

use super::{RelayError, Result, TokenDao, TokenIdGenerator};

/// Token store scoped to one document and namespace
#[derive(Clone)]
pub struct TokenStore {
    dao: Arc<dyn TokenDao>,
    document_id: DocumentId,
    namespace: TokenNamespace,
    id_generator: Arc<dyn TokenIdGenerator>,
}

impl TokenStore {
    pub fn new(
        dao: Arc<dyn TokenDao>,
        document_id: DocumentId,
        namespace: TokenNamespace,
        id_generator: Arc<dyn TokenIdGenerator>,
    ) -> Self {
        Self {
            dao,
            document_id,
            namespace,
            id_generator,
        }
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn namespace(&self) -> &TokenNamespace {
        &self.namespace
    }

    /// Create a new ACTIVE token.
    ///
    /// A freshly created token is always the last created in its namespace.
    #[instrument(skip(self), fields(document_id = %self.document_id, namespace = %self.namespace))]
    pub async fn create_token(&self) -> Result<Token<Active>> {
        let id = self.id_generator.generate();
        let data = self
            .dao
            .update_token(self.document_id, &self.namespace, &id, TokenState::Active, None)
            .await?;

        debug!(token_id = %id, "token created");
        Ok(self.to_token(data, true))
    }

    /// Look up a token in whatever state it currently holds.
    #[instrument(skip(self), fields(document_id = %self.document_id, namespace = %self.namespace))]
    pub async fn lookup_token(&self, token_id: &TokenId) -> Result<AnyToken> {
        let data = self
            .dao
            .get_token(self.document_id, &self.namespace, token_id)
            .await?;

        let precedence = Self::precedence(&data, false);
        Ok(AnyToken::from_status(
            self.document_id,
            self.namespace.clone(),
            data.id,
            data.status,
            precedence,
        ))
    }

    /// ACTIVE -> DONE
    pub async fn complete_token(
        &self,
        token: &Token<Active>,
        data: Option<String>,
    ) -> Result<Token<Done>> {
        self.transition(token, data).await
    }

    /// DONE -> ACCEPTED
    pub async fn accept_token(
        &self,
        token: &Token<Done>,
        data: Option<String>,
    ) -> Result<Token<Accepted>> {
        self.transition(token, data).await
    }

    /// DONE -> DEAD
    pub async fn kill_token(&self, token: &Token<Done>, data: Option<String>) -> Result<Token<Dead>> {
        self.transition(token, data).await
    }

    async fn transition<S, T>(&self, token: &Token<S>, data: Option<String>) -> Result<Token<T>>
    where
        S: TokenStateMarker,
        T: TokenStateMarker,
    {
        if token.document_id() != self.document_id || token.namespace() != &self.namespace {
            return Err(RelayError::Internal(format!(
                "token {} belongs to {}/{}, not {}/{}",
                token.id(),
                token.document_id(),
                token.namespace(),
                self.document_id,
                self.namespace
            )));
        }

        let written = self
            .dao
            .update_token(self.document_id, &self.namespace, token.id(), T::STATE, data)
            .await?;

        let token: Token<T> = self.to_token(written, false);
        debug!(
            document_id = %self.document_id,
            namespace = %self.namespace,
            token_id = %token.id(),
            from = %S::STATE,
            to = %T::STATE,
            last_created = token.last_created(),
            last_mismatch = token.last_mismatch(),
            "token transitioned"
        );
        Ok(token)
    }

    fn to_token<S: TokenStateMarker>(&self, data: TokenData, created: bool) -> Token<S> {
        let precedence = Self::precedence(&data, created);
        Token::new(
            self.document_id,
            self.namespace.clone(),
            data.status,
            data.id,
            precedence,
        )
    }

    fn precedence(data: &TokenData, created: bool) -> Precedence {
        Precedence {
            last_mismatch: data.prev_last.as_ref() != Some(&data.id),
            last_created: created
                || data.prev_state.get(&TokenState::Active) == Some(&data.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TokenStatus;
    use crate::infra::MockTokenDao;
    use chrono::Utc;
    use mockall::predicate::*;
    use std::collections::HashMap;

    fn token_data(
        id: &str,
        state: TokenState,
        prev_last: Option<&str>,
        prev_active: Option<&str>,
    ) -> TokenData {
        let mut prev_state = HashMap::new();
        if let Some(active) = prev_active {
            prev_state.insert(TokenState::Active, TokenId::from(active));
        }
        TokenData {
            id: TokenId::from(id),
            status: TokenStatus {
                state,
                timestamp: Utc::now(),
                data: None,
            },
            prev_status: None,
            prev_last: prev_last.map(TokenId::from),
            prev_state,
        }
    }

    fn store(dao: MockTokenDao, id: &'static str) -> TokenStore {
        TokenStore::new(
            Arc::new(dao),
            DocumentId::new(1000),
            TokenNamespace::from("loc"),
            Arc::new(move || TokenId::from(id)),
        )
    }

    #[tokio::test]
    async fn test_create_token_is_always_last_created() {
        let mut dao = MockTokenDao::new();
        dao.expect_update_token()
            .with(
                eq(DocumentId::new(1000)),
                eq(TokenNamespace::from("loc")),
                eq(TokenId::from("a")),
                eq(TokenState::Active),
                eq(None::<String>),
            )
            .times(1)
            .returning(|_, _, _, _, _| Ok(token_data("a", TokenState::Active, Some("z"), Some("z"))));

        let token = store(dao, "a").create_token().await.unwrap();

        assert_eq!(token.id(), &TokenId::from("a"));
        assert!(token.last_created());
        assert!(token.last_mismatch());
    }

    #[tokio::test]
    async fn test_complete_token_superseded() {
        let mut dao = MockTokenDao::new();
        dao.expect_update_token()
            .with(always(), always(), always(), eq(TokenState::Active), always())
            .returning(|_, _, _, _, _| Ok(token_data("a", TokenState::Active, None, None)));
        // "b" was created after "a": the ACTIVE pointer names "b"
        dao.expect_update_token()
            .with(always(), always(), always(), eq(TokenState::Done), eq(Some("{}".to_string())))
            .returning(|_, _, _, _, _| Ok(token_data("a", TokenState::Done, Some("b"), Some("b"))));

        let store = store(dao, "a");
        let active = store.create_token().await.unwrap();
        let done = store.complete_token(&active, Some("{}".into())).await.unwrap();

        assert_eq!(done.state(), TokenState::Done);
        assert!(!done.last_created());
        assert!(done.last_mismatch());
    }

    #[tokio::test]
    async fn test_complete_token_still_latest() {
        let mut dao = MockTokenDao::new();
        dao.expect_update_token()
            .with(always(), always(), always(), eq(TokenState::Active), always())
            .returning(|_, _, _, _, _| Ok(token_data("a", TokenState::Active, None, None)));
        dao.expect_update_token()
            .with(always(), always(), always(), eq(TokenState::Done), always())
            .returning(|_, _, _, _, _| Ok(token_data("a", TokenState::Done, Some("a"), Some("a"))));

        let store = store(dao, "a");
        let active = store.create_token().await.unwrap();
        let done = store.complete_token(&active, None).await.unwrap();

        assert!(done.last_created());
        assert!(!done.last_mismatch());
    }

    #[tokio::test]
    async fn test_lookup_reports_state_as_data() {
        let mut dao = MockTokenDao::new();
        dao.expect_get_token()
            .times(1)
            .returning(|_, _, _| Ok(token_data("a", TokenState::Done, Some("a"), Some("a"))));

        let token = store(dao, "a").lookup_token(&TokenId::from("a")).await.unwrap();

        assert_eq!(token.state(), TokenState::Done);
        assert!(token.last_created());
        assert!(token.clone().into_active().is_err());
        assert!(token.into_done().is_ok());
    }

    #[tokio::test]
    async fn test_lookup_propagates_not_found() {
        let mut dao = MockTokenDao::new();
        dao.expect_get_token().returning(|doc, ns, id| {
            Err(RelayError::TokenNotFound {
                document_id: doc,
                namespace: ns.clone(),
                token_id: id.clone(),
            })
        });

        let err = store(dao, "a")
            .lookup_token(&TokenId::from("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::TokenNotFound { .. }));
    }

    #[tokio::test]
    async fn test_transition_rejects_foreign_token() {
        let mut dao = MockTokenDao::new();
        dao.expect_update_token()
            .with(always(), always(), always(), eq(TokenState::Active), always())
            .returning(|_, _, _, _, _| Ok(token_data("a", TokenState::Active, None, None)));

        let store = store(dao, "a");
        let active = store.create_token().await.unwrap();

        let other = TokenStore::new(
            Arc::new(MockTokenDao::new()),
            DocumentId::new(1000),
            TokenNamespace::from("other"),
            Arc::new(|| TokenId::from("x")),
        );
        let err = other.complete_token(&active, None).await.unwrap_err();
        assert!(matches!(err, RelayError::Internal(_)));
    }
}
