//! Trait definitions for quote-relay storage seams

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use rand::RngCore;
use uuid::Uuid;

use crate::domain::{DeltaDocument, DocumentId, TokenData, TokenId, TokenNamespace, TokenState};

use super::Result;

/// Durable token storage.
///
/// Implementations own the per-namespace "last" pointers (last token
/// written, last token to enter each state). Reading the previous pointers
/// and writing the new state must happen as one atomic operation; no caller
/// may cache pointer state.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenDao: Send + Sync {
    /// Read a token and the namespace's current pointers
    ///
    /// Fails with `TokenNotFound` if the token does not exist.
    async fn get_token(
        &self,
        document_id: DocumentId,
        namespace: &TokenNamespace,
        token_id: &TokenId,
    ) -> Result<TokenData>;

    /// Write a new state for a token, returning the pointers as they were
    /// before the write
    ///
    /// Writing `Active` for an unknown id creates the token. Writes not
    /// permitted by the token state machine fail with
    /// `InvalidStateTransition` and change nothing.
    async fn update_token(
        &self,
        document_id: DocumentId,
        namespace: &TokenNamespace,
        token_id: &TokenId,
        state: TokenState,
        data: Option<String>,
    ) -> Result<TokenData>;
}

/// Source of token identifiers.
///
/// Ids must be unique at least within a namespace.
pub trait TokenIdGenerator: Send + Sync {
    fn generate(&self) -> TokenId;
}

/// Random 128-bit hex token ids
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomTokenIdGenerator;

impl TokenIdGenerator for RandomTokenIdGenerator {
    fn generate(&self) -> TokenId {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        TokenId::new(hex::encode(bytes))
    }
}

impl<F> TokenIdGenerator for F
where
    F: Fn() -> TokenId + Send + Sync,
{
    fn generate(&self) -> TokenId {
        self()
    }
}

/// Durable queue of unpublished deltas, read by the publisher.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeltaSource: Send + Sync {
    /// Documents with unpublished deltas, excluding error-flagged documents,
    /// least recently modified first
    async fn unpublished_documents(&self, limit: usize) -> Result<Vec<DeltaDocument>>;

    /// Record that a delta reached the broker
    async fn mark_published(&self, document_id: DocumentId, delta_id: Uuid) -> Result<()>;

    /// Flag a document so it is skipped until the flag is cleared
    async fn flag_error(&self, document_id: DocumentId, reason: &str) -> Result<()>;

    /// Clear a document's error flag; returns whether a flag was set
    async fn clear_error(&self, document_id: DocumentId) -> Result<bool>;
}
