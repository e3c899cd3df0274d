//! Token store integration tests.
//!
//! Drive the typed token store over the in-memory DAO and check the
//! precedence metadata and the lifecycle rules.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use quote_relay::infra::{MemoryTokenDao, RandomTokenIdGenerator, TokenDao};
use quote_relay::{AnyToken, RelayError, TokenId, TokenState, TokenStore};

use common::*;

fn store(dao: &Arc<MemoryTokenDao>) -> TokenStore {
    TokenStore::new(dao.clone(), test_document(), loc(), sequential_ids())
}

#[tokio::test]
async fn quote_location_scenario() {
    let dao = Arc::new(MemoryTokenDao::new());
    let store = store(&dao);

    let a = store.create_token().await.unwrap();
    let b = store.create_token().await.unwrap();
    assert!(a.last_created());
    assert!(b.last_created());

    let a_done = store.complete_token(&a, Some("\"A\"".into())).await.unwrap();
    assert!(!a_done.last_created());
    assert!(a_done.last_mismatch());

    let b_done = store.complete_token(&b, Some("\"B\"".into())).await.unwrap();
    assert!(b_done.last_created());

    let accepted = store.accept_token(&b_done, None).await.unwrap();
    assert_eq!(accepted.state(), TokenState::Accepted);
    let killed = store.kill_token(&a_done, None).await.unwrap();
    assert_eq!(killed.state(), TokenState::Dead);

    // each token leaves DONE exactly once
    let err = store.kill_token(&b_done, None).await.unwrap_err();
    assert!(matches!(err, RelayError::InvalidStateTransition { to: TokenState::Dead, .. }));
    let err = store.accept_token(&a_done, None).await.unwrap_err();
    assert!(matches!(err, RelayError::InvalidStateTransition { to: TokenState::Accepted, .. }));

    let states = dao.states(test_document(), &loc()).await;
    assert_eq!(states[a.id()], TokenState::Dead);
    assert_eq!(states[b.id()], TokenState::Accepted);
}

#[tokio::test]
async fn completion_order_does_not_change_precedence() {
    let dao = Arc::new(MemoryTokenDao::new());
    let store = store(&dao);

    let a = store.create_token().await.unwrap();
    let b = store.create_token().await.unwrap();

    // newer request finishes first
    let b_done = store.complete_token(&b, None).await.unwrap();
    let a_done = store.complete_token(&a, None).await.unwrap();

    assert!(b_done.last_created());
    assert!(!a_done.last_created());
}

#[tokio::test]
async fn only_newest_token_is_last_created() {
    let dao = Arc::new(MemoryTokenDao::new());
    let store = store(&dao);

    let mut ids = Vec::new();
    for _ in 0..5 {
        let token = store.create_token().await.unwrap();
        assert!(token.last_created());
        ids.push(token.id().clone());

        let mut last_created = Vec::new();
        for id in &ids {
            if let AnyToken::Active(t) = store.lookup_token(id).await.unwrap() {
                if t.last_created() {
                    last_created.push(t.id().clone());
                }
            }
        }
        assert_eq!(last_created, vec![token.id().clone()]);
    }
}

#[tokio::test]
async fn namespaces_and_documents_are_independent() {
    let dao = Arc::new(MemoryTokenDao::new());
    let loc_store = store(&dao);
    let rate_store = TokenStore::new(dao.clone(), test_document(), "rate".into(), sequential_ids());
    let other_doc = TokenStore::new(
        dao.clone(),
        quote_relay::DocumentId::new(1001),
        loc(),
        sequential_ids(),
    );

    let a = loc_store.create_token().await.unwrap();
    rate_store.create_token().await.unwrap();
    other_doc.create_token().await.unwrap();

    let done = loc_store.complete_token(&a, None).await.unwrap();
    assert!(done.last_created());
    assert!(!done.last_mismatch());
}

#[tokio::test]
async fn lookup_narrows_to_stored_state() {
    let dao = Arc::new(MemoryTokenDao::new());
    let store = store(&dao);

    let a = store.create_token().await.unwrap();
    let done = store.complete_token(&a, Some("{\"zip\":\"12345\"}".into())).await.unwrap();

    let found = store.lookup_token(done.id()).await.unwrap();
    assert_eq!(found.state(), TokenState::Done);
    let narrowed = found.clone().into_done().unwrap();
    assert_eq!(narrowed.data(), Some("{\"zip\":\"12345\"}"));

    let mismatch = found.into_active().unwrap_err();
    assert_eq!(mismatch.expected, TokenState::Active);
    assert_eq!(mismatch.actual, TokenState::Done);

    let missing = store.lookup_token(&TokenId::from("nope")).await.unwrap_err();
    assert!(matches!(missing, RelayError::TokenNotFound { .. }));
}

#[tokio::test]
async fn dao_rejects_out_of_order_writes() {
    let dao = MemoryTokenDao::new();
    let id = TokenId::from("x");

    let err = dao
        .update_token(test_document(), &loc(), &id, TokenState::Done, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::InvalidStateTransition { .. }));
    assert!(dao.states(test_document(), &loc()).await.is_empty());

    dao.update_token(test_document(), &loc(), &id, TokenState::Active, None)
        .await
        .unwrap();
    let err = dao
        .update_token(test_document(), &loc(), &id, TokenState::Active, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::InvalidStateTransition { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_leave_one_newest_token() {
    let dao = Arc::new(MemoryTokenDao::new());
    let store = TokenStore::new(
        dao.clone(),
        test_document(),
        loc(),
        Arc::new(RandomTokenIdGenerator),
    );

    let creates: Vec<_> = (0..32)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.create_token().await.unwrap() })
        })
        .collect();
    let mut active = Vec::new();
    for handle in creates {
        active.push(handle.await.unwrap());
    }

    let completes: Vec<_> = active
        .into_iter()
        .map(|token| {
            let store = store.clone();
            tokio::spawn(async move { store.complete_token(&token, None).await.unwrap() })
        })
        .collect();
    let mut done = Vec::new();
    for handle in completes {
        done.push(handle.await.unwrap());
    }

    let ids: HashSet<TokenId> = done.iter().map(|t| t.id().clone()).collect();
    assert_eq!(ids.len(), 32);

    // only the newest creation completes as last created
    let winners: Vec<_> = done.iter().filter(|t| t.last_created()).collect();
    assert_eq!(winners.len(), 1);

    for token in &done {
        if token.last_created() {
            store.accept_token(token, None).await.unwrap();
        } else {
            store.kill_token(token, None).await.unwrap();
        }
    }
    assert!(all_terminal(&dao, test_document(), &loc()).await);
}
