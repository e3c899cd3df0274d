//! Postgres-backed integration tests.
//!
//! These are ignored by default and are intended to run in CI (or locally)
//! with `DATABASE_URL` set.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;

use quote_relay::infra::{
    DeltaSource, PgDeltaStore, PgTokenDao, RandomTokenIdGenerator, TokenDao, TokenStore,
};
use quote_relay::{
    DeltaKind, DocumentId, DocumentMeta, PendingDelta, RelayError, TokenId, TokenNamespace,
    TokenState,
};

async fn connect_db() -> Option<sqlx::PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&url)
        .await
        .ok()?;
    quote_relay::migrations::run_postgres(&pool).await.unwrap();
    Some(pool)
}

/// Document id unlikely to collide with other runs
fn fresh_document() -> DocumentId {
    DocumentId::new(rand::random::<u32>() as u64 + 1_000_000)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn postgres_token_scenario() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };

    let doc = fresh_document();
    let store = TokenStore::new(
        Arc::new(PgTokenDao::new(pool)),
        doc,
        TokenNamespace::from("loc"),
        Arc::new(RandomTokenIdGenerator),
    );

    let a = store.create_token().await.unwrap();
    let b = store.create_token().await.unwrap();
    let a_done = store.complete_token(&a, Some("\"A\"".into())).await.unwrap();
    let b_done = store.complete_token(&b, Some("\"B\"".into())).await.unwrap();

    assert!(!a_done.last_created());
    assert!(b_done.last_created());

    store.accept_token(&b_done, None).await.unwrap();
    store.kill_token(&a_done, None).await.unwrap();
    assert!(matches!(
        store.kill_token(&b_done, None).await,
        Err(RelayError::InvalidStateTransition { .. })
    ));

    let found = store.lookup_token(a.id()).await.unwrap();
    assert_eq!(found.state(), TokenState::Dead);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn postgres_concurrent_creates_serialize_pointers() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };

    let doc = fresh_document();
    let dao = Arc::new(PgTokenDao::new(pool));
    let namespace = TokenNamespace::from("loc");

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let dao = dao.clone();
            let namespace = namespace.clone();
            tokio::spawn(async move {
                let id = TokenId::new(format!("t{i}"));
                dao.update_token(doc, &namespace, &id, TokenState::Active, None)
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut previous = Vec::new();
    for task in tasks {
        previous.push(task.await.unwrap().prev_last);
    }

    // writes were serialized: each previous pointer was seen exactly once
    assert_eq!(previous.iter().filter(|p| p.is_none()).count(), 1);
    let seen: HashSet<_> = previous.iter().flatten().collect();
    assert_eq!(seen.len(), 15);
}

#[tokio::test]
#[ignore]
async fn postgres_delta_queue_flow() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };

    let store = PgDeltaStore::new(pool);
    let doc = fresh_document();
    let now = Utc::now();
    store
        .upsert_document(
            &DocumentMeta::new(doc, now, now),
            &json!({"zip": "12345"}),
            None,
        )
        .await
        .unwrap();

    let first = PendingDelta::new(doc, DeltaKind::data(), now, json!({"zip": "12345"}));
    let second = PendingDelta::new(
        doc,
        DeltaKind::ratedata(),
        now + Duration::milliseconds(5),
        json!({"premium": 812.5}),
    );
    store.append_delta(&second).await.unwrap();
    store.append_delta(&first).await.unwrap();

    let documents = store.unpublished_documents(1000).await.unwrap();
    let document = documents
        .iter()
        .find(|d| d.meta.id == doc)
        .expect("document is pending");
    let ids: Vec<_> = document.ordered_deltas().iter().map(|d| d.id).collect();
    assert_eq!(ids, vec![first.id, second.id]);

    store.mark_published(doc, first.id).await.unwrap();
    assert!(store.mark_published(doc, first.id).await.is_err());

    store.flag_error(doc, "schema violation").await.unwrap();
    let documents = store.unpublished_documents(1000).await.unwrap();
    assert!(documents.iter().all(|d| d.meta.id != doc));

    let pending = store.pending(1000).await.unwrap();
    let summary = pending
        .iter()
        .find(|s| s.document_id == doc.as_i64())
        .expect("flagged document is listed");
    assert_eq!(summary.pending, 1);
    assert_eq!(summary.error_flag.as_deref(), Some("schema violation"));

    assert!(store.clear_error(doc).await.unwrap());
    assert!(!store.clear_error(doc).await.unwrap());
}
