//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tokio::sync::{oneshot, Mutex};

use quote_relay::infra::broker::{BrokerConfig, MemoryBroker, ResilientBroker};
use quote_relay::infra::retry::RecordingSleeper;
use quote_relay::infra::{MemoryDeltaStore, MemoryTokenDao, RequestOperation, TokenIdGenerator};
use quote_relay::{DeltaKind, DocumentId, DocumentMeta, PendingDelta, TokenId, TokenNamespace, TokenState};

/// Document used across scenarios
pub fn test_document() -> DocumentId {
    DocumentId::new(1000)
}

/// Namespace used across scenarios
pub fn loc() -> TokenNamespace {
    TokenNamespace::from("loc")
}

/// Token ids `t1`, `t2`, ... in creation order
pub fn sequential_ids() -> Arc<dyn TokenIdGenerator> {
    let next = AtomicU64::new(1);
    Arc::new(move || TokenId::new(format!("t{}", next.fetch_add(1, Ordering::SeqCst))))
}

/// Poll until the namespace holds `count` tokens
pub async fn wait_for_tokens(
    dao: &MemoryTokenDao,
    document_id: DocumentId,
    namespace: &TokenNamespace,
    count: usize,
) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while dao.states(document_id, namespace).await.len() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("tokens were not created in time");
}

/// Whether every token in the namespace is ACCEPTED or DEAD
pub async fn all_terminal(
    dao: &MemoryTokenDao,
    document_id: DocumentId,
    namespace: &TokenNamespace,
) -> bool {
    dao.states(document_id, namespace)
        .await
        .values()
        .all(TokenState::is_terminal)
}

/// Operation whose calls block until released by the test
///
/// Input is the call number; output is `"response-<n>"`. Releasing with
/// `Err` makes the call fail with that message.
#[derive(Default)]
pub struct GatedOperation {
    gates: Mutex<HashMap<u32, oneshot::Receiver<Result<(), String>>>>,
}

impl GatedOperation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register call `n`; the returned sender releases it
    pub async fn gate(&self, n: u32) -> oneshot::Sender<Result<(), String>> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().await.insert(n, rx);
        tx
    }
}

#[async_trait]
impl RequestOperation for GatedOperation {
    type Input = u32;
    type Output = String;
    type Error = String;

    async fn call(&self, n: u32) -> Result<String, String> {
        let gate = self.gates.lock().await.remove(&n);
        if let Some(gate) = gate {
            gate.await.map_err(|_| "gate dropped".to_string())??;
        }
        Ok(format!("response-{n}"))
    }
}

/// Broker config pointing at the in-memory broker
pub fn memory_broker_config(retries: u32) -> BrokerConfig {
    BrokerConfig {
        url: "memory://".into(),
        exchange: "quote.deltas".into(),
        retries,
        retry_wait: Duration::from_millis(100),
    }
}

/// Resilient broker over `memory` that records its waits instead of sleeping
pub fn resilient_broker(memory: &MemoryBroker, retries: u32) -> (ResilientBroker, Arc<RecordingSleeper>) {
    let sleeper = Arc::new(RecordingSleeper::new());
    let broker = ResilientBroker::with_sleeper(
        Arc::new(memory.clone()),
        memory_broker_config(retries),
        sleeper.clone(),
    );
    (broker, sleeper)
}

/// Store holding one document with `kinds.len()` pending deltas, 1ms apart
pub async fn store_with_deltas(kinds: &[DeltaKind]) -> (Arc<MemoryDeltaStore>, Vec<PendingDelta>) {
    let store = Arc::new(MemoryDeltaStore::new());
    let now = Utc::now();
    store
        .upsert_document(
            DocumentMeta::new(test_document(), now, now).with_entity("agency-7", "Acme Agency"),
            json!({"zip": "12345", "drivers": [{"age": 34, "name": "Ann"}], "__rev": 9}),
            None,
        )
        .await;

    let mut deltas = Vec::new();
    for (i, kind) in kinds.iter().enumerate() {
        let delta = PendingDelta::new(
            test_document(),
            kind.clone(),
            now + ChronoDuration::milliseconds(i as i64),
            json!({"zip": "12345"}),
        );
        store
            .append_delta(delta.clone())
            .await
            .expect("document exists");
        deltas.push(delta);
    }
    (store, deltas)
}
