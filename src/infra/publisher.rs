//! Delta publisher
//!
//! Polls the delta source for documents with unpublished deltas, encodes
//! each delta and publishes it through the broker, then marks it published.
//!
//! Deltas of one document go out in timestamp order. The first failure
//! stops that document for the current cycle so later deltas never
//! overtake an earlier one:
//!
//! - transient failures (broker unavailable, database errors) leave the
//!   deltas pending for the next poll
//! - permanent failures (schema violations, unknown delta kinds) set the
//!   document's error flag, which hides it until an operator clears it
//!
//! A delta that was published but could not be marked is deferred too; it
//! is published again on a later poll, so delivery is at-least-once.
//!
//! Nothing is buffered in memory; durable storage is the retry queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::domain::{DeltaDocument, DeltaRecord, DocumentId, PendingDelta};
use crate::metrics::{metric_names, timed, MetricsRegistry};
use crate::telemetry::{self, spans};

use super::broker::{MessageHeaders, ResilientBroker};
use super::encoder::{DeltaEncoder, EncodedEvent};
use super::{DeltaSource, Result, ShutdownSignal};

/// Message header names
pub mod headers {
    pub const EVENT_TYPE: &str = "event-type";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const SCHEMA_NAME: &str = "schema-name";
    pub const SCHEMA_VERSION: &str = "schema-version";
    pub const DOCUMENT_ID: &str = "document-id";
    pub const DELTA_ID: &str = "delta-id";
    pub const DELTA_KIND: &str = "delta-kind";
}

/// Publisher configuration
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Wait between polls
    pub poll_interval: Duration,
    /// Maximum documents fetched per poll
    pub batch_size: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

/// Running totals
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublisherStats {
    pub cycles: u64,
    pub deltas_published: u64,
    pub deltas_deferred: u64,
    pub documents_flagged: u64,
    pub last_error: Option<String>,
}

/// What happened to one document during a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentOutcome {
    /// Every pending delta was published
    Published { count: usize },
    /// A transient failure stopped the document; the rest stays pending
    Deferred { published: usize, error: String },
    /// A permanent failure flagged the document
    Flagged { published: usize, reason: String },
}

/// Result of one poll cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub outcomes: Vec<(DocumentId, DocumentOutcome)>,
}

impl CycleReport {
    pub fn published(&self) -> usize {
        self.outcomes
            .iter()
            .map(|(_, outcome)| match outcome {
                DocumentOutcome::Published { count } => *count,
                DocumentOutcome::Deferred { published, .. }
                | DocumentOutcome::Flagged { published, .. } => *published,
            })
            .sum()
    }
}

/// Polling delta publisher
pub struct DeltaPublisher {
    config: PublisherConfig,
    source: Arc<dyn DeltaSource>,
    encoder: Arc<DeltaEncoder>,
    broker: ResilientBroker,
    metrics: Option<Arc<MetricsRegistry>>,
    stats: RwLock<PublisherStats>,
}

impl DeltaPublisher {
    pub fn new(
        config: PublisherConfig,
        source: Arc<dyn DeltaSource>,
        encoder: Arc<DeltaEncoder>,
        broker: ResilientBroker,
    ) -> Self {
        Self {
            config,
            source,
            encoder,
            broker,
            metrics: None,
            stats: RwLock::new(PublisherStats::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn stats(&self) -> PublisherStats {
        self.stats.read().await.clone()
    }

    /// Poll until shutdown is signalled.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "starting delta publisher"
        );

        while !shutdown.is_shutdown() {
            if let Err(e) = self.publish_pending().await {
                warn!(error = %e, "publish cycle failed");
                self.stats.write().await.last_error = Some(e.to_string());
            }

            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("delta publisher stopped");
    }

    /// Run one poll cycle.
    ///
    /// Errors are failures of the delta source itself; publish failures are
    /// reported per document in the returned report.
    pub async fn publish_pending(&self) -> Result<CycleReport> {
        let span = info_span!(spans::PUBLISH_CYCLE, batch_size = self.config.batch_size);
        self.cycle().instrument(span).await
    }

    async fn cycle(&self) -> Result<CycleReport> {
        let documents = self
            .source
            .unpublished_documents(self.config.batch_size)
            .await?;

        if let Some(metrics) = &self.metrics {
            metrics.inc_counter(metric_names::PUBLISH_CYCLES).await;
            metrics
                .set_gauge(metric_names::PENDING_DOCUMENTS, documents.len() as u64)
                .await;
        }

        let mut report = CycleReport::default();
        for document in &documents {
            let outcome = self.publish_document(document).await?;
            report.outcomes.push((document.meta.id, outcome));
        }

        self.stats.write().await.cycles += 1;
        if !report.outcomes.is_empty() {
            debug!(
                documents = report.outcomes.len(),
                published = report.published(),
                "publish cycle complete"
            );
        }
        Ok(report)
    }

    async fn publish_document(&self, document: &DeltaDocument) -> Result<DocumentOutcome> {
        let span = info_span!(spans::PUBLISH_DOCUMENT, document_id = %document.meta.id);
        self.publish_deltas(document).instrument(span).await
    }

    async fn publish_deltas(&self, document: &DeltaDocument) -> Result<DocumentOutcome> {
        let document_id = document.meta.id;
        let mut published = 0;

        for delta in document.ordered_deltas() {
            match self.publish_delta(document, delta).await {
                Ok(()) => {
                    if let Err(e) = self.source.mark_published(document_id, delta.id).await {
                        warn!(delta_id = %delta.id, error = %e, "published delta not marked");
                        return Ok(self.defer(published, e.to_string()).await);
                    }
                    published += 1;
                    self.stats.write().await.deltas_published += 1;
                    self.count(metric_names::DELTAS_PUBLISHED).await;
                }
                Err(e) if e.is_transient() => {
                    warn!(delta_id = %delta.id, error = %e, "delta deferred");
                    return Ok(self.defer(published, e.to_string()).await);
                }
                Err(e) => {
                    let reason = e.to_string();
                    error!(delta_id = %delta.id, error = %reason, "flagging document");
                    self.source.flag_error(document_id, &reason).await?;
                    let mut stats = self.stats.write().await;
                    stats.documents_flagged += 1;
                    stats.last_error = Some(reason.clone());
                    drop(stats);
                    self.count(metric_names::DELTAS_FAILED).await;
                    self.count(metric_names::DOCUMENTS_FLAGGED).await;
                    return Ok(DocumentOutcome::Flagged { published, reason });
                }
            }
        }

        Ok(DocumentOutcome::Published { count: published })
    }

    async fn publish_delta(&self, document: &DeltaDocument, delta: &PendingDelta) -> Result<()> {
        let record = DeltaRecord::from_pending(document, delta);

        let encode = async {
            info_span!(spans::ENCODE_DELTA, delta_id = %delta.id)
                .in_scope(|| self.encoder.encode(&record))
        };
        let encoded = match &self.metrics {
            Some(metrics) => timed(metrics, metric_names::ENCODE_LATENCY, encode).await?,
            None => encode.await?,
        };

        let headers = self.headers(delta, &encoded);
        let span = info_span!(
            spans::BROKER_PUBLISH,
            delta_id = %delta.id,
            event_type = %encoded.event_type
        );
        let publish = self.broker.publish(&encoded.payload, &headers).instrument(span);
        match &self.metrics {
            Some(metrics) => timed(metrics, metric_names::PUBLISH_LATENCY, publish).await,
            None => publish.await,
        }
    }

    fn headers(&self, delta: &PendingDelta, encoded: &EncodedEvent) -> MessageHeaders {
        let schema = self.encoder.schema();
        let mut map = MessageHeaders::from([
            (headers::EVENT_TYPE.to_string(), encoded.event_type.clone()),
            (headers::CONTENT_TYPE.to_string(), encoded.content_type.to_string()),
            (headers::SCHEMA_NAME.to_string(), schema.name.clone()),
            (headers::SCHEMA_VERSION.to_string(), schema.version.to_string()),
            (headers::DOCUMENT_ID.to_string(), delta.document_id.to_string()),
            (headers::DELTA_ID.to_string(), delta.id.to_string()),
            (headers::DELTA_KIND.to_string(), delta.kind.to_string()),
        ]);
        telemetry::inject_trace_context(&mut map);
        map
    }

    async fn defer(&self, published: usize, error: String) -> DocumentOutcome {
        let mut stats = self.stats.write().await;
        stats.deltas_deferred += 1;
        stats.last_error = Some(error.clone());
        drop(stats);
        self.count(metric_names::DELTAS_FAILED).await;
        DocumentOutcome::Deferred { published, error }
    }

    async fn count(&self, name: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_counter(name).await;
        }
    }
}
