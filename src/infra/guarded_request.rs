//! Precedence-guarded requests
//!
//! Wraps a request/response operation so that, when several requests with
//! the same key overlap, only the most recently issued one delivers its
//! result. Every request is tracked by a token in the namespace named by
//! its key:
//!
//! 1. create an ACTIVE token
//! 2. run the underlying operation
//! 3. complete the token with the serialized response (or the error text)
//! 4. accept it if no newer token was created meanwhile, otherwise kill it
//!    and fail with [`GuardedRequestError::Superseded`]
//!
//! Every token reaches ACCEPTED or DEAD, including tokens of failed
//! requests, whose original error is returned unchanged.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::domain::{Active, DocumentId, Token, TokenNamespace};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::telemetry::spans;

use super::{RandomTokenIdGenerator, RelayError, TokenDao, TokenIdGenerator, TokenStore};

/// An asynchronous request/response operation
#[async_trait]
pub trait RequestOperation: Send + Sync {
    type Input: Send + 'static;
    type Output: Send + 'static;
    type Error: Send + 'static;

    async fn call(&self, input: Self::Input) -> Result<Self::Output, Self::Error>;
}

#[async_trait]
impl<T: RequestOperation> RequestOperation for Arc<T> {
    type Input = T::Input;
    type Output = T::Output;
    type Error = T::Error;

    async fn call(&self, input: Self::Input) -> Result<Self::Output, Self::Error> {
        (**self).call(input).await
    }
}

/// Completion callback handed to callback-style operations
pub type Completion<R, E> = Box<dyn FnOnce(Result<R, E>) + Send>;

/// Error of a callback-style operation
#[derive(Debug, thiserror::Error)]
pub enum CallbackError<E> {
    /// The operation reported a failure
    #[error("{0}")]
    Failed(E),
    /// The completion callback was dropped without being invoked
    #[error("completion callback dropped without being invoked")]
    Dropped,
}

/// Adapts an operation that reports completion through a callback into a
/// [`RequestOperation`].
///
/// The operation must invoke the callback exactly once; a callback that is
/// dropped uninvoked surfaces as [`CallbackError::Dropped`].
pub struct CallbackOperation<F, I, R, E> {
    operation: F,
    _types: PhantomData<fn(I) -> (R, E)>,
}

impl<F, I, R, E> CallbackOperation<F, I, R, E>
where
    F: Fn(I, Completion<R, E>) + Send + Sync,
{
    pub fn new(operation: F) -> Self {
        Self {
            operation,
            _types: PhantomData,
        }
    }
}

#[async_trait]
impl<F, I, R, E> RequestOperation for CallbackOperation<F, I, R, E>
where
    F: Fn(I, Completion<R, E>) + Send + Sync,
    I: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    type Input = I;
    type Output = R;
    type Error = CallbackError<E>;

    async fn call(&self, input: I) -> Result<R, CallbackError<E>> {
        let (tx, rx) = oneshot::channel();
        (self.operation)(
            input,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );

        match rx.await {
            Ok(result) => result.map_err(CallbackError::Failed),
            Err(_) => Err(CallbackError::Dropped),
        }
    }
}

/// Failure of a guarded request
#[derive(Debug, thiserror::Error)]
pub enum GuardedRequestError<E> {
    /// A newer request with the same key was issued before this one
    /// completed; its result was discarded.
    #[error("request superseded: {key}")]
    Superseded { key: String },

    /// Token bookkeeping failed
    #[error("request token error: {0}")]
    Token(#[from] RelayError),

    /// The underlying operation failed
    #[error("request failed: {0}")]
    Request(E),
}

impl<E> GuardedRequestError<E> {
    pub fn is_superseded(&self) -> bool {
        matches!(self, GuardedRequestError::Superseded { .. })
    }

    /// Key of the superseded request
    pub fn superseded_key(&self) -> Option<&str> {
        match self {
            GuardedRequestError::Superseded { key } => Some(key),
            _ => None,
        }
    }

    /// The underlying operation's error, unchanged
    pub fn into_request_error(self) -> Option<E> {
        match self {
            GuardedRequestError::Request(e) => Some(e),
            _ => None,
        }
    }
}

/// Request wrapper that discards superseded results
pub struct GuardedRequest<Op> {
    operation: Op,
    dao: Arc<dyn TokenDao>,
    document_id: DocumentId,
    id_generator: Arc<dyn TokenIdGenerator>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl<Op> GuardedRequest<Op>
where
    Op: RequestOperation,
    Op::Output: Serialize,
    Op::Error: fmt::Display,
{
    pub fn new(operation: Op, dao: Arc<dyn TokenDao>, document_id: DocumentId) -> Self {
        Self {
            operation,
            dao,
            document_id,
            id_generator: Arc::new(RandomTokenIdGenerator),
            metrics: None,
        }
    }

    pub fn with_id_generator(mut self, id_generator: Arc<dyn TokenIdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Issue a request under `key`.
    pub async fn request(
        &self,
        key: &str,
        input: Op::Input,
    ) -> Result<Op::Output, GuardedRequestError<Op::Error>> {
        let span = info_span!(spans::GUARDED_REQUEST, document_id = %self.document_id, key);
        self.guarded(key, input).instrument(span).await
    }

    async fn guarded(
        &self,
        key: &str,
        input: Op::Input,
    ) -> Result<Op::Output, GuardedRequestError<Op::Error>> {
        let store = TokenStore::new(
            self.dao.clone(),
            self.document_id,
            TokenNamespace::from(key),
            self.id_generator.clone(),
        );

        let token = store.create_token().await?;

        match self.operation.call(input).await {
            Ok(response) => {
                let data = match serde_json::to_string(&response) {
                    Ok(json) => Some(json),
                    Err(e) => {
                        warn!(error = %e, token_id = %token.id(), "response is not serializable");
                        None
                    }
                };

                let done = store.complete_token(&token, data).await?;
                let audit = done.data().map(str::to_owned);

                if done.last_created() {
                    store.accept_token(&done, audit).await?;
                    self.count(metric_names::REQUESTS_ACCEPTED).await;
                    Ok(response)
                } else {
                    store.kill_token(&done, audit).await?;
                    self.count(metric_names::REQUESTS_SUPERSEDED).await;
                    debug!(key, token_id = %done.id(), "discarding superseded response");
                    Err(GuardedRequestError::Superseded {
                        key: key.to_string(),
                    })
                }
            }
            Err(err) => {
                if let Err(e) = Self::terminate_failed(&store, &token, &err).await {
                    error!(
                        key,
                        token_id = %token.id(),
                        error = %e,
                        "failed to retire token of failed request"
                    );
                }
                self.count(metric_names::REQUESTS_FAILED).await;
                Err(GuardedRequestError::Request(err))
            }
        }
    }

    async fn terminate_failed(
        store: &TokenStore,
        token: &Token<Active>,
        err: &Op::Error,
    ) -> Result<(), RelayError> {
        let reason = Some(err.to_string());
        let done = store.complete_token(token, reason.clone()).await?;
        store.kill_token(&done, reason).await?;
        Ok(())
    }

    async fn count(&self, name: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_counter(name).await;
        }
    }
}
