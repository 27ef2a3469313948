//! # Request Manager
//!
//! The RequestManager layers a request/response pattern on top of the
//! fire-and-forget [`EventBus`]. A request is an [`EventType::Request`] event
//! carrying a fresh correlation id; the matching [`EventType::Response`]
//! event settles exactly the request with that id.
//!
//! ## Key Features
//!
//! - **Correlation**: the correlation id, not the topic, is the unit of
//!   matching, so concurrent requests on one topic never cross-resolve.
//! - **Timeouts**: every request has a budget. Expiry removes the pending
//!   entry, so a response arriving later is dropped instead of settling twice.
//! - **Cancellation**: a [`CancellationToken`] in [`RequestOptions`], dropping
//!   the request future, or [`RequestManager::cancel_all`] all remove the
//!   pending entry.
//! - **Error propagation**: a responder's `Err` or panic reaches the caller as
//!   [`RequestError::Handler`] with the original kind and message.
//!
//! ## Implementation Details
//!
//! Each pending request owns a oneshot sender. A topic has one response
//! listener while at least one request on it is in flight; the listener looks
//! the correlation id up and forwards the outcome through the oneshot
//! channel. The last request to finish takes the listener off the bus.
//!
//! Responders that finish without suspending answer inline, inside the
//! `emit` of the request. Responders that suspend continue on the tokio
//! runtime and emit their response when done.

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use dashmap::DashMap;
use futures::FutureExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace, warn};
use uuid::Uuid;

use super::{
    event_bus::{Detach, Event, EventBus, Handler, HandlerError, Payload},
    event_type::EventType,
};

pub type CorrelationId = Uuid;

/// Payload of a request event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub correlation_id: CorrelationId,
    pub payload: Payload,
}

/// Payload of a response event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub correlation_id: CorrelationId,
    pub outcome: ResponseOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResponseOutcome {
    Success { value: Payload },
    Failure { error: HandlerError },
}

enum Settlement {
    Responded(ResponseOutcome),
    Cancelled(String),
}

/// One in-flight request.
struct PendingRequest {
    sender: oneshot::Sender<Settlement>,
    topic: String,
    issued_at: Instant,
}

/// The bus listener for one topic's responses, shared by its in-flight
/// requests.
struct ResponseListener {
    handler: Handler,
    in_flight: usize,
}

/// Removes the pending entry and releases the topic's response listener
/// however the request future ends: settled, timed out, cancelled or dropped.
struct PendingGuard<'a> {
    manager: &'a RequestManager,
    topic: &'a str,
    correlation_id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.manager.pending_requests.remove(&self.correlation_id);
        self.manager.release_response_listener(self.topic);
    }
}

/// Per-call options for [`RequestManager::request`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides the manager's default timeout.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    /// Fail with [`RequestError::Unroutable`] right away when nobody responds
    /// to the topic, instead of waiting for the timeout.
    pub fail_fast: bool,
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_timeout_ms(self, millis: u64) -> Self {
        self.with_timeout(Duration::from_millis(millis))
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }
}

/// # Request Manager
///
/// Owns the pending-request table for one [`EventBus`].
pub struct RequestManager {
    event_bus: Arc<EventBus>,
    pending_requests: Arc<DashMap<CorrelationId, PendingRequest>>,
    response_listeners: DashMap<String, ResponseListener>,
    default_timeout: Duration,
    fail_fast_unroutable: bool,
}

impl RequestManager {
    pub fn new(event_bus: Arc<EventBus>, timeout: Duration) -> Self {
        Self {
            event_bus,
            pending_requests: Arc::new(DashMap::new()),
            response_listeners: DashMap::new(),
            default_timeout: timeout,
            fail_fast_unroutable: false,
        }
    }

    /// Makes every request on a topic without responders fail with
    /// [`RequestError::Unroutable`] instead of timing out.
    pub fn with_fail_fast_unroutable(mut self, fail_fast: bool) -> Self {
        self.fail_fast_unroutable = fail_fast;
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn pending_count(&self) -> usize {
        self.pending_requests.len()
    }

    pub fn responder_count(&self, topic: &str) -> usize {
        self.event_bus.listener_count(&EventType::request(topic))
    }

    /// Emits a request on `topic` and waits for the response carrying the
    /// same correlation id.
    ///
    /// # Errors
    ///
    /// * [`RequestError::Timeout`] - no response within the budget
    /// * [`RequestError::Handler`] - the responder returned an error or panicked
    /// * [`RequestError::Unroutable`] - no responder, with fail-fast enabled
    /// * [`RequestError::Cancelled`] - cancelled by token or [`cancel_all`](Self::cancel_all)
    #[instrument(skip(self, payload, options))]
    pub async fn request(
        &self,
        topic: &str,
        payload: Payload,
        options: RequestOptions,
    ) -> RequestResult<Payload> {
        let request_type = EventType::request(topic);
        if (options.fail_fast || self.fail_fast_unroutable)
            && !self.event_bus.has_listeners(&request_type)
        {
            return Err(RequestError::Unroutable {
                topic: topic.to_string(),
            });
        }
        let timeout = options.timeout.unwrap_or(self.default_timeout);

        let correlation_id = Uuid::new_v4();
        let envelope = serde_json::to_value(RequestEnvelope {
            correlation_id,
            payload,
        })?;
        self.acquire_response_listener(topic);
        let _pending = PendingGuard {
            manager: self,
            topic,
            correlation_id,
        };
        let (tx, rx) = oneshot::channel();
        self.pending_requests.insert(
            correlation_id,
            PendingRequest {
                sender: tx,
                topic: topic.to_string(),
                issued_at: Instant::now(),
            },
        );

        self.event_bus.emit(Event::new(request_type, envelope));

        let cancelled = async {
            match &options.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            settlement = rx => match settlement {
                Ok(Settlement::Responded(ResponseOutcome::Success { value })) => Ok(value),
                Ok(Settlement::Responded(ResponseOutcome::Failure { error })) => {
                    Err(RequestError::Handler {
                        topic: topic.to_string(),
                        kind: error.kind,
                        message: error.message,
                    })
                }
                Ok(Settlement::Cancelled(reason)) => Err(RequestError::Cancelled {
                    topic: topic.to_string(),
                    reason,
                }),
                Err(_) => Err(RequestError::ChannelClosed),
            },
            _ = cancelled => Err(RequestError::Cancelled {
                topic: topic.to_string(),
                reason: "cancelled by caller".to_string(),
            }),
            _ = tokio::time::sleep(timeout) => {
                debug!(%correlation_id, ?timeout, "Request timed out");
                Err(RequestError::Timeout {
                    topic: topic.to_string(),
                    correlation_id,
                    timeout,
                })
            }
        }
    }

    /// Typed wrapper around [`request`](Self::request).
    pub async fn call<P, R>(&self, topic: &str, payload: &P, options: RequestOptions) -> RequestResult<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_value(payload)?;
        let value = self.request(topic, payload, options).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Answers requests on `topic` with `handler`.
    ///
    /// The returned [`Detach`] unsubscribes only this responder. When several
    /// responders share a topic the first answer wins and later ones are
    /// dropped as stale.
    pub fn respond<F, Fut>(&self, topic: &str, handler: F) -> Detach
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let bus = Arc::downgrade(&self.event_bus);
        let topic_name = topic.to_string();

        let on_request = Handler::new(move |event| {
            let RequestEnvelope {
                correlation_id,
                payload,
            } = event.payload_as()?;
            let handler = handler.clone();
            let answer = AssertUnwindSafe(async move { handler(payload).await })
                .catch_unwind()
                .map(|result| match result {
                    Ok(Ok(value)) => ResponseOutcome::Success { value },
                    Ok(Err(error)) => ResponseOutcome::Failure { error },
                    Err(panic) => ResponseOutcome::Failure {
                        error: HandlerError::panicked(panic.as_ref()),
                    },
                });
            let mut answer = Box::pin(answer);

            if let Some(outcome) = (&mut answer).now_or_never() {
                reply(&bus, &topic_name, correlation_id, outcome);
                return Ok(());
            }
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let bus = bus.clone();
                    let topic_name = topic_name.clone();
                    runtime.spawn(async move {
                        let outcome = answer.await;
                        reply(&bus, &topic_name, correlation_id, outcome);
                    });
                }
                Err(err) => reply(
                    &bus,
                    &topic_name,
                    correlation_id,
                    ResponseOutcome::Failure {
                        error: HandlerError::internal(format!(
                            "async responder requires a tokio runtime: {}",
                            err
                        )),
                    },
                ),
            }
            Ok(())
        });

        self.event_bus
            .subscribe(EventType::request(topic), on_request)
    }

    /// [`respond`](Self::respond) for handlers that never suspend.
    pub fn respond_fn<F>(&self, topic: &str, handler: F) -> Detach
    where
        F: Fn(Payload) -> Result<Payload, HandlerError> + Send + Sync + 'static,
    {
        self.respond(topic, move |payload| std::future::ready(handler(payload)))
    }

    /// Settles every pending request with [`RequestError::Cancelled`].
    pub fn cancel_all(&self, reason: &str) -> usize {
        let ids: Vec<CorrelationId> = self
            .pending_requests
            .iter()
            .map(|entry| *entry.key())
            .collect();
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, pending)) = self.pending_requests.remove(&id) {
                debug!(correlation_id = %id, topic = %pending.topic, "Cancelling pending request");
                let _ = pending.sender.send(Settlement::Cancelled(reason.to_string()));
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Number of topics that currently have a response listener on the bus.
    pub fn response_listener_count(&self) -> usize {
        self.response_listeners.len()
    }

    fn acquire_response_listener(&self, topic: &str) {
        let mut listener = self
            .response_listeners
            .entry(topic.to_string())
            .or_insert_with(|| {
                let pending = Arc::clone(&self.pending_requests);
                let handler = Handler::new(move |event| {
                    let envelope: ResponseEnvelope = event.payload_as()?;
                    settle(&pending, envelope);
                    Ok(())
                });
                self.event_bus.on(EventType::response(topic), &handler);
                ResponseListener {
                    handler,
                    in_flight: 0,
                }
            });
        listener.in_flight += 1;
    }

    fn release_response_listener(&self, topic: &str) {
        let released = self.response_listeners.remove_if_mut(topic, |_, listener| {
            listener.in_flight = listener.in_flight.saturating_sub(1);
            listener.in_flight == 0
        });
        if let Some((_, listener)) = released {
            self.event_bus
                .off(&EventType::response(topic), &listener.handler);
            trace!(topic, "Response listener released");
        }
    }
}

impl Drop for RequestManager {
    fn drop(&mut self) {
        for entry in self.response_listeners.iter() {
            self.event_bus
                .off(&EventType::response(entry.key()), &entry.value().handler);
        }
    }
}

fn settle(pending: &DashMap<CorrelationId, PendingRequest>, envelope: ResponseEnvelope) {
    match pending.remove(&envelope.correlation_id) {
        Some((_, request)) => {
            trace!(
                correlation_id = %envelope.correlation_id,
                topic = %request.topic,
                elapsed = ?request.issued_at.elapsed(),
                "Response matched"
            );
            if request
                .sender
                .send(Settlement::Responded(envelope.outcome))
                .is_err()
            {
                debug!(correlation_id = %envelope.correlation_id, "Requester went away before the response");
            }
        }
        None => {
            warn!(
                correlation_id = %envelope.correlation_id,
                "Dropping response for unknown or expired request"
            );
        }
    }
}

fn reply(bus: &Weak<EventBus>, topic: &str, correlation_id: CorrelationId, outcome: ResponseOutcome) {
    let Some(bus) = bus.upgrade() else {
        return;
    };
    match serde_json::to_value(ResponseEnvelope {
        correlation_id,
        outcome,
    }) {
        Ok(payload) => bus.emit(Event::new(EventType::response(topic), payload)),
        Err(err) => error!(%correlation_id, "Failed to encode response: {}", err),
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Request timed out: {topic} ({correlation_id}) after {timeout:?}")]
    Timeout {
        topic: String,
        correlation_id: CorrelationId,
        timeout: Duration,
    },
    #[error("Responder for {topic} failed: [{kind}] {message}")]
    Handler {
        topic: String,
        kind: String,
        message: String,
    },
    #[error("No responder registered for {topic}")]
    Unroutable { topic: String },
    #[error("Request cancelled: {topic}: {reason}")]
    Cancelled { topic: String, reason: String },
    #[error("Response channel closed")]
    ChannelClosed,
    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RequestError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_unroutable(&self) -> bool {
        matches!(self, Self::Unroutable { .. })
    }

    /// The responder's error kind, if the responder failed.
    pub fn handler_kind(&self) -> Option<&str> {
        match self {
            Self::Handler { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

/// Lets a responder that makes nested requests pass failures through.
impl From<RequestError> for HandlerError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::Handler { kind, message, .. } => HandlerError::new(kind, message),
            RequestError::Timeout { .. } => HandlerError::new("timeout", err.to_string()),
            RequestError::Unroutable { .. } => HandlerError::new("unroutable", err.to_string()),
            RequestError::Cancelled { .. } => HandlerError::new("cancelled", err.to_string()),
            RequestError::Serialization(_) => HandlerError::invalid_payload(err.to_string()),
            RequestError::ChannelClosed => HandlerError::internal(err.to_string()),
        }
    }
}

pub type RequestResult<T> = Result<T, RequestError>;

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    fn setup() -> (Arc<EventBus>, Arc<RequestManager>) {
        let event_bus = Arc::new(EventBus::new());
        let manager = Arc::new(RequestManager::new(
            event_bus.clone(),
            Duration::from_secs(5),
        ));
        (event_bus, manager)
    }

    fn sum(payload: Payload) -> Result<Payload, HandlerError> {
        let a = payload["a"]
            .as_i64()
            .ok_or_else(|| HandlerError::invalid_payload("a is required"))?;
        let b = payload["b"]
            .as_i64()
            .ok_or_else(|| HandlerError::invalid_payload("b is required"))?;
        Ok(json!(a + b))
    }

    #[tokio::test]
    async fn test_request_response_success() {
        let (_, manager) = setup();
        let _responder = manager.respond_fn("sum", sum);

        let result = manager
            .request("sum", json!({ "a": 2, "b": 3 }), RequestOptions::default())
            .await
            .unwrap();

        assert_eq!(result, json!(5));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_typed_call() {
        #[derive(Serialize)]
        struct Operands {
            a: i64,
            b: i64,
        }
        let (_, manager) = setup();
        let _responder = manager.respond_fn("sum", sum);

        let total: i64 = manager
            .call("sum", &Operands { a: 20, b: 22 }, RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(total, 42);
    }

    #[tokio::test]
    async fn test_request_timeout_clears_pending() {
        let (_, manager) = setup();

        let started = Instant::now();
        let result = manager
            .request("slow", json!({}), RequestOptions::default().with_timeout_ms(10))
            .await;

        assert!(matches!(result, Err(RequestError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_never_cross_resolve() {
        let (_, manager) = setup();
        // 最初のリクエストの方が遅く応答する
        let _responder = manager.respond("sum", |payload: Value| async move {
            let delay = if payload["a"] == json!(1) { 30 } else { 5 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            sum(payload)
        });

        let (first, second) = tokio::join!(
            manager.request("sum", json!({ "a": 1, "b": 2 }), RequestOptions::default()),
            manager.request("sum", json!({ "a": 10, "b": 20 }), RequestOptions::default()),
        );

        assert_eq!(first.unwrap(), json!(3));
        assert_eq!(second.unwrap(), json!(30));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_responder_error_is_delivered() {
        let (_, manager) = setup();
        let _responder = manager.respond_fn("sum", sum);

        let err = manager
            .request("sum", json!({ "a": 1 }), RequestOptions::default())
            .await
            .unwrap_err();

        match err {
            RequestError::Handler { kind, message, .. } => {
                assert_eq!(kind, "invalid_payload");
                assert_eq!(message, "b is required");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_responder_panic_is_delivered() {
        let (_, manager) = setup();
        let _responder = manager.respond_fn("explode", |_| panic!("kaboom"));

        let err = manager
            .request("explode", Value::Null, RequestOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.handler_kind(), Some("panic"));
        assert!(err.to_string().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_unroutable_fail_fast() {
        let (_, manager) = setup();
        let err = manager
            .request("nobody", Value::Null, RequestOptions::default().fail_fast())
            .await
            .unwrap_err();
        assert!(err.is_unroutable());

        let event_bus = Arc::new(EventBus::new());
        let strict = RequestManager::new(event_bus, Duration::from_secs(5))
            .with_fail_fast_unroutable(true);
        let err = strict
            .request("nobody", Value::Null, RequestOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_unroutable());
    }

    #[tokio::test]
    async fn test_cancel_token() {
        let (_, manager) = setup();
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = manager
            .request(
                "never",
                Value::Null,
                RequestOptions::default().with_cancel(token),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RequestError::Cancelled { .. }));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_request_clears_pending() {
        let (_, manager) = setup();
        let requester = manager.clone();
        let task = tokio::spawn(async move {
            requester
                .request(
                    "never",
                    Value::Null,
                    RequestOptions::default().with_timeout(Duration::from_secs(30)),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.pending_count(), 1);

        task.abort();
        let _ = task.await;
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let (_, manager) = setup();
        let requester = manager.clone();
        let task = tokio::spawn(async move {
            requester
                .request("never", Value::Null, RequestOptions::default())
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(manager.cancel_all("shutdown"), 1);
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, RequestError::Cancelled { reason, .. } if reason == "shutdown"));
    }

    #[tokio::test]
    async fn test_late_response_cannot_settle_expired_request() {
        let (event_bus, manager) = setup();
        let _responder = manager.respond("echo", |payload: Value| async move {
            let delay = payload["delay_ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(payload["value"].clone())
        });

        let err = manager
            .request(
                "echo",
                json!({ "delay_ms": 30, "value": "late" }),
                RequestOptions::default().with_timeout_ms(10),
            )
            .await
            .unwrap_err();
        let expired = match &err {
            RequestError::Timeout { correlation_id, .. } => *correlation_id,
            other => panic!("expected timeout, got {}", other),
        };
        assert_eq!(manager.pending_count(), 0);

        // 遅れて届くレスポンスを待つ
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(manager.pending_count(), 0);

        let requester = manager.clone();
        let next = tokio::spawn(async move {
            requester
                .request(
                    "echo",
                    json!({ "delay_ms": 20, "value": "fresh" }),
                    RequestOptions::default(),
                )
                .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        // 期限切れのIDで返答しても次のリクエストは解決されない
        let stale = ResponseEnvelope {
            correlation_id: expired,
            outcome: ResponseOutcome::Success { value: json!("late") },
        };
        event_bus.emit(Event::new(
            EventType::response("echo"),
            serde_json::to_value(stale).unwrap(),
        ));
        assert_eq!(manager.pending_count(), 1);

        assert_eq!(next.await.unwrap().unwrap(), json!("fresh"));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_response_listener_released_after_last_request() {
        let (event_bus, manager) = setup();
        let _responder = manager.respond("echo", |payload: Value| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(payload)
        });

        let (a, b) = tokio::join!(
            manager.request("echo", json!(1), RequestOptions::default()),
            manager.request("echo", json!(2), RequestOptions::default()),
        );
        assert_eq!(a.unwrap(), json!(1));
        assert_eq!(b.unwrap(), json!(2));
        assert_eq!(manager.response_listener_count(), 0);
        assert!(!event_bus.has_listeners(&EventType::response("echo")));

        let err = manager
            .request("nobody", Value::Null, RequestOptions::default().with_timeout_ms(5))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(manager.response_listener_count(), 0);
        assert_eq!(event_bus.total_listeners(), 1);
    }

    #[tokio::test]
    async fn test_detached_responder_stops_answering() {
        let (_, manager) = setup();
        let mut responder = manager.respond_fn("sum", sum);
        assert_eq!(manager.responder_count("sum"), 1);

        responder.detach();

        assert_eq!(manager.responder_count("sum"), 0);
        let err = manager
            .request("sum", json!({ "a": 1, "b": 1 }), RequestOptions::default().with_timeout_ms(10))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_request_error_into_handler_error() {
        let err = RequestError::Handler {
            topic: "data.update_profile".to_string(),
            kind: "mutation.not_found".to_string(),
            message: "missing".to_string(),
        };
        let converted: HandlerError = err.into();
        assert_eq!(converted, HandlerError::new("mutation.not_found", "missing"));

        let converted: HandlerError = RequestError::Unroutable {
            topic: "x".to_string(),
        }
        .into();
        assert_eq!(converted.kind, "unroutable");
    }
}
