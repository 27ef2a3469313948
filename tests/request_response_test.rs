use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use switchboard::event::{EventBus, HandlerError, RequestError, RequestManager, RequestOptions};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[ctor::ctor]
fn init_tests() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

#[derive(Debug, Serialize, Deserialize)]
struct Operands {
    a: i64,
    b: i64,
}

fn manager() -> RequestManager {
    RequestManager::new(Arc::new(EventBus::new()), Duration::from_secs(1))
}

fn add(payload: Value) -> Result<Value, HandlerError> {
    let Operands { a, b } = serde_json::from_value(payload)?;
    Ok(json!(a + b))
}

#[tokio::test]
async fn test_sum_round_trip() {
    let manager = manager();
    let _responder = manager.respond_fn("sum", add);

    let total: i64 = manager
        .call("sum", &Operands { a: 2, b: 3 }, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(total, 5);
    assert_eq!(manager.pending_count(), 0);
}

#[tokio::test]
async fn test_concurrent_requests_resolve_independently() {
    let manager = manager();
    let _responder = manager.respond("sum", |payload: Value| async move {
        // the first request answers last
        let delay = if payload["a"] == json!(1) { 25 } else { 1 };
        tokio::time::sleep(Duration::from_millis(delay)).await;
        add(payload)
    });

    let (small, large) = tokio::join!(
        manager.call::<_, i64>("sum", &Operands { a: 1, b: 2 }, RequestOptions::default()),
        manager.call::<_, i64>("sum", &Operands { a: 10, b: 20 }, RequestOptions::default()),
    );
    assert_eq!(small.unwrap(), 3);
    assert_eq!(large.unwrap(), 30);
    assert_eq!(manager.pending_count(), 0);
}

#[tokio::test]
async fn test_unanswered_request_times_out_and_cleans_up() {
    let manager = manager();
    let started = Instant::now();

    let err = manager
        .request("slow", json!({}), RequestOptions::default().with_timeout_ms(10))
        .await
        .unwrap_err();

    assert!(err.is_timeout(), "unexpected error: {}", err);
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(manager.pending_count(), 0);
}

#[tokio::test]
async fn test_error_kinds_are_distinguishable() {
    let manager = manager();
    let _responder = manager.respond_fn("divide", |payload| {
        let Operands { a, b } = serde_json::from_value(payload)?;
        if b == 0 {
            return Err(HandlerError::new("division_by_zero", "b must not be 0"));
        }
        Ok(json!(a / b))
    });

    let handler_err = manager
        .call::<_, i64>("divide", &Operands { a: 1, b: 0 }, RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(handler_err.handler_kind(), Some("division_by_zero"));
    assert!(handler_err.to_string().contains("b must not be 0"));

    let unroutable = manager
        .request("nobody", json!(null), RequestOptions::default().fail_fast())
        .await
        .unwrap_err();
    assert!(unroutable.is_unroutable());

    let timeout = manager
        .request("nobody", json!(null), RequestOptions::default().with_timeout_ms(5))
        .await
        .unwrap_err();
    assert!(timeout.is_timeout());
}

#[tokio::test]
async fn test_cancel_token_rejects_and_removes_entry() {
    let manager = Arc::new(manager());
    let token = CancellationToken::new();

    let pending = {
        let manager = manager.clone();
        let token = token.clone();
        tokio::spawn(async move {
            manager
                .request("never", json!({}), RequestOptions::default().with_cancel(token))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(manager.pending_count(), 1);

    token.cancel();
    let result = pending.await.unwrap();
    assert!(matches!(result, Err(RequestError::Cancelled { .. })));
    assert_eq!(manager.pending_count(), 0);
}
