//! # Event-Driven Communication
//!
//! The event layer is how components cooperate without holding references to
//! each other. It consists of:
//!
//! - **EventBus**: synchronous publish/subscribe with handler-scoped removal
//! - **EventType**: the enumerated set of events and request/response topics
//! - **RequestManager**: correlated request/response with timeouts on top of the bus
//! - **DOM bridge**: native UI events forwarded as bus events
//!
//! ## Event Flow
//!
//! ```text
//! ┌──────────┐  emit  ┌──────────┐ snapshot ┌──────────┐
//! │Publisher │───────▶│ EventBus │─────────▶│ Handlers │
//! └──────────┘        └──────────┘          └──────────┘
//! ```
//!
//! ## Request-Response Pattern
//!
//! ```text
//! ┌─────────┐ Request{topic}+id  ┌──────────┐     ┌──────────┐
//! │Requester│───────────────────▶│ EventBus │────▶│Responder │
//! └────┬────┘                    └──────────┘     └────┬─────┘
//!      │            Response{topic}+id                 │
//!      └───────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! # use std::{sync::Arc, time::Duration};
//! # use serde_json::json;
//! # use switchboard::event::{EventBus, RequestManager, RequestOptions};
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let event_bus = Arc::new(EventBus::new());
//! let requests = RequestManager::new(event_bus.clone(), Duration::from_secs(5));
//!
//! let _responder = requests.respond_fn("sum", |payload| {
//!     Ok(json!(payload["a"].as_i64().unwrap_or(0) + payload["b"].as_i64().unwrap_or(0)))
//! });
//!
//! let total = requests
//!     .request("sum", json!({ "a": 2, "b": 3 }), RequestOptions::default())
//!     .await?;
//! assert_eq!(total, json!(5));
//! # Ok(())
//! # }
//! ```

pub mod dom_bridge;
pub mod event_bus;
pub mod event_type;
pub mod request_manager;

pub use dom_bridge::{BridgeTarget, Document, DomEvent, Element, ElementId, Selector};
pub use event_bus::{
    Detach, Event, EventBus, EventError, EventResult, Handler, HandlerError, HandlerResult,
    Payload,
};
pub use event_type::{topics, EventType};
pub use request_manager::{
    CorrelationId, RequestError, RequestManager, RequestOptions, RequestResult,
};
