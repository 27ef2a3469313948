//! # Event Bus Implementation
//!
//! The EventBus is the synchronous publish-subscribe core every component talks
//! through. Components never hold references to each other; they register
//! [`Handler`]s for an [`EventType`] and emit [`Event`]s.
//!
//! ## Dispatch Rules
//!
//! - Handlers for an event type form a set: registering the same [`Handler`]
//!   twice does not duplicate delivery.
//! - [`EventBus::off`] always names the handler to remove. There is no way to
//!   clear every listener of an event type, so one component can never drop
//!   another component's registrations.
//! - [`EventBus::emit`] iterates over a snapshot of the handler set taken when
//!   the emission starts. Handlers added or removed during dispatch take effect
//!   from the next emission on.
//! - Each handler runs in isolation. An `Err` or a panic in one handler is
//!   logged and the remaining handlers still run; nothing propagates to the
//!   emitter.
//!
//! Nested emission (a handler emitting while being dispatched) is supported.
//! The nesting depth is bounded by `max_emit_depth`; deeper emissions are
//! dropped with an error log instead of overflowing the stack.

use std::{
    any::Any,
    cell::Cell,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, trace};

use super::event_type::EventType;

/// Arbitrary serializable event payload.
pub type Payload = Value;

pub const DEFAULT_MAX_EMIT_DEPTH: usize = 32;

/// # Event
///
/// A discrete message on the bus: what happened (`event_type`) and the data
/// that goes with it (`payload`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub payload: Payload,
}

impl Event {
    pub fn new(event_type: EventType, payload: Payload) -> Self {
        Self {
            event_type,
            payload,
        }
    }

    /// An event without payload.
    pub fn signal(event_type: EventType) -> Self {
        Self::new(event_type, Value::Null)
    }

    pub fn custom(name: &str, payload: Payload) -> Self {
        Self::new(EventType::custom(name), payload)
    }

    /// Deserializes the payload into `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Failure reported by a handler or a responder.
///
/// Carries a machine-readable `kind` next to the human-readable `message` so
/// that errors survive the trip through the request/response channel.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("[{kind}] {message}")]
pub struct HandlerError {
    pub kind: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new("invalid_payload", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", message)
    }

    pub(crate) fn panicked(panic: &(dyn Any + Send)) -> Self {
        Self::new("panic", panic_message(panic))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_payload(err.to_string())
    }
}

pub type HandlerResult = Result<(), HandlerError>;

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

type HandlerFn = dyn Fn(&Event) -> HandlerResult + Send + Sync;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// A registered callback.
///
/// Identity is fixed at construction: clones of a `Handler` are the same
/// handler as far as [`EventBus::on`] and [`EventBus::off`] are concerned.
#[derive(Clone)]
pub struct Handler {
    id: u64,
    callback: Arc<HandlerFn>,
}

impl Handler {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        Self {
            id: NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed),
            callback: Arc::new(callback),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn call(&self, event: &Event) -> HandlerResult {
        (self.callback)(event)
    }
}

impl PartialEq for Handler {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Handler {}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler").field("id", &self.id).finish()
    }
}

type DetachFn = Box<dyn FnOnce() + Send + Sync>;

/// Undo action for exactly one registration (bus handler, responder or DOM
/// bridge). Running it more than once is a no-op.
#[must_use = "keep the Detach and run it to remove the registration"]
pub struct Detach {
    action: Option<DetachFn>,
}

impl Detach {
    pub fn new<F>(action: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            action: Some(Box::new(action)),
        }
    }

    pub fn noop() -> Self {
        Self { action: None }
    }

    pub fn detach(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }

    pub fn is_detached(&self) -> bool {
        self.action.is_none()
    }
}

impl fmt::Debug for Detach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Detach")
            .field("detached", &self.is_detached())
            .finish()
    }
}

thread_local! {
    static EMIT_DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct DepthGuard(usize);

impl Drop for DepthGuard {
    fn drop(&mut self) {
        EMIT_DEPTH.with(|depth| depth.set(self.0));
    }
}

/// # EventBus
///
/// Synchronous, in-process dispatcher. Share it as `Arc<EventBus>` and inject
/// it into every component; there is no global instance.
pub struct EventBus {
    handlers: DashMap<EventType, Vec<Handler>>,
    max_emit_depth: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_max_emit_depth(DEFAULT_MAX_EMIT_DEPTH)
    }

    pub fn with_max_emit_depth(max_emit_depth: usize) -> Self {
        Self {
            handlers: DashMap::new(),
            max_emit_depth,
        }
    }

    /// Adds `handler` to the set for `event_type`.
    ///
    /// Returns `false` if that handler was already registered for the event.
    pub fn on(&self, event_type: EventType, handler: &Handler) -> bool {
        let mut handlers = self.handlers.entry(event_type).or_default();
        if handlers.contains(handler) {
            return false;
        }
        handlers.push(handler.clone());
        true
    }

    /// Removes exactly `handler` from the set for `event_type`.
    ///
    /// Other handlers registered for the same event are left alone.
    pub fn off(&self, event_type: &EventType, handler: &Handler) -> bool {
        let removed = match self.handlers.get_mut(event_type) {
            Some(mut handlers) => {
                let before = handlers.len();
                handlers.retain(|registered| registered != handler);
                before != handlers.len()
            }
            None => false,
        };
        self.handlers
            .remove_if(event_type, |_, handlers| handlers.is_empty());
        removed
    }

    /// [`on`](Self::on) plus a [`Detach`] that runs the matching
    /// [`off`](Self::off).
    pub fn subscribe(self: &Arc<Self>, event_type: EventType, handler: Handler) -> Detach {
        self.on(event_type.clone(), &handler);
        let bus = Arc::downgrade(self);
        Detach::new(move || {
            if let Some(bus) = bus.upgrade() {
                bus.off(&event_type, &handler);
            }
        })
    }

    /// Delivers `event` to every handler registered for its type at the time
    /// of the call.
    pub fn emit(&self, event: Event) {
        let depth = EMIT_DEPTH.with(Cell::get);
        if depth >= self.max_emit_depth {
            error!(
                "Dropping {} event: nested emit depth {} exceeds limit {}",
                event.event_type, depth, self.max_emit_depth
            );
            return;
        }
        debug_event("Emitting", &event);

        let snapshot = self
            .handlers
            .get(&event.event_type)
            .map(|handlers| handlers.value().clone());
        let Some(snapshot) = snapshot else {
            trace!("No listeners for {}", event.event_type);
            return;
        };

        EMIT_DEPTH.with(|cell| cell.set(depth + 1));
        let _reset = DepthGuard(depth);
        for handler in &snapshot {
            invoke_isolated(handler, &event);
        }
    }

    pub fn listener_count(&self, event_type: &EventType) -> usize {
        self.handlers
            .get(event_type)
            .map(|handlers| handlers.len())
            .unwrap_or(0)
    }

    pub fn has_listeners(&self, event_type: &EventType) -> bool {
        self.listener_count(event_type) > 0
    }

    pub fn total_listeners(&self) -> usize {
        self.handlers.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn max_emit_depth(&self) -> usize {
        self.max_emit_depth
    }
}

/// Runs one handler, containing both `Err` returns and panics.
pub(crate) fn invoke_isolated(handler: &Handler, event: &Event) {
    match catch_unwind(AssertUnwindSafe(|| handler.call(event))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(
                handler_id = handler.id(),
                "Handler for {} failed: {}", event.event_type, err
            );
        }
        Err(panic) => {
            error!(
                handler_id = handler.id(),
                "Handler for {} panicked: {}",
                event.event_type,
                panic_message(panic.as_ref())
            );
        }
    }
}

pub fn debug_event(prefix: &str, event: &Event) {
    if event.event_type.is_chatty() {
        trace!("{} Event: {:?}", prefix, event);
    } else {
        debug!("{} Event: {:?}", prefix, event);
    }
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Invalid selector: {selector}: {message}")]
    InvalidSelector { selector: String, message: String },

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Invalid event payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

pub type EventResult<T> = Result<T, EventError>;

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;

    fn counting_handler(counter: &Arc<AtomicUsize>) -> Handler {
        let counter = counter.clone();
        Handler::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn ping() -> EventType {
        EventType::custom("ping")
    }

    #[test]
    fn test_emit_reaches_registered_handlers() {
        let bus = EventBus::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        bus.on(
            ping(),
            &Handler::new(move |event| {
                sink.lock().push(event.payload.clone());
                Ok(())
            }),
        );

        bus.emit(Event::new(ping(), json!({ "n": 1 })));

        assert_eq!(*received.lock(), vec![json!({ "n": 1 })]);
    }

    #[test]
    fn test_on_is_idempotent_for_same_handler() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(&count);

        assert!(bus.on(ping(), &handler));
        assert!(!bus.on(ping(), &handler.clone()));
        bus.emit(Event::signal(ping()));

        assert_eq!(bus.listener_count(&ping()), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_is_handler_scoped() {
        let bus = EventBus::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let h1 = counting_handler(&first);
        let h2 = counting_handler(&second);
        bus.on(ping(), &h1);
        bus.on(ping(), &h2);

        assert!(bus.off(&ping(), &h1));
        bus.emit(Event::signal(ping()));

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_unknown_handler_is_noop() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let registered = counting_handler(&count);
        bus.on(ping(), &registered);

        assert!(!bus.off(&ping(), &counting_handler(&count)));
        assert!(!bus.off(&EventType::custom("other"), &registered));
        assert_eq!(bus.listener_count(&ping()), 1);
    }

    #[test]
    fn test_failing_handler_does_not_stop_siblings() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.on(
            ping(),
            &Handler::new(|_| Err(HandlerError::internal("boom"))),
        );
        bus.on(ping(), &Handler::new(|_| panic!("handler panic")));
        bus.on(ping(), &counting_handler(&count));

        bus.emit(Event::signal(ping()));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_emit_iterates_over_snapshot() {
        let bus = Arc::new(EventBus::new());
        let late = Arc::new(AtomicUsize::new(0));
        let bus_ref = Arc::downgrade(&bus);
        let late_handler = counting_handler(&late);
        bus.on(
            ping(),
            &Handler::new(move |_| {
                // 実行中に同じイベントへハンドラを追加する
                if let Some(bus) = bus_ref.upgrade() {
                    bus.on(ping(), &late_handler);
                }
                Ok(())
            }),
        );

        bus.emit(Event::signal(ping()));
        assert_eq!(late.load(Ordering::SeqCst), 0);

        bus.emit(Event::signal(ping()));
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nested_emit_is_delivered() {
        let bus = Arc::new(EventBus::new());
        let pongs = Arc::new(AtomicUsize::new(0));
        let bus_ref = Arc::downgrade(&bus);
        bus.on(
            ping(),
            &Handler::new(move |_| {
                if let Some(bus) = bus_ref.upgrade() {
                    bus.emit(Event::custom("pong", Value::Null));
                }
                Ok(())
            }),
        );
        bus.on(EventType::custom("pong"), &counting_handler(&pongs));

        bus.emit(Event::signal(ping()));

        assert_eq!(pongs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_runaway_recursion_is_bounded() {
        let bus = Arc::new(EventBus::with_max_emit_depth(8));
        let calls = Arc::new(AtomicUsize::new(0));
        let bus_ref = Arc::downgrade(&bus);
        let counter = calls.clone();
        bus.on(
            ping(),
            &Handler::new(move |event| {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(bus) = bus_ref.upgrade() {
                    bus.emit(event.clone());
                }
                Ok(())
            }),
        );

        bus.emit(Event::signal(ping()));

        assert_eq!(calls.load(Ordering::SeqCst), 8);
        // depth counter is restored after the outermost emit returns
        bus.emit(Event::signal(EventType::custom("unrelated")));
        assert_eq!(EMIT_DEPTH.with(Cell::get), 0);
    }

    #[test]
    fn test_subscribe_detach_runs_once() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let other = counting_handler(&count);
        bus.on(ping(), &other);

        let mut detach = bus.subscribe(ping(), counting_handler(&count));
        assert_eq!(bus.listener_count(&ping()), 2);

        detach.detach();
        detach.detach();
        assert!(detach.is_detached());
        assert_eq!(bus.listener_count(&ping()), 1);
    }

    #[test]
    fn test_empty_sets_are_pruned() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(&count);
        bus.on(ping(), &handler);
        bus.off(&ping(), &handler);

        assert!(!bus.has_listeners(&ping()));
        assert_eq!(bus.total_listeners(), 0);
    }

    #[test]
    fn test_payload_as() {
        #[derive(Deserialize, Debug, PartialEq)]
        struct Sum {
            a: i64,
            b: i64,
        }
        let event = Event::custom("sum", json!({ "a": 1, "b": 2 }));
        assert_eq!(event.payload_as::<Sum>().unwrap(), Sum { a: 1, b: 2 });

        let err = Event::custom("sum", json!("nope"))
            .payload_as::<Sum>()
            .unwrap_err();
        assert_eq!(err.kind, "invalid_payload");
    }
}
