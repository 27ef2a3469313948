//! # Components
//!
//! Every service on the bus is a [`Component`] driven through a fixed
//! lifecycle by a [`ComponentHandle`]:
//!
//! ```text
//! Constructed ──register()──▶ Registered ──init()──▶ Activated
//!      │                          │                      │
//!      └──────────────────────────┴────destroy()─────────┴──▶ Destroyed
//! ```
//!
//! 1. **Registration** ([`ComponentHandle::register`]): the component installs
//!    its responders and subscriptions through a [`Registrar`]. Nothing else
//!    happens yet, but responders are live from this point on, so an already
//!    active peer can call the component before its `init()` ran.
//! 2. **Activation** ([`ComponentHandle::init`]): runs [`Component::on_init`],
//!    then the late-join handshake: every other live component is asked for
//!    the state it owns and the replies go to
//!    [`Component::handle_initial_state`].
//! 3. **Destruction** ([`ComponentHandle::destroy`]): runs every detach action
//!    the registrar collected, exactly once. Registrations of other
//!    components, including other instances of the same type, are untouched.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::event::{
    BridgeTarget, Detach, Document, Event, EventBus, EventError, EventResult, EventType, Handler,
    HandlerError, HandlerResult, Payload, RequestError, RequestManager, RequestOptions,
    RequestResult,
};

pub mod late_join;
pub mod lifecycle;
pub mod registry;

pub use late_join::StateReply;
pub use lifecycle::ComponentHandle;
pub use registry::{ComponentRegistry, RegisteredComponent};

/// What a component reports when asked "what state do you own?".
pub type StateSnapshot = Map<String, Value>;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
pub enum LifecycleState {
    Constructed,
    Registered,
    Activated,
    Destroyed,
}

/// A service that participates on the bus.
///
/// Implementors keep their own state behind interior mutability; all hooks
/// take `&self` because handlers registered on the bus share the component.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Installs responders and subscriptions. Must not emit or request.
    fn register(self: Arc<Self>, _registrar: &mut Registrar) {}

    async fn on_init(&self) -> ComponentResult<()> {
        Ok(())
    }

    async fn on_destroy(&self) {}

    /// The keys this component is authoritative for.
    fn current_state(&self) -> StateSnapshot {
        StateSnapshot::new()
    }

    /// Receives one peer's late-join reply. Implementations read only the keys
    /// they cache and ignore the rest.
    fn handle_initial_state(&self, _sender: &str, _state: &StateSnapshot) {}
}

/// Everything a component needs to talk to its peers. Cloned into each
/// component at construction.
#[derive(Clone)]
pub struct ComponentContext {
    event_bus: Arc<EventBus>,
    request_manager: Arc<RequestManager>,
    registry: Arc<ComponentRegistry>,
    late_join_timeout: Duration,
}

impl ComponentContext {
    pub fn new(
        event_bus: Arc<EventBus>,
        request_manager: Arc<RequestManager>,
        registry: Arc<ComponentRegistry>,
        late_join_timeout: Duration,
    ) -> Self {
        Self {
            event_bus,
            request_manager,
            registry,
            late_join_timeout,
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn requests(&self) -> &Arc<RequestManager> {
        &self.request_manager
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn late_join_timeout(&self) -> Duration {
        self.late_join_timeout
    }

    /// Serializes `payload` and emits it as `event_type`.
    pub fn broadcast<T: Serialize + ?Sized>(&self, event_type: EventType, payload: &T) -> EventResult<()> {
        let payload = serde_json::to_value(payload)?;
        self.event_bus.emit(Event::new(event_type, payload));
        Ok(())
    }

    pub async fn call<P, R>(&self, topic: &str, payload: &P, options: RequestOptions) -> RequestResult<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.request_manager.call(topic, payload, options).await
    }
}

/// Collects a component's registrations so they can be detached together.
pub struct Registrar {
    context: ComponentContext,
    component_name: String,
    detaches: Vec<Detach>,
}

impl Registrar {
    pub(crate) fn new(context: ComponentContext, component_name: &str) -> Self {
        Self {
            context,
            component_name: component_name.to_string(),
            detaches: Vec::new(),
        }
    }

    pub fn context(&self) -> &ComponentContext {
        &self.context
    }

    pub fn component_name(&self) -> &str {
        &self.component_name
    }

    pub fn respond<F, Fut>(&mut self, topic: &str, handler: F)
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, HandlerError>> + Send + 'static,
    {
        let detach = self.context.request_manager.respond(topic, handler);
        self.detaches.push(detach);
    }

    pub fn respond_fn<F>(&mut self, topic: &str, handler: F)
    where
        F: Fn(Payload) -> Result<Payload, HandlerError> + Send + Sync + 'static,
    {
        let detach = self.context.request_manager.respond_fn(topic, handler);
        self.detaches.push(detach);
    }

    pub fn on<F>(&mut self, event_type: EventType, callback: F)
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        let detach = self
            .context
            .event_bus
            .subscribe(event_type, Handler::new(callback));
        self.detaches.push(detach);
    }

    pub fn on_dom(
        &mut self,
        document: &Arc<Document>,
        target: BridgeTarget,
        dom_event: &str,
        bus_event: EventType,
        handler: Handler,
    ) -> EventResult<()> {
        let detach = self
            .context
            .event_bus
            .on_dom(document, target, dom_event, bus_event, handler)?;
        self.detaches.push(detach);
        Ok(())
    }

    pub fn registration_count(&self) -> usize {
        self.detaches.len()
    }

    pub(crate) fn into_detaches(self) -> Vec<Detach> {
        self.detaches
    }
}

#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("Invalid lifecycle transition for {name}: cannot {action} while {state}")]
    InvalidTransition {
        name: String,
        state: LifecycleState,
        action: &'static str,
    },
    #[error("Component already registered: {id}")]
    AlreadyRegistered { id: Uuid },
    #[error("Component not found: {id}")]
    NotFound { id: Uuid },
    #[error("Initialization of {name} failed: {message}")]
    InitFailed { name: String, message: String },
    #[error("Request failed: {0}")]
    Request(#[from] RequestError),
    #[error("Event error: {0}")]
    Event(#[from] EventError),
}

pub type ComponentResult<T> = Result<T, ComponentError>;

/// Reads `key` out of a peer's snapshot, ignoring it if it does not decode.
pub fn snapshot_field<T: DeserializeOwned>(state: &StateSnapshot, key: &str) -> Option<T> {
    let value = state.get(key)?;
    match serde_json::from_value(value.clone()) {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            tracing::warn!(key, "Ignoring undecodable snapshot field: {}", err);
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct LifecycleNotice {
    pub name: String,
    pub instance_id: Uuid,
}
