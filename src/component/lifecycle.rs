use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    late_join, Component, ComponentContext, ComponentError, ComponentResult, LifecycleNotice,
    LifecycleState, Registrar,
};
use crate::event::{topics, Detach, EventType, HandlerError};

/// Drives one component instance through its lifecycle.
pub struct ComponentHandle<C: Component> {
    component: Arc<C>,
    context: ComponentContext,
    instance_id: Uuid,
    name: String,
    state: Mutex<LifecycleState>,
    init_started: AtomicBool,
    detaches: Mutex<Vec<Detach>>,
}

impl<C: Component> ComponentHandle<C> {
    /// Registers `component`: installs its handlers and its late-join state
    /// endpoint, and enrolls it in the registry.
    pub fn register(component: Arc<C>, context: &ComponentContext) -> ComponentResult<Self> {
        let instance_id = Uuid::new_v4();
        let name = component.name().to_string();

        let mut registrar = Registrar::new(context.clone(), &name);
        component.clone().register(&mut registrar);

        let source = Arc::downgrade(&component);
        let reply_name = name.clone();
        registrar.respond_fn(&topics::component_state(&instance_id), move |_| {
            let component = source
                .upgrade()
                .ok_or_else(|| HandlerError::new("component_gone", reply_name.clone()))?;
            Ok(late_join::reply(&reply_name, component.current_state())?)
        });

        let mut detaches = registrar.into_detaches();
        if let Err(err) = context.registry().register(instance_id, &name) {
            detaches.iter_mut().for_each(Detach::detach);
            return Err(err);
        }

        debug!(component = %name, %instance_id, registrations = detaches.len(), "Component registered");
        let notice = LifecycleNotice {
            name: name.clone(),
            instance_id,
        };
        if let Err(err) = context.broadcast(EventType::ComponentRegistered, &notice) {
            warn!(component = %name, "Failed to announce registration: {}", err);
        }

        Ok(Self {
            component,
            context: context.clone(),
            instance_id,
            name,
            state: Mutex::new(LifecycleState::Registered),
            init_started: AtomicBool::new(false),
            detaches: Mutex::new(detaches),
        })
    }

    /// Activates the component: runs `on_init`, then gathers initial state
    /// from every other live component.
    #[instrument(skip(self), fields(component = %self.name, instance_id = %self.instance_id))]
    pub async fn init(&self) -> ComponentResult<()> {
        let current = self.state();
        if current != LifecycleState::Registered || self.init_started.swap(true, Ordering::SeqCst) {
            return Err(self.invalid_transition(current, "init"));
        }

        self.component.on_init().await?;

        let replies = late_join::gather(&self.context, &self.instance_id).await;
        debug!(peers = replies.len(), "Late join complete");
        for reply in &replies {
            self.component.handle_initial_state(&reply.name, &reply.state);
        }

        {
            let mut state = self.state.lock();
            if *state != LifecycleState::Registered {
                return Err(self.invalid_transition(*state, "init"));
            }
            *state = LifecycleState::Activated;
        }
        if let Err(err) = self
            .context
            .registry()
            .set_lifecycle(&self.instance_id, LifecycleState::Activated)
        {
            warn!("Registry entry vanished during init: {}", err);
        }

        info!("Component activated");
        self.announce(EventType::ComponentActivated);
        Ok(())
    }

    /// Detaches everything this instance registered. Calling it again, or
    /// before `init`, is harmless.
    #[instrument(skip(self), fields(component = %self.name, instance_id = %self.instance_id))]
    pub async fn destroy(&self) {
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            if previous == LifecycleState::Destroyed {
                debug!("Already destroyed");
                return;
            }
            *state = LifecycleState::Destroyed;
            previous
        };

        let detaches = std::mem::take(&mut *self.detaches.lock());
        let count = detaches.len();
        for mut detach in detaches {
            detach.detach();
        }
        if let Err(err) = self.context.registry().unregister(&self.instance_id) {
            debug!("Registry entry already gone: {}", err);
        }

        self.component.on_destroy().await;
        info!(%previous, detached = count, "Component destroyed");
        self.announce(EventType::ComponentDestroyed);
    }

    pub fn component(&self) -> &Arc<C> {
        &self.component
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == LifecycleState::Activated
    }

    /// Registrations still attached. Zero after `destroy`.
    pub fn registration_count(&self) -> usize {
        self.detaches.lock().len()
    }

    fn invalid_transition(&self, state: LifecycleState, action: &'static str) -> ComponentError {
        ComponentError::InvalidTransition {
            name: self.name.clone(),
            state,
            action,
        }
    }

    fn announce(&self, event_type: EventType) {
        let notice = LifecycleNotice {
            name: self.name.clone(),
            instance_id: self.instance_id,
        };
        if let Err(err) = self.context.broadcast(event_type, &notice) {
            warn!("Failed to announce lifecycle change: {}", err);
        }
    }
}
