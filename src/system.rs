use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    component::{Component, ComponentContext, ComponentHandle, ComponentRegistry, ComponentResult},
    config::SystemConfig,
    coordinator::{Coordinator, Storage},
    event::{Document, EventBus, RequestManager},
    services::{BindingsService, ModeService, SelectionService},
};

/// Type-erased handle so the system can tear components down in bulk.
#[async_trait]
trait Managed: Send + Sync {
    fn instance_id(&self) -> Uuid;
    fn name(&self) -> &str;
    async fn destroy(&self);
}

#[async_trait]
impl<C: Component> Managed for ComponentHandle<C> {
    fn instance_id(&self) -> Uuid {
        ComponentHandle::instance_id(self)
    }

    fn name(&self) -> &str {
        ComponentHandle::name(self)
    }

    async fn destroy(&self) {
        ComponentHandle::destroy(self).await
    }
}

/// The standard service set started by [`System::start_services`].
pub struct Services {
    pub coordinator: Arc<ComponentHandle<Coordinator>>,
    pub selection: Arc<ComponentHandle<SelectionService>>,
    pub mode: Arc<ComponentHandle<ModeService>>,
    pub bindings: Arc<ComponentHandle<BindingsService>>,
}

/// Owns the shared infrastructure and hands it to components explicitly.
pub struct System {
    config: Arc<SystemConfig>,
    event_bus: Arc<EventBus>,
    request_manager: Arc<RequestManager>,
    registry: Arc<ComponentRegistry>,
    document: Arc<Document>,
    components: Mutex<Vec<Arc<dyn Managed>>>,
}

impl System {
    pub fn new(config: SystemConfig) -> Self {
        let event_bus = Arc::new(EventBus::with_max_emit_depth(config.max_emit_depth));
        let request_manager = Arc::new(
            RequestManager::new(event_bus.clone(), config.request_timeout)
                .with_fail_fast_unroutable(config.fail_fast_unroutable),
        );
        Self {
            config: Arc::new(config),
            event_bus,
            request_manager,
            registry: Arc::new(ComponentRegistry::new()),
            document: Arc::new(Document::new()),
            components: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn requests(&self) -> &Arc<RequestManager> {
        &self.request_manager
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    /// What every component is constructed with.
    pub fn context(&self) -> ComponentContext {
        ComponentContext::new(
            self.event_bus.clone(),
            self.request_manager.clone(),
            self.registry.clone(),
            self.config.late_join_timeout,
        )
    }

    /// Registers `component` without activating it.
    pub fn attach<C: Component>(&self, component: Arc<C>) -> ComponentResult<Arc<ComponentHandle<C>>> {
        let handle = Arc::new(ComponentHandle::register(component, &self.context())?);
        self.components.lock().push(handle.clone());
        Ok(handle)
    }

    /// Registers and activates `component`.
    pub async fn activate<C: Component>(&self, component: Arc<C>) -> ComponentResult<Arc<ComponentHandle<C>>> {
        let handle = self.attach(component)?;
        handle.init().await?;
        Ok(handle)
    }

    /// Registers the coordinator and the leaf services, then activates them
    /// in the same order.
    pub async fn start_services(&self, storage: Arc<dyn Storage>) -> ComponentResult<Services> {
        let context = self.context();
        let services = Services {
            coordinator: self.attach(Coordinator::new(
                context.clone(),
                storage,
                self.config.coordinator.clone(),
            ))?,
            selection: self.attach(SelectionService::new(context.clone()))?,
            mode: self.attach(ModeService::new(context.clone()))?,
            bindings: self.attach(BindingsService::new(context))?,
        };
        services.coordinator.init().await?;
        services.selection.init().await?;
        services.mode.init().await?;
        services.bindings.init().await?;
        info!(components = self.registry.len(), "Services started");
        Ok(services)
    }

    /// Cancels in-flight requests and destroys every attached component in
    /// reverse attach order.
    pub async fn shutdown(&self) -> usize {
        let cancelled = self.request_manager.cancel_all("system shutdown");
        let components: Vec<Arc<dyn Managed>> = self.components.lock().drain(..).rev().collect();
        for component in &components {
            debug!(component = component.name(), instance_id = %component.instance_id(), "Destroying");
            component.destroy().await;
        }
        info!(
            cancelled,
            destroyed = components.len(),
            "System shut down"
        );
        cancelled
    }
}
