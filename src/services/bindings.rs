use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{instrument, trace, warn};

use crate::component::{Component, ComponentContext, Registrar, StateSnapshot};
use crate::coordinator::{
    self, DataSnapshot, EntityPath, Environment, MutationEnvelope, MutationReceipt, Operation,
    SnapshotCache,
};
use crate::event::{topics, EventType, RequestOptions};
use crate::InternalResult;

/// Cache of the active environment's key bindings.
///
/// Writes go to the coordinator as mutations; the cache changes only when
/// the resulting snapshot is broadcast back.
pub struct BindingsService {
    context: ComponentContext,
    cache: SnapshotCache,
}

impl BindingsService {
    pub const NAME: &'static str = "bindings_service";

    pub fn new(context: ComponentContext) -> Arc<Self> {
        Arc::new(Self {
            context,
            cache: SnapshotCache::new(),
        })
    }

    pub fn environment(&self) -> Environment {
        self.cache.environment().unwrap_or_default()
    }

    pub fn revision(&self) -> Option<u64> {
        self.cache.revision()
    }

    pub fn bindings(&self) -> BTreeMap<String, Value> {
        self.cache
            .get()
            .map(|snapshot| snapshot.bindings(snapshot.environment))
            .unwrap_or_default()
    }

    pub fn binding(&self, key: &str) -> Option<Value> {
        self.bindings().remove(key)
    }

    /// Binds `key` in the active environment, replacing an existing binding.
    #[instrument(skip(self, command))]
    pub async fn bind(&self, key: &str, command: Value) -> InternalResult<MutationReceipt> {
        let path = self.path(key)?;
        let operation = if self.binding(key).is_some() {
            Operation::modify(path, command)
        } else {
            Operation::add(path, command)
        };
        self.submit(operation).await
    }

    #[instrument(skip(self))]
    pub async fn unbind(&self, key: &str) -> InternalResult<MutationReceipt> {
        let path = self.path(key)?;
        self.submit(Operation::delete(path)).await
    }

    fn path(&self, key: &str) -> InternalResult<EntityPath> {
        Ok(EntityPath::from_segments([
            "bindings",
            self.environment().as_str(),
            key,
        ])?)
    }

    async fn submit(&self, operation: Operation) -> InternalResult<MutationReceipt> {
        let mut envelope = match self.cache.get() {
            Some(snapshot) => {
                MutationEnvelope::for_profile(&snapshot.current_profile).expecting(snapshot.revision)
            }
            None => MutationEnvelope::new(),
        };
        envelope = envelope.with(operation);
        Ok(self
            .context
            .call(topics::DATA_UPDATE_PROFILE, &envelope, RequestOptions::default())
            .await?)
    }

    fn apply_snapshot(&self, snapshot: DataSnapshot) {
        let incoming = snapshot.bindings(snapshot.environment);
        let payload = json!({
            "environment": snapshot.environment,
            "revision": snapshot.revision,
            "count": incoming.len(),
        });
        let before = self.bindings();
        if self.cache.apply(snapshot).is_err() {
            return;
        }
        if before != incoming {
            trace!("Bindings cache refreshed");
            if let Err(err) = self.context.broadcast(EventType::BindingsChanged, &payload) {
                warn!("Failed to broadcast bindings change: {}", err);
            }
        }
    }
}

#[async_trait]
impl Component for BindingsService {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn register(self: Arc<Self>, registrar: &mut Registrar) {
        coordinator::on_snapshot(registrar, move |snapshot| self.apply_snapshot(snapshot));
    }

    fn handle_initial_state(&self, _sender: &str, state: &StateSnapshot) {
        if let Some(snapshot) = coordinator::snapshot_from_state(state) {
            self.apply_snapshot(snapshot);
        }
    }
}
