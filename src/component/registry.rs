use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::{ComponentError, ComponentResult, LifecycleState};
use crate::event::topics;

/// Registry entry for one live component instance.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredComponent {
    pub instance_id: Uuid,
    pub name: String,
    /// Topic the instance answers late-join state queries on.
    pub state_topic: String,
    pub lifecycle: LifecycleState,
    pub registered_at: DateTime<Utc>,
    sequence: u64,
}

/// Live component instances, in registration order.
///
/// Instances are keyed by id, not name: two instances of the same component
/// type coexist without clobbering each other.
#[derive(Default)]
pub struct ComponentRegistry {
    components: DashMap<Uuid, RegisteredComponent>,
    next_sequence: AtomicU64,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, instance_id: Uuid, name: &str) -> ComponentResult<RegisteredComponent> {
        if self.components.contains_key(&instance_id) {
            return Err(ComponentError::AlreadyRegistered { id: instance_id });
        }
        let entry = RegisteredComponent {
            instance_id,
            name: name.to_string(),
            state_topic: topics::component_state(&instance_id),
            lifecycle: LifecycleState::Registered,
            registered_at: Utc::now(),
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
        };
        self.components.insert(instance_id, entry.clone());
        Ok(entry)
    }

    pub fn set_lifecycle(&self, instance_id: &Uuid, lifecycle: LifecycleState) -> ComponentResult<()> {
        let mut entry = self
            .components
            .get_mut(instance_id)
            .ok_or(ComponentError::NotFound { id: *instance_id })?;
        entry.lifecycle = lifecycle;
        Ok(())
    }

    pub fn unregister(&self, instance_id: &Uuid) -> ComponentResult<RegisteredComponent> {
        self.components
            .remove(instance_id)
            .map(|(_, entry)| entry)
            .ok_or(ComponentError::NotFound { id: *instance_id })
    }

    pub fn get(&self, instance_id: &Uuid) -> Option<RegisteredComponent> {
        self.components.get(instance_id).map(|entry| entry.clone())
    }

    /// Every live instance in registration order.
    pub fn live(&self) -> Vec<RegisteredComponent> {
        let mut live: Vec<RegisteredComponent> = self
            .components
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        live.sort_by_key(|entry| entry.sequence);
        live
    }

    /// Every live instance except `instance_id`, in registration order.
    pub fn peers_of(&self, instance_id: &Uuid) -> Vec<RegisteredComponent> {
        self.live()
            .into_iter()
            .filter(|entry| entry.instance_id != *instance_id)
            .collect()
    }

    pub fn find_by_name(&self, name: &str) -> Vec<RegisteredComponent> {
        self.live()
            .into_iter()
            .filter(|entry| entry.name == name)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_unregister() {
        let registry = ComponentRegistry::new();
        let id = Uuid::new_v4();

        let entry = registry.register(id, "selection_service").unwrap();
        assert_eq!(entry.lifecycle, LifecycleState::Registered);
        assert_eq!(entry.state_topic, topics::component_state(&id));
        assert!(matches!(
            registry.register(id, "selection_service"),
            Err(ComponentError::AlreadyRegistered { .. })
        ));

        registry.unregister(&id).unwrap();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.unregister(&id),
            Err(ComponentError::NotFound { .. })
        ));
    }

    #[test]
    fn test_peers_in_registration_order() {
        let registry = ComponentRegistry::new();
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        for (i, id) in ids.iter().enumerate() {
            registry.register(*id, &format!("component{}", i)).unwrap();
        }

        let peers: Vec<String> = registry
            .peers_of(&ids[1])
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        assert_eq!(peers, vec!["component0", "component2", "component3"]);
    }

    #[test]
    fn test_same_name_instances_are_distinct() {
        let registry = ComponentRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        registry.register(a, "listener").unwrap();
        registry.register(b, "listener").unwrap();

        assert_eq!(registry.find_by_name("listener").len(), 2);
        registry.unregister(&a).unwrap();
        assert_eq!(registry.find_by_name("listener")[0].instance_id, b);
    }

    #[test]
    fn test_set_lifecycle() {
        let registry = ComponentRegistry::new();
        let id = Uuid::new_v4();
        registry.register(id, "mode_service").unwrap();

        registry.set_lifecycle(&id, LifecycleState::Activated).unwrap();
        assert_eq!(registry.get(&id).unwrap().lifecycle, LifecycleState::Activated);
        assert!(registry
            .set_lifecycle(&Uuid::new_v4(), LifecycleState::Activated)
            .is_err());
    }
}
