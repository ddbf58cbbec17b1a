//! # Service Container
//!
//! Named, type-erased services that component definitions declare as
//! dependencies. Lookups return `Option`; the registry checks required
//! dependencies before it instantiates anything.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

/// A shared, type-erased service.
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

type ServiceFactory = Arc<dyn Fn() -> ServiceInstance + Send + Sync>;

enum ServiceEntry {
    Singleton(ServiceInstance),
    Factory(ServiceFactory),
}

#[derive(Default)]
pub struct ServiceContainer {
    services: RwLock<HashMap<String, ServiceEntry>>,
}

impl ServiceContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one shared instance under `name`.
    pub fn register_singleton<T>(&self, name: &str, service: T)
    where
        T: Any + Send + Sync,
    {
        self.insert(name, ServiceEntry::Singleton(Arc::new(service)));
    }

    /// Registers a factory; every resolution builds a fresh instance.
    pub fn register_factory<T, F>(&self, name: &str, factory: F)
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let erased: ServiceFactory = Arc::new(move || Arc::new(factory()) as ServiceInstance);
        self.insert(name, ServiceEntry::Factory(erased));
    }

    fn insert(&self, name: &str, entry: ServiceEntry) {
        let mut services = self.services.write().expect("Service lock poisoned");
        if services.insert(name.to_string(), entry).is_some() {
            warn!(service = name, "service replaced");
        } else {
            debug!(service = name, "service registered");
        }
    }

    pub fn resolve(&self, name: &str) -> Option<ServiceInstance> {
        let services = self.services.read().expect("Service lock poisoned");
        match services.get(name)? {
            ServiceEntry::Singleton(instance) => Some(instance.clone()),
            ServiceEntry::Factory(factory) => Some(factory()),
        }
    }

    /// Resolves and downcasts in one step.
    pub fn resolve_typed<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.resolve(name)?.downcast::<T>().ok()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services
            .read()
            .expect("Service lock poisoned")
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let services = self.services.read().expect("Service lock poisoned");
        let mut names: Vec<String> = services.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Clock(u32);

    #[test]
    fn test_singleton_is_shared() {
        let container = ServiceContainer::new();
        container.register_singleton("clock", Clock(7));
        let a = container.resolve_typed::<Clock>("clock").unwrap();
        let b = container.resolve_typed::<Clock>("clock").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.0, 7);
    }

    #[test]
    fn test_factory_builds_fresh_instances() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let container = ServiceContainer::new();
        container.register_factory("clock", move || Clock(c.fetch_add(1, Ordering::SeqCst)));
        assert_eq!(container.resolve_typed::<Clock>("clock").unwrap().0, 0);
        assert_eq!(container.resolve_typed::<Clock>("clock").unwrap().0, 1);
    }

    #[test]
    fn test_missing_and_wrong_type() {
        let container = ServiceContainer::new();
        container.register_singleton("name", String::from("db"));
        assert!(container.resolve("nope").is_none());
        assert!(container.resolve_typed::<Clock>("name").is_none());
        assert!(container.contains("name"));
        assert_eq!(container.names(), vec!["name".to_string()]);
    }
}
