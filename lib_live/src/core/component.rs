//! # Component Definitions
//!
//! A component is a named action table plus default state. Definitions are
//! registered once at startup; the registry creates one `ComponentInstance`
//! per mount and runs handlers against it through an `ActionContext`.
//!
//! ```ignore
//! let counter = ComponentDefinition::builder("Counter")
//!     .initial_state(json!({"count": 0}))
//!     .action("increment", |ctx, _payload| {
//!         let next = ctx.get("count").and_then(Value::as_i64).unwrap_or(0) + 1;
//!         ctx.set("count", json!(next));
//!         Ok(json!({"count": next}))
//!     })
//!     .build();
//! ```

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::core::services::ServiceInstance;

/// Handler for one named action. Receives the payload, returns the result.
pub type ActionHandler =
    Arc<dyn Fn(&mut ActionContext<'_>, Value) -> anyhow::Result<Value> + Send + Sync>;

/// Runs after the instance is built and before it is announced.
pub type MountHook = Arc<dyn Fn(&mut ActionContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Runs on unmount with the final state.
pub type DestroyHook = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    pub required: bool,
}

/// # Component Definition
pub struct ComponentDefinition {
    name: String,
    initial_state: Value,
    actions: BTreeMap<String, ActionHandler>,
    dependencies: Vec<Dependency>,
    on_mount: Option<MountHook>,
    on_destroy: Option<DestroyHook>,
}

impl fmt::Debug for ComponentDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentDefinition")
            .field("name", &self.name)
            .field("actions", &self.action_names())
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

impl ComponentDefinition {
    pub fn builder(name: impl Into<String>) -> ComponentDefinitionBuilder {
        ComponentDefinitionBuilder {
            definition: ComponentDefinition {
                name: name.into(),
                initial_state: Value::Object(Map::new()),
                actions: BTreeMap::new(),
                dependencies: Vec::new(),
                on_mount: None,
                on_destroy: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial_state(&self) -> &Value {
        &self.initial_state
    }

    pub fn action(&self, name: &str) -> Option<ActionHandler> {
        self.actions.get(name).cloned()
    }

    pub fn action_names(&self) -> Vec<String> {
        self.actions.keys().cloned().collect()
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    pub fn on_mount(&self) -> Option<&MountHook> {
        self.on_mount.as_ref()
    }

    pub fn on_destroy(&self) -> Option<&DestroyHook> {
        self.on_destroy.as_ref()
    }
}

pub struct ComponentDefinitionBuilder {
    definition: ComponentDefinition,
}

impl ComponentDefinitionBuilder {
    /// Default state. Non-object values are replaced by an empty object.
    pub fn initial_state(mut self, state: Value) -> Self {
        self.definition.initial_state = match state {
            Value::Object(_) => state,
            _ => Value::Object(Map::new()),
        };
        self
    }

    pub fn action<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut ActionContext<'_>, Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.definition.actions.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn depends_on(mut self, service: impl Into<String>, required: bool) -> Self {
        self.definition.dependencies.push(Dependency {
            name: service.into(),
            required,
        });
        self
    }

    pub fn on_mount<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut ActionContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.definition.on_mount = Some(Arc::new(hook));
        self
    }

    pub fn on_destroy<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.definition.on_destroy = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> ComponentDefinition {
        self.definition
    }
}

/// # Component Instance
///
/// Server-held state for one mount. Only reachable through the registry.
pub struct ComponentInstance {
    pub id: String,
    pub definition: Arc<ComponentDefinition>,
    pub state: Value,
    pub room: Option<String>,
    pub user_id: Option<String>,
    pub connection_id: String,
    pub version: u64,
    pub services: HashMap<String, ServiceInstance>,
}

impl ComponentInstance {
    pub fn name(&self) -> &str {
        self.definition.name()
    }
}

/// A room event queued by a handler; fanned out after the handler returns.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomBroadcast {
    pub event: String,
    pub data: Value,
}

/// # Action Context
///
/// Mutable view of one instance for the duration of a handler call. Writes
/// through `state_mut`/`set` mark the state dirty, which makes the registry
/// bump the version and push a re-signed envelope.
pub struct ActionContext<'a> {
    instance: &'a mut ComponentInstance,
    broadcasts: Vec<RoomBroadcast>,
    state_changed: bool,
}

impl<'a> ActionContext<'a> {
    pub fn new(instance: &'a mut ComponentInstance) -> Self {
        Self {
            instance,
            broadcasts: Vec::new(),
            state_changed: false,
        }
    }

    pub fn component_id(&self) -> &str {
        &self.instance.id
    }

    pub fn component_name(&self) -> &str {
        self.instance.name()
    }

    pub fn room(&self) -> Option<&str> {
        self.instance.room.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.instance.user_id.as_deref()
    }

    pub fn connection_id(&self) -> &str {
        &self.instance.connection_id
    }

    pub fn version(&self) -> u64 {
        self.instance.version
    }

    pub fn state(&self) -> &Value {
        &self.instance.state
    }

    pub fn state_mut(&mut self) -> &mut Value {
        self.state_changed = true;
        &mut self.instance.state
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.instance.state.get(key)
    }

    /// Sets one top-level key.
    pub fn set(&mut self, key: &str, value: Value) {
        let state = self.state_mut();
        if !state.is_object() {
            *state = Value::Object(Map::new());
        }
        if let Value::Object(map) = state {
            map.insert(key.to_string(), value);
        }
    }

    /// An injected service, downcast to its concrete type.
    pub fn service<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.instance.services.get(name)?.clone().downcast::<T>().ok()
    }

    /// Queues an event for the other members of this component's room.
    pub fn broadcast(&mut self, event: impl Into<String>, data: Value) {
        self.broadcasts.push(RoomBroadcast {
            event: event.into(),
            data,
        });
    }

    pub fn state_changed(&self) -> bool {
        self.state_changed
    }

    /// Ends the call: whether state was touched, and the queued room events.
    pub fn finish(self) -> (bool, Vec<RoomBroadcast>) {
        (self.state_changed, self.broadcasts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instance(definition: ComponentDefinition) -> ComponentInstance {
        ComponentInstance {
            id: "live-1".into(),
            state: definition.initial_state().clone(),
            definition: Arc::new(definition),
            room: Some("lobby".into()),
            user_id: None,
            connection_id: "conn".into(),
            version: 1,
            services: HashMap::new(),
        }
    }

    #[test]
    fn test_builder_and_handler() {
        let definition = ComponentDefinition::builder("Counter")
            .initial_state(json!({"count": 0}))
            .action("increment", |ctx, payload| {
                let by = payload.get("by").and_then(Value::as_i64).unwrap_or(1);
                let next = ctx.get("count").and_then(Value::as_i64).unwrap_or(0) + by;
                ctx.set("count", json!(next));
                ctx.broadcast("counted", json!({"count": next}));
                Ok(json!(next))
            })
            .depends_on("db", false)
            .build();
        assert_eq!(definition.action_names(), vec!["increment".to_string()]);

        let mut inst = instance(definition);
        let handler = inst.definition.action("increment").unwrap();
        let mut ctx = ActionContext::new(&mut inst);
        assert_eq!(ctx.room(), Some("lobby"));
        let result = handler(&mut ctx, json!({"by": 5})).unwrap();
        let (changed, broadcasts) = ctx.finish();

        assert_eq!(result, json!(5));
        assert!(changed);
        assert_eq!(broadcasts[0].event, "counted");
        assert_eq!(inst.state, json!({"count": 5}));
    }

    #[test]
    fn test_read_only_handler_leaves_state_clean() {
        let definition = ComponentDefinition::builder("Reader")
            .initial_state(json!({"x": 1}))
            .action("read", |ctx, _| Ok(ctx.state().clone()))
            .build();
        let mut inst = instance(definition);
        let handler = inst.definition.action("read").unwrap();
        let mut ctx = ActionContext::new(&mut inst);
        handler(&mut ctx, Value::Null).unwrap();
        assert!(!ctx.state_changed());
    }

    #[test]
    fn test_non_object_initial_state_is_replaced() {
        let definition = ComponentDefinition::builder("X").initial_state(json!(3)).build();
        assert_eq!(definition.initial_state(), &json!({}));
    }
}
