//! # Component Registry
//!
//! Owns every mounted component instance and its metadata shadow record, and
//! drives the component lifecycle: mount, action execution, property updates,
//! rehydration from signed client state, rooms, health checks with recovery,
//! and cleanup when a connection goes away.
//!
//! ## Locking
//!
//! Each map (definitions, instances, metadata, rooms) has its own mutex and no
//! method holds two of them at once. Each instance additionally sits behind
//! its own mutex so actions on one component are serialized. Outbound frames
//! are queued on the connection's channel, never awaited.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::configs::config_live::RegistryConfig;
use crate::core::component::{ActionContext, ComponentDefinition, ComponentInstance, RoomBroadcast};
use crate::core::connections::{ConnectionManager, SendTarget};
use crate::core::error::{LiveError, LiveResult};
use crate::core::performance::PerformanceMonitor;
use crate::core::protocol::{ServerMessage, ServerMessageType};
use crate::core::services::ServiceContainer;
use crate::core::signature::{SignOptions, SignedState, StateSigner};
use crate::utils::{estimate_json_size, merge_objects};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleState {
    Mounting,
    Active,
    Inactive,
    Error,
    Destroying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentMetrics {
    pub render_count: u64,
    pub action_count: u64,
    pub error_count: u64,
    pub average_render_time_ms: f64,
    pub last_render_time_ms: f64,
    pub memory_usage: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub from_version: u64,
    pub to_version: u64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// # Component Metadata
///
/// Registry-side record kept next to each instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentMetadata {
    pub id: String,
    pub name: String,
    pub connection_id: String,
    pub room: Option<String>,
    pub user_id: Option<String>,
    pub version: u64,
    pub state: LifecycleState,
    pub health_status: HealthStatus,
    pub metrics: ComponentMetrics,
    pub dependencies: Vec<String>,
    pub migration_history: Vec<MigrationRecord>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub recovery_attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    pub room: Option<String>,
    pub user_id: Option<String>,
    /// Initial state version; 1 when absent.
    pub version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MountResult {
    pub component_id: String,
    pub initial_state: Value,
    pub signed_state: SignedState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RehydrateFailure {
    Expired,
    Tampered,
}

impl RehydrateFailure {
    /// The engine error reported to the client for this rejection.
    pub fn into_error(self, component_id: &str, reason: impl Into<String>) -> LiveError {
        let component_id = component_id.to_string();
        let reason = reason.into();
        match self {
            RehydrateFailure::Expired => LiveError::SignatureExpired { component_id, reason },
            RehydrateFailure::Tampered => LiveError::SignatureTampered { component_id, reason },
        }
    }

    pub fn code(self) -> &'static str {
        self.into_error("", "").code()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RehydrateResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_component_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_state: Option<SignedState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RehydrateFailure>,
}

impl RehydrateResult {
    fn rejected(reason: RehydrateFailure, error: String) -> Self {
        Self {
            success: false,
            new_component_id: None,
            state: None,
            signed_state: None,
            error: Some(error),
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub checked: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub recovered: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_components: usize,
    pub by_state: BTreeMap<String, usize>,
    pub by_health: BTreeMap<String, usize>,
    pub rooms: usize,
    pub definitions: usize,
    pub total_mounted: u64,
    pub total_unmounted: u64,
}

type SharedInstance = Arc<Mutex<ComponentInstance>>;

/// Data captured under an instance lock and used after it is released.
struct StateSnapshot {
    connection_id: String,
    room: Option<String>,
    state: Value,
    version: u64,
    signed: Option<SignedState>,
}

/// # Component Registry
pub struct ComponentRegistry {
    config: RegistryConfig,
    signer: Arc<StateSigner>,
    connections: Arc<ConnectionManager>,
    monitor: Arc<PerformanceMonitor>,
    services: Arc<ServiceContainer>,
    definitions: Mutex<HashMap<String, Arc<ComponentDefinition>>>,
    discovered: Mutex<HashMap<String, Arc<ComponentDefinition>>>,
    components: Mutex<HashMap<String, SharedInstance>>,
    metadata: Mutex<HashMap<String, ComponentMetadata>>,
    rooms: Mutex<HashMap<String, HashSet<String>>>,
    total_mounted: AtomicU64,
    total_unmounted: AtomicU64,
}

impl ComponentRegistry {
    pub fn new(
        config: RegistryConfig,
        signer: Arc<StateSigner>,
        connections: Arc<ConnectionManager>,
        monitor: Arc<PerformanceMonitor>,
        services: Arc<ServiceContainer>,
    ) -> Self {
        Self {
            config,
            signer,
            connections,
            monitor,
            services,
            definitions: Mutex::new(HashMap::new()),
            discovered: Mutex::new(HashMap::new()),
            components: Mutex::new(HashMap::new()),
            metadata: Mutex::new(HashMap::new()),
            rooms: Mutex::new(HashMap::new()),
            total_mounted: AtomicU64::new(0),
            total_unmounted: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn signer(&self) -> &Arc<StateSigner> {
        &self.signer
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn services(&self) -> &Arc<ServiceContainer> {
        &self.services
    }

    // --- Definitions ---

    pub fn register(&self, definition: ComponentDefinition) {
        let name = definition.name().to_string();
        let mut definitions = self.definitions.lock().expect("Definition lock poisoned");
        if definitions.insert(name.clone(), Arc::new(definition)).is_some() {
            warn!(component = %name, "component definition replaced");
        } else {
            info!(component = %name, "component registered");
        }
    }

    /// Adds a definition found by a discovery step; explicit registrations win.
    pub fn register_discovered(&self, definition: ComponentDefinition) {
        let name = definition.name().to_string();
        let mut discovered = self.discovered.lock().expect("Definition lock poisoned");
        if discovered.insert(name.clone(), Arc::new(definition)).is_some() {
            warn!(component = %name, "discovered definition replaced");
        } else {
            debug!(component = %name, "component discovered");
        }
    }

    pub fn definition_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .definitions
            .lock()
            .expect("Definition lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.extend(
            self.discovered
                .lock()
                .expect("Definition lock poisoned")
                .keys()
                .cloned(),
        );
        names.sort();
        names.dedup();
        names
    }

    fn resolve_definition(&self, name: &str) -> LiveResult<Arc<ComponentDefinition>> {
        if let Some(def) = self
            .definitions
            .lock()
            .expect("Definition lock poisoned")
            .get(name)
        {
            return Ok(def.clone());
        }

        {
            let discovered = self.discovered.lock().expect("Definition lock poisoned");
            for candidate in name_variations(name) {
                if let Some(def) = discovered.get(&candidate) {
                    debug!(requested = name, resolved = %candidate, "component resolved by name variation");
                    return Ok(def.clone());
                }
            }
        }

        Err(LiveError::ComponentNotFound {
            name: name.to_string(),
            available: self.definition_names(),
        })
    }

    // --- Lifecycle ---

    /// Creates an instance bound to `connection_id` and pushes its first signed state.
    pub fn mount(
        &self,
        connection_id: &str,
        component_name: &str,
        props: &Value,
        options: MountOptions,
    ) -> LiveResult<MountResult> {
        let definition = self.resolve_definition(component_name)?;
        let state = merge_objects(definition.initial_state(), props);
        let version = options.version.unwrap_or(1);
        let (component_id, state, signed) = self.instantiate(
            definition,
            connection_id,
            state,
            &options,
            version,
            true,
            ServerMessageType::StateUpdate,
        )?;
        Ok(MountResult {
            component_id,
            initial_state: state,
            signed_state: signed,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn instantiate(
        &self,
        definition: Arc<ComponentDefinition>,
        connection_id: &str,
        state: Value,
        options: &MountOptions,
        version: u64,
        run_mount_hook: bool,
        announce: ServerMessageType,
    ) -> LiveResult<(String, Value, SignedState)> {
        let started = Instant::now();
        let name = definition.name().to_string();

        // Required dependencies are checked before anything is created.
        let mut services = HashMap::new();
        for dep in definition.dependencies() {
            match self.services.resolve(&dep.name) {
                Some(service) => {
                    services.insert(dep.name.clone(), service);
                }
                None if dep.required => {
                    return Err(LiveError::MissingDependency {
                        component: name,
                        dependency: dep.name.clone(),
                    });
                }
                None => warn!(component = %name, dependency = %dep.name, "optional dependency missing, skipped"),
            }
        }

        let component_id = format!("live-{}", Uuid::new_v4());
        let now = Utc::now();
        self.metadata.lock().expect("Metadata lock poisoned").insert(
            component_id.clone(),
            ComponentMetadata {
                id: component_id.clone(),
                name: name.clone(),
                connection_id: connection_id.to_string(),
                room: None,
                user_id: options.user_id.clone(),
                version,
                state: LifecycleState::Mounting,
                health_status: HealthStatus::Healthy,
                metrics: ComponentMetrics::default(),
                dependencies: services.keys().cloned().collect(),
                migration_history: Vec::new(),
                created_at: now,
                last_activity: now,
                recovery_attempts: 0,
            },
        );

        let mut instance = ComponentInstance {
            id: component_id.clone(),
            definition: definition.clone(),
            state,
            room: None,
            user_id: options.user_id.clone(),
            connection_id: connection_id.to_string(),
            version,
            services,
        };

        let mut queued = Vec::new();
        if run_mount_hook {
            if let Some(hook) = definition.on_mount() {
                let mut ctx = ActionContext::new(&mut instance);
                let outcome = hook(&mut ctx);
                let (_, broadcasts) = ctx.finish();
                if let Err(e) = outcome {
                    self.metadata.lock().expect("Metadata lock poisoned").remove(&component_id);
                    error!(component = %name, "mount hook failed: {}", e);
                    return Err(LiveError::ActionExecution {
                        action: "onMount".to_string(),
                        message: e.to_string(),
                    });
                }
                queued = broadcasts;
            }
        }

        let signed = match self.sign_instance(&instance) {
            Ok(signed) => signed,
            Err(e) => {
                self.metadata.lock().expect("Metadata lock poisoned").remove(&component_id);
                return Err(e);
            }
        };
        let state = instance.state.clone();

        self.components
            .lock()
            .expect("Component lock poisoned")
            .insert(component_id.clone(), Arc::new(Mutex::new(instance)));

        if let Some(room) = &options.room {
            self.join_room(&component_id, room)?;
        }

        let payload = json!({ "state": state, "signedState": signed, "version": version });
        self.push(connection_id, &component_id, ServerMessage::new(announce).component(&component_id).payload(payload));

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let memory = estimate_json_size(&state);
        self.update_metadata(&component_id, |meta| {
            meta.state = LifecycleState::Active;
            meta.metrics.render_count += 1;
            meta.metrics.last_render_time_ms = elapsed_ms;
            meta.metrics.average_render_time_ms = elapsed_ms;
            meta.metrics.memory_usage = memory;
        });
        self.monitor.initialize_component(&component_id, &name);
        self.monitor.record_render(&component_id, elapsed_ms);
        self.monitor.record_memory(&component_id, memory as u64);
        self.total_mounted.fetch_add(1, Ordering::Relaxed);

        if let Some(room) = options.room.as_deref() {
            self.fan_out(&component_id, room, queued);
        }

        info!(component = %name, component_id = %component_id, connection_id, version, "component mounted");
        Ok((component_id, state, signed))
    }

    fn instance(&self, component_id: &str) -> LiveResult<SharedInstance> {
        self.components
            .lock()
            .expect("Component lock poisoned")
            .get(component_id)
            .cloned()
            .ok_or_else(|| LiveError::RehydrationRequired {
                component_id: component_id.to_string(),
            })
    }

    pub fn is_mounted(&self, component_id: &str) -> bool {
        self.components
            .lock()
            .expect("Component lock poisoned")
            .contains_key(component_id)
    }

    /// Connection the component is bound to, while it is mounted.
    pub fn owner_of(&self, component_id: &str) -> Option<String> {
        let shared = self.instance(component_id).ok()?;
        let instance = shared.lock().expect("Instance lock poisoned");
        Some(instance.connection_id.clone())
    }

    /// Fails with `RehydrationRequired` unless the component is mounted on `connection_id`.
    ///
    /// A component owned by another connection is reported exactly like a missing one.
    pub fn ensure_owner(&self, connection_id: &str, component_id: &str) -> LiveResult<()> {
        match self.owner_of(component_id) {
            Some(owner) if owner == connection_id => Ok(()),
            Some(owner) => {
                warn!(
                    component_id,
                    connection_id,
                    owner = %owner,
                    security = true,
                    "access to component from foreign connection rejected"
                );
                Err(LiveError::RehydrationRequired {
                    component_id: component_id.to_string(),
                })
            }
            None => Err(LiveError::RehydrationRequired {
                component_id: component_id.to_string(),
            }),
        }
    }

    /// Runs a named action. Failures are recorded and returned, never panicked.
    pub fn execute_action(&self, component_id: &str, action: &str, payload: Value) -> LiveResult<Value> {
        let shared = self.instance(component_id)?;
        let started = Instant::now();

        let (outcome, snapshot, room, broadcasts) = {
            let mut instance = shared.lock().expect("Instance lock poisoned");
            let Some(handler) = instance.definition.action(action) else {
                let component = instance.name().to_string();
                drop(instance);
                self.record_error(component_id);
                self.monitor.record_action(component_id, action, 0.0, false);
                return Err(LiveError::ActionNotFound {
                    component,
                    action: action.to_string(),
                });
            };

            let mut ctx = ActionContext::new(&mut instance);
            let outcome = handler(&mut ctx, payload);
            let (changed, broadcasts) = ctx.finish();

            let snapshot = if outcome.is_ok() && changed {
                instance.version += 1;
                let signed = match self.sign_instance(&instance) {
                    Ok(signed) => Some(signed),
                    Err(e) => {
                        warn!(component_id, "re-signing after action failed: {}", e);
                        None
                    }
                };
                Some(StateSnapshot {
                    connection_id: instance.connection_id.clone(),
                    room: instance.room.clone(),
                    state: instance.state.clone(),
                    version: instance.version,
                    signed,
                })
            } else {
                None
            };
            (outcome, snapshot, instance.room.clone(), broadcasts)
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.monitor.record_action(component_id, action, elapsed_ms, outcome.is_ok());

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                self.record_error(component_id);
                warn!(component_id, action, "action failed: {}", e);
                return Err(LiveError::ActionExecution {
                    action: action.to_string(),
                    message: e.to_string(),
                });
            }
        };

        match snapshot {
            Some(snapshot) => {
                let memory = estimate_json_size(&snapshot.state);
                self.update_metadata(component_id, |meta| {
                    meta.metrics.action_count += 1;
                    meta.metrics.memory_usage = memory;
                    meta.version = snapshot.version;
                    meta.last_activity = Utc::now();
                });
                self.monitor.record_memory(component_id, memory as u64);
                self.push_state_update(component_id, &snapshot, None);
            }
            None => self.update_metadata(component_id, |meta| {
                meta.metrics.action_count += 1;
                meta.last_activity = Utc::now();
            }),
        }

        if let Some(room) = room {
            self.fan_out(component_id, &room, broadcasts);
        } else if !broadcasts.is_empty() {
            debug!(component_id, count = broadcasts.len(), "broadcasts dropped, component has no room");
        }

        debug!(component_id, action, elapsed_ms, "action executed");
        Ok(result)
    }

    /// Sets one top-level state key, re-signs and returns the new state.
    pub fn update_property(&self, component_id: &str, property: &str, value: Value) -> LiveResult<Value> {
        let shared = self.instance(component_id)?;
        let snapshot = {
            let mut instance = shared.lock().expect("Instance lock poisoned");
            if !instance.state.is_object() {
                instance.state = Value::Object(Map::new());
            }
            if let Value::Object(map) = &mut instance.state {
                map.insert(property.to_string(), value);
            }
            instance.version += 1;
            let signed = self.sign_instance(&instance)?;
            StateSnapshot {
                connection_id: instance.connection_id.clone(),
                room: instance.room.clone(),
                state: instance.state.clone(),
                version: instance.version,
                signed: Some(signed),
            }
        };

        let memory = estimate_json_size(&snapshot.state);
        self.update_metadata(component_id, |meta| {
            meta.version = snapshot.version;
            meta.metrics.memory_usage = memory;
            meta.last_activity = Utc::now();
        });
        self.monitor.record_interaction(component_id, "propertyUpdate");
        self.push_state_update(component_id, &snapshot, None);
        Ok(snapshot.state)
    }

    /// Rebuilds a component from client-held signed state.
    ///
    /// Expired or tampered envelopes yield `success: false`; nothing is instantiated.
    pub fn rehydrate(
        &self,
        old_component_id: &str,
        component_name: &str,
        envelope: &SignedState,
        connection_id: &str,
        options: MountOptions,
    ) -> LiveResult<RehydrateResult> {
        let definition = self.resolve_definition(component_name)?;

        let validation = self.signer.validate(envelope, None);
        if validation.expired {
            info!(component_id = old_component_id, "rehydration rejected, state expired");
            return Ok(RehydrateResult::rejected(
                RehydrateFailure::Expired,
                validation.error.unwrap_or_else(|| "State expired".to_string()),
            ));
        }
        if !validation.valid {
            warn!(
                component_id = old_component_id,
                connection_id,
                security = true,
                "rehydration rejected, signature mismatch"
            );
            return Ok(RehydrateResult::rejected(
                RehydrateFailure::Tampered,
                validation.error.unwrap_or_else(|| "State signature invalid".to_string()),
            ));
        }
        if envelope.component_id != old_component_id {
            warn!(
                component_id = old_component_id,
                envelope_component = %envelope.component_id,
                security = true,
                "rehydration rejected, envelope belongs to another component"
            );
            return Ok(RehydrateResult::rejected(
                RehydrateFailure::Tampered,
                "Signed state does not belong to this component".to_string(),
            ));
        }

        let restored = self.signer.extract_data(envelope)?;
        let state = merge_objects(definition.initial_state(), &restored);

        if self.unmount(old_component_id) {
            debug!(component_id = old_component_id, "previous instance replaced by rehydration");
        }

        let (new_id, state, signed) = self.instantiate(
            definition,
            connection_id,
            state,
            &options,
            envelope.version + 1,
            false,
            ServerMessageType::StateRehydrated,
        )?;
        info!(old_component_id, new_component_id = %new_id, "component rehydrated");

        Ok(RehydrateResult {
            success: true,
            new_component_id: Some(new_id),
            state: Some(state),
            signed_state: Some(signed),
            error: None,
            reason: None,
        })
    }

    /// Removes a component. Returns false when it was already gone.
    pub fn unmount(&self, component_id: &str) -> bool {
        let Some(shared) = self
            .components
            .lock()
            .expect("Component lock poisoned")
            .remove(component_id)
        else {
            return false;
        };

        self.update_metadata(component_id, |meta| meta.state = LifecycleState::Destroying);

        let room = {
            let instance = shared.lock().expect("Instance lock poisoned");
            if let Some(hook) = instance.definition.on_destroy() {
                hook(&instance.state);
            }
            instance.room.clone()
        };
        if let Some(room) = room {
            self.remove_from_room(component_id, &room);
        }

        self.metadata.lock().expect("Metadata lock poisoned").remove(component_id);
        self.monitor.remove_component(component_id);
        self.total_unmounted.fetch_add(1, Ordering::Relaxed);
        info!(component_id, "component unmounted");
        true
    }

    /// Unmounts everything bound to the connection, then drops the connection.
    pub fn cleanup_connection(&self, connection_id: &str) -> usize {
        let ids: Vec<String> = {
            let metadata = self.metadata.lock().expect("Metadata lock poisoned");
            metadata
                .values()
                .filter(|m| m.connection_id == connection_id)
                .map(|m| m.id.clone())
                .collect()
        };
        let removed = ids.iter().filter(|id| self.unmount(id)).count();
        self.connections.cleanup_connection(connection_id);
        if removed > 0 {
            info!(connection_id, removed, "connection components cleaned up");
        }
        removed
    }

    /// Counts an error against the component and re-evaluates its health.
    pub fn record_error(&self, component_id: &str) {
        let now = Utc::now();
        let threshold = self.config.error_threshold;
        let idle = ChronoDuration::seconds(self.config.idle_threshold_secs as i64);
        let memory_limit = self.config.memory_threshold_bytes;
        self.update_metadata(component_id, |meta| {
            meta.metrics.error_count += 1;
            meta.health_status = evaluate_health(meta, now, threshold, idle, memory_limit);
        });
    }

    /// Refreshes liveness without touching state.
    pub fn touch(&self, component_id: &str) -> bool {
        let mut found = false;
        self.update_metadata(component_id, |meta| {
            meta.last_activity = Utc::now();
            found = true;
        });
        found
    }

    /// Migrates the component's state to `target_version`. `Ok(false)` when no path exists.
    pub fn migrate_component(&self, component_id: &str, target_version: u64) -> LiveResult<bool> {
        let shared = self.instance(component_id)?;
        let (from, snapshot) = {
            let mut instance = shared.lock().expect("Instance lock poisoned");
            let from = instance.version;
            let envelope = self.signer.sign(&instance.id, &instance.state, from, SignOptions::default())?;
            match self.signer.migrate(&envelope, target_version) {
                Some(migrated) => {
                    instance.state = self.signer.extract_data(&migrated)?;
                    instance.version = target_version;
                    let signed = self.sign_instance(&instance)?;
                    (
                        from,
                        Some(StateSnapshot {
                            connection_id: instance.connection_id.clone(),
                            room: instance.room.clone(),
                            state: instance.state.clone(),
                            version: instance.version,
                            signed: Some(signed),
                        }),
                    )
                }
                None => (from, None),
            }
        };

        let success = snapshot.is_some();
        self.update_metadata(component_id, |meta| {
            meta.migration_history.push(MigrationRecord {
                from_version: from,
                to_version: target_version,
                success,
                timestamp: Utc::now(),
            });
            if success {
                meta.version = target_version;
            }
        });

        match snapshot {
            Some(snapshot) => {
                info!(component_id, from, to = target_version, "component migrated");
                self.push_state_update(component_id, &snapshot, None);
                Ok(true)
            }
            None => {
                warn!(component_id, from, to = target_version, "no migration path");
                Ok(false)
            }
        }
    }

    // --- Rooms ---

    /// Moves the component into `room`, leaving its previous room.
    pub fn join_room(&self, component_id: &str, room: &str) -> LiveResult<()> {
        let shared = self.instance(component_id)?;
        let previous = {
            let mut instance = shared.lock().expect("Instance lock poisoned");
            instance.room.replace(room.to_string())
        };
        if let Some(previous) = previous.filter(|p| p != room) {
            self.remove_from_room(component_id, &previous);
        }
        self.rooms
            .lock()
            .expect("Room lock poisoned")
            .entry(room.to_string())
            .or_default()
            .insert(component_id.to_string());
        self.update_metadata(component_id, |meta| meta.room = Some(room.to_string()));
        debug!(component_id, room, "joined room");
        Ok(())
    }

    pub fn leave_room(&self, component_id: &str, room: &str) -> bool {
        if let Ok(shared) = self.instance(component_id) {
            let mut instance = shared.lock().expect("Instance lock poisoned");
            if instance.room.as_deref() == Some(room) {
                instance.room = None;
            }
        }
        self.update_metadata(component_id, |meta| {
            if meta.room.as_deref() == Some(room) {
                meta.room = None;
            }
        });
        self.remove_from_room(component_id, room)
    }

    fn remove_from_room(&self, component_id: &str, room: &str) -> bool {
        let mut rooms = self.rooms.lock().expect("Room lock poisoned");
        let Some(members) = rooms.get_mut(room) else {
            return false;
        };
        let removed = members.remove(component_id);
        if members.is_empty() {
            rooms.remove(room);
        }
        removed
    }

    pub fn room_members(&self, room: &str) -> Vec<String> {
        let rooms = self.rooms.lock().expect("Room lock poisoned");
        let mut members: Vec<String> = rooms.get(room).map(|m| m.iter().cloned().collect()).unwrap_or_default();
        members.sort();
        members
    }

    /// Sends a `BROADCAST` to every member except `exclude`. Returns the delivered count.
    ///
    /// Peers see the sender's `userId` as `from`, never its component id.
    pub fn broadcast_to_room(&self, room: &str, event: &str, data: &Value, exclude: Option<&str>) -> usize {
        let members = self.room_members(room);
        let (targets, from): (Vec<(String, String)>, Option<String>) = {
            let metadata = self.metadata.lock().expect("Metadata lock poisoned");
            let targets = members
                .iter()
                .filter(|id| Some(id.as_str()) != exclude)
                .filter_map(|id| metadata.get(id).map(|m| (id.clone(), m.connection_id.clone())))
                .collect();
            let from = exclude.and_then(|id| metadata.get(id)).and_then(|m| m.user_id.clone());
            (targets, from)
        };

        let mut delivered = 0;
        for (component_id, connection_id) in targets {
            let msg = ServerMessage::new(ServerMessageType::Broadcast)
                .component(&component_id)
                .room(room)
                .payload(json!({ "event": event, "data": data, "from": from }));
            if self.push(&connection_id, &component_id, msg) {
                delivered += 1;
            }
        }
        debug!(room, event, delivered, "room broadcast");
        delivered
    }

    fn fan_out(&self, component_id: &str, room: &str, broadcasts: Vec<RoomBroadcast>) {
        for b in broadcasts {
            self.broadcast_to_room(room, &b.event, &b.data, Some(component_id));
        }
    }

    // --- Health ---

    /// One health-check tick: classify every active component, recover the unhealthy ones.
    pub fn run_health_check(&self, now: DateTime<Utc>) -> HealthReport {
        let threshold = self.config.error_threshold;
        let idle = ChronoDuration::seconds(self.config.idle_threshold_secs as i64);
        let memory_limit = self.config.memory_threshold_bytes;

        let mut report = HealthReport::default();
        let mut unhealthy = Vec::new();
        {
            let mut metadata = self.metadata.lock().expect("Metadata lock poisoned");
            for meta in metadata.values_mut() {
                if meta.state != LifecycleState::Active {
                    continue;
                }
                report.checked += 1;
                meta.health_status = evaluate_health(meta, now, threshold, idle, memory_limit);
                match meta.health_status {
                    HealthStatus::Healthy => report.healthy += 1,
                    HealthStatus::Degraded => report.degraded += 1,
                    HealthStatus::Unhealthy => {
                        report.unhealthy += 1;
                        unhealthy.push(meta.id.clone());
                    }
                }
            }
        }

        for component_id in unhealthy {
            match self.recover(&component_id) {
                Ok(true) => report.recovered.push(component_id),
                Ok(false) => {}
                Err(e) => error!(component_id = %component_id, "recovery failed: {}", e),
            }
        }
        report
    }

    fn recover(&self, component_id: &str) -> LiveResult<bool> {
        let threshold = self.config.error_threshold;
        let mut attempt = 0;
        let mut still_unhealthy = false;
        self.update_metadata(component_id, |meta| {
            if meta.health_status == HealthStatus::Unhealthy && meta.metrics.error_count > threshold {
                meta.metrics.error_count = 0;
                meta.health_status = HealthStatus::Healthy;
                meta.state = LifecycleState::Active;
                meta.recovery_attempts += 1;
                attempt = meta.recovery_attempts;
                still_unhealthy = true;
            }
        });
        if !still_unhealthy {
            return Ok(false);
        }

        let shared = self.instance(component_id)?;
        let snapshot = {
            let instance = shared.lock().expect("Instance lock poisoned");
            StateSnapshot {
                connection_id: instance.connection_id.clone(),
                room: instance.room.clone(),
                state: instance.state.clone(),
                version: instance.version,
                signed: Some(self.sign_instance(&instance)?),
            }
        };
        self.push_state_update(component_id, &snapshot, Some(json!(true)));
        info!(component_id, attempt, "component recovered");
        Ok(true)
    }

    // --- Accessors ---

    pub fn metadata(&self, component_id: &str) -> Option<ComponentMetadata> {
        self.metadata
            .lock()
            .expect("Metadata lock poisoned")
            .get(component_id)
            .cloned()
    }

    pub fn component_state(&self, component_id: &str) -> Option<Value> {
        let shared = self.instance(component_id).ok()?;
        let instance = shared.lock().expect("Instance lock poisoned");
        Some(instance.state.clone())
    }

    pub fn component_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .components
            .lock()
            .expect("Component lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        {
            let metadata = self.metadata.lock().expect("Metadata lock poisoned");
            stats.total_components = metadata.len();
            for meta in metadata.values() {
                *stats.by_state.entry(label(&meta.state)).or_default() += 1;
                *stats.by_health.entry(label(&meta.health_status)).or_default() += 1;
            }
        }
        stats.rooms = self.rooms.lock().expect("Room lock poisoned").len();
        stats.definitions = self.definition_names().len();
        stats.total_mounted = self.total_mounted.load(Ordering::Relaxed);
        stats.total_unmounted = self.total_unmounted.load(Ordering::Relaxed);
        stats
    }

    // --- Internals ---

    fn sign_instance(&self, instance: &ComponentInstance) -> LiveResult<SignedState> {
        let options = SignOptions {
            compress: estimate_json_size(&instance.state) > self.config.compression_threshold_bytes,
            encrypt: self.config.encrypt_state,
            backup: self.config.backup_state,
        };
        Ok(self.signer.sign(&instance.id, &instance.state, instance.version, options)?)
    }

    fn push_state_update(&self, component_id: &str, snapshot: &StateSnapshot, recovered: Option<Value>) {
        let mut payload = json!({ "state": snapshot.state, "version": snapshot.version });
        if let Some(signed) = &snapshot.signed {
            payload["signedState"] = json!(signed);
        }
        if let Some(flag) = recovered {
            payload["recovered"] = flag;
        }
        let mut msg = ServerMessage::new(ServerMessageType::StateUpdate)
            .component(component_id)
            .payload(payload);
        if let Some(room) = &snapshot.room {
            msg = msg.room(room);
        }
        self.push(&snapshot.connection_id, component_id, msg);
    }

    fn push(&self, connection_id: &str, component_id: &str, msg: ServerMessage) -> bool {
        let frame = msg.to_json();
        let bytes = frame.len();
        let sent = self.connections.send_message(frame, SendTarget::Connection(connection_id));
        if sent {
            self.monitor.record_message_sent(component_id, bytes);
        } else {
            debug!(component_id, connection_id, "push dropped, connection unavailable");
        }
        sent
    }

    fn update_metadata<F>(&self, component_id: &str, update: F)
    where
        F: FnOnce(&mut ComponentMetadata),
    {
        let mut metadata = self.metadata.lock().expect("Metadata lock poisoned");
        if let Some(meta) = metadata.get_mut(component_id) {
            update(meta);
        }
    }
}

fn evaluate_health(
    meta: &ComponentMetadata,
    now: DateTime<Utc>,
    error_threshold: u64,
    idle_threshold: ChronoDuration,
    memory_threshold: usize,
) -> HealthStatus {
    if meta.metrics.error_count > error_threshold {
        HealthStatus::Unhealthy
    } else if now - meta.last_activity > idle_threshold || meta.metrics.memory_usage > memory_threshold {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Lookup order for discovered definitions.
fn name_variations(name: &str) -> Vec<String> {
    let capitalized = {
        let mut chars = name.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
            None => String::new(),
        }
    };
    let mut out = vec![
        name.to_string(),
        format!("{}Component", name),
        capitalized.clone(),
        format!("{}Component", capitalized),
    ];
    if let Some(stripped) = name.strip_suffix("Component") {
        out.push(stripped.to_string());
    }
    out
}

fn label<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::config_live::{ConnectionConfig, PerformanceConfig, SignatureConfig};
    use crate::core::connections::OutboundFrame;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct Harness {
        registry: ComponentRegistry,
        rx: UnboundedReceiver<OutboundFrame>,
    }

    fn counter() -> ComponentDefinition {
        ComponentDefinition::builder("Counter")
            .initial_state(json!({"count": 0}))
            .action("increment", |ctx, _| {
                let next = ctx.get("count").and_then(Value::as_i64).unwrap_or(0) + 1;
                ctx.set("count", json!(next));
                ctx.broadcast("counted", json!({"count": next}));
                Ok(json!({"count": next}))
            })
            .action("peek", |ctx, _| Ok(ctx.state().clone()))
            .action("fail", |_, _| anyhow::bail!("boom"))
            .build()
    }

    fn harness(config: RegistryConfig) -> Harness {
        let signer = Arc::new(StateSigner::new(SignatureConfig::with_secret("registry-test")).unwrap());
        let connections = Arc::new(ConnectionManager::new(ConnectionConfig::default()));
        let monitor = Arc::new(PerformanceMonitor::new(PerformanceConfig::default()));
        let services = Arc::new(ServiceContainer::new());
        let (tx, rx) = mpsc::unbounded_channel();
        connections.register_connection("conn-1", tx, None);
        let registry = ComponentRegistry::new(config, signer, connections, monitor, services);
        registry.register(counter());
        Harness { registry, rx }
    }

    fn frames(rx: &mut UnboundedReceiver<OutboundFrame>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    #[test]
    fn test_mount_pushes_signed_state() {
        let mut h = harness(RegistryConfig::default());
        let mounted = h
            .registry
            .mount("conn-1", "Counter", &json!({"count": 5}), MountOptions::default())
            .unwrap();
        assert_eq!(mounted.initial_state, json!({"count": 5}));
        assert!(h.registry.signer().validate(&mounted.signed_state, None).valid);

        let pushed = frames(&mut h.rx);
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0]["type"], "STATE_UPDATE");
        assert_eq!(pushed[0]["componentId"], json!(mounted.component_id));

        let meta = h.registry.metadata(&mounted.component_id).unwrap();
        assert_eq!(meta.state, LifecycleState::Active);
        assert_eq!(meta.metrics.render_count, 1);
    }

    #[test]
    fn test_unknown_component_lists_available() {
        let h = harness(RegistryConfig::default());
        match h.registry.mount("conn-1", "Nope", &json!({}), MountOptions::default()) {
            Err(LiveError::ComponentNotFound { available, .. }) => assert_eq!(available, vec!["Counter".to_string()]),
            other => panic!("unexpected: {:?}", other.map(|r| r.component_id)),
        }
    }

    #[test]
    fn test_discovered_definitions_resolve_by_variation() {
        let h = harness(RegistryConfig::default());
        h.registry
            .register_discovered(ComponentDefinition::builder("TodoListComponent").build());
        let mounted = h.registry.mount("conn-1", "todoList", &json!({}), MountOptions::default());
        assert!(mounted.is_ok());
    }

    #[test]
    fn test_name_variations_order() {
        assert_eq!(
            name_variations("chatComponent"),
            vec!["chatComponent", "chatComponentComponent", "ChatComponent", "ChatComponentComponent", "chat"]
        );
    }

    #[test]
    fn test_action_bumps_version_and_resigns() {
        let mut h = harness(RegistryConfig::default());
        let id = h
            .registry
            .mount("conn-1", "Counter", &json!({}), MountOptions::default())
            .unwrap()
            .component_id;
        frames(&mut h.rx);

        let result = h.registry.execute_action(&id, "increment", Value::Null).unwrap();
        assert_eq!(result, json!({"count": 1}));
        let pushed = frames(&mut h.rx);
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0]["payload"]["version"], 2);
        let signed: SignedState = serde_json::from_value(pushed[0]["payload"]["signedState"].clone()).unwrap();
        assert!(h.registry.signer().validate(&signed, None).valid);

        // Read-only action: no push.
        h.registry.execute_action(&id, "peek", Value::Null).unwrap();
        assert!(frames(&mut h.rx).is_empty());
    }

    #[test]
    fn test_action_errors_are_recorded() {
        let h = harness(RegistryConfig::default());
        let id = h
            .registry
            .mount("conn-1", "Counter", &json!({}), MountOptions::default())
            .unwrap()
            .component_id;

        let err = h.registry.execute_action(&id, "missing", Value::Null).unwrap_err();
        assert_eq!(err.code(), "ACTION_NOT_FOUND");
        let err = h.registry.execute_action(&id, "fail", Value::Null).unwrap_err();
        assert_eq!(err.code(), "ACTION_FAILED");
        assert_eq!(h.registry.metadata(&id).unwrap().metrics.error_count, 2);
    }

    #[test]
    fn test_action_on_unknown_id_requires_rehydration() {
        let h = harness(RegistryConfig::default());
        match h.registry.execute_action("live-ghost", "increment", Value::Null) {
            Err(LiveError::RehydrationRequired { component_id }) => assert_eq!(component_id, "live-ghost"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unmount_is_idempotent() {
        let h = harness(RegistryConfig::default());
        let id = h
            .registry
            .mount("conn-1", "Counter", &json!({}), MountOptions::default())
            .unwrap()
            .component_id;
        assert!(h.registry.unmount(&id));
        assert!(!h.registry.unmount(&id));
        let stats = h.registry.stats();
        assert_eq!(stats.total_mounted, 1);
        assert_eq!(stats.total_unmounted, 1);
        assert_eq!(stats.total_components, 0);
    }

    #[test]
    fn test_ensure_owner_hides_foreign_components() {
        let h = harness(RegistryConfig::default());
        let id = h
            .registry
            .mount("conn-1", "Counter", &json!({}), MountOptions::default())
            .unwrap()
            .component_id;

        assert!(h.registry.ensure_owner("conn-1", &id).is_ok());
        assert_eq!(h.registry.owner_of(&id).as_deref(), Some("conn-1"));
        match h.registry.ensure_owner("conn-2", &id) {
            Err(LiveError::RehydrationRequired { component_id }) => assert_eq!(component_id, id),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(h.registry.ensure_owner("conn-1", "live-ghost").unwrap_err().is_rehydration_required());
        assert!(h.registry.is_mounted(&id));
    }

    #[test]
    fn test_room_broadcast_excludes_sender() {
        let mut h = harness(RegistryConfig::default());
        let opts = MountOptions {
            room: Some("lobby".into()),
            ..Default::default()
        };
        let sender = MountOptions {
            user_id: Some("alice".into()),
            ..opts.clone()
        };
        let a = h.registry.mount("conn-1", "Counter", &json!({}), sender).unwrap().component_id;
        let b = h.registry.mount("conn-1", "Counter", &json!({}), opts).unwrap().component_id;
        frames(&mut h.rx);

        h.registry.execute_action(&a, "increment", Value::Null).unwrap();
        let pushed = frames(&mut h.rx);
        let broadcasts: Vec<&Value> = pushed.iter().filter(|f| f["type"] == "BROADCAST").collect();
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0]["componentId"], json!(b));
        assert_eq!(broadcasts[0]["payload"]["event"], "counted");
        assert_eq!(broadcasts[0]["payload"]["from"], "alice");
        assert!(!broadcasts[0].to_string().contains(&a));

        assert!(h.registry.leave_room(&b, "lobby"));
        assert_eq!(h.registry.room_members("lobby"), vec![a.clone()]);
        h.registry.unmount(&a);
        assert_eq!(h.registry.stats().rooms, 0);
    }

    #[test]
    fn test_rehydrate_rejects_tampered_state() {
        let h = harness(RegistryConfig::default());
        let mounted = h
            .registry
            .mount("conn-1", "Counter", &json!({"count": 3}), MountOptions::default())
            .unwrap();
        let mut envelope = mounted.signed_state.clone();
        envelope.data["count"] = json!(1_000_000);

        let before = h.registry.component_ids().len();
        let result = h
            .registry
            .rehydrate(&mounted.component_id, "Counter", &envelope, "conn-1", MountOptions::default())
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.reason, Some(RehydrateFailure::Tampered));
        assert_eq!(h.registry.component_ids().len(), before);
    }

    #[test]
    fn test_rehydrate_rejects_foreign_envelope() {
        let h = harness(RegistryConfig::default());
        let mounted = h
            .registry
            .mount("conn-1", "Counter", &json!({}), MountOptions::default())
            .unwrap();
        let result = h
            .registry
            .rehydrate("live-other", "Counter", &mounted.signed_state, "conn-1", MountOptions::default())
            .unwrap();
        assert_eq!(result.reason, Some(RehydrateFailure::Tampered));
    }

    #[test]
    fn test_rehydrate_creates_new_id_with_next_version() {
        let mut h = harness(RegistryConfig::default());
        let mounted = h
            .registry
            .mount("conn-1", "Counter", &json!({"count": 9}), MountOptions::default())
            .unwrap();
        h.registry.unmount(&mounted.component_id);
        frames(&mut h.rx);

        let result = h
            .registry
            .rehydrate(&mounted.component_id, "Counter", &mounted.signed_state, "conn-1", MountOptions::default())
            .unwrap();
        assert!(result.success);
        let new_id = result.new_component_id.unwrap();
        assert_ne!(new_id, mounted.component_id);
        assert_eq!(result.state, Some(json!({"count": 9})));
        assert_eq!(result.signed_state.unwrap().version, 2);
        assert_eq!(frames(&mut h.rx)[0]["type"], "STATE_REHYDRATED");
    }

    #[test]
    fn test_error_threshold_then_recovery() {
        let mut h = harness(RegistryConfig::default());
        let id = h
            .registry
            .mount("conn-1", "Counter", &json!({}), MountOptions::default())
            .unwrap()
            .component_id;
        for _ in 0..11 {
            h.registry.record_error(&id);
        }
        assert_eq!(h.registry.metadata(&id).unwrap().health_status, HealthStatus::Unhealthy);
        frames(&mut h.rx);

        let report = h.registry.run_health_check(Utc::now());
        assert_eq!(report.recovered, vec![id.clone()]);
        let meta = h.registry.metadata(&id).unwrap();
        assert_eq!(meta.metrics.error_count, 0);
        assert_eq!(meta.health_status, HealthStatus::Healthy);
        assert_eq!(meta.recovery_attempts, 1);

        let pushed = frames(&mut h.rx);
        assert_eq!(pushed[0]["payload"]["recovered"], true);
    }

    #[test]
    fn test_idle_component_is_degraded() {
        let h = harness(RegistryConfig::default());
        let id = h
            .registry
            .mount("conn-1", "Counter", &json!({}), MountOptions::default())
            .unwrap()
            .component_id;
        let report = h.registry.run_health_check(Utc::now() + ChronoDuration::seconds(301));
        assert_eq!(report.degraded, 1);
        assert_eq!(h.registry.metadata(&id).unwrap().health_status, HealthStatus::Degraded);
    }

    #[test]
    fn test_missing_required_dependency_blocks_mount() {
        let h = harness(RegistryConfig::default());
        h.registry.register(
            ComponentDefinition::builder("Reports")
                .depends_on("database", true)
                .depends_on("cache", false)
                .build(),
        );
        let err = h
            .registry
            .mount("conn-1", "Reports", &json!({}), MountOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), "MISSING_DEPENDENCY");
        assert!(h.registry.component_ids().is_empty());

        h.registry.services().register_singleton("database", 42u32);
        let id = h
            .registry
            .mount("conn-1", "Reports", &json!({}), MountOptions::default())
            .unwrap()
            .component_id;
        assert_eq!(h.registry.metadata(&id).unwrap().dependencies, vec!["database".to_string()]);
    }

    #[test]
    fn test_failing_mount_hook_leaves_nothing_behind() {
        let h = harness(RegistryConfig::default());
        h.registry.register(
            ComponentDefinition::builder("Broken")
                .on_mount(|_| anyhow::bail!("no"))
                .build(),
        );
        let err = h
            .registry
            .mount("conn-1", "Broken", &json!({}), MountOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), "ACTION_FAILED");
        assert_eq!(h.registry.stats().total_components, 0);
    }

    #[test]
    fn test_migration_records_history() {
        let h = harness(RegistryConfig::default());
        h.registry.signer().register_migration(1, 2, |mut v| {
            v["migrated"] = json!(true);
            Ok(v)
        });
        let id = h
            .registry
            .mount("conn-1", "Counter", &json!({}), MountOptions::default())
            .unwrap()
            .component_id;

        assert!(h.registry.migrate_component(&id, 2).unwrap());
        assert!(!h.registry.migrate_component(&id, 7).unwrap());
        assert_eq!(h.registry.component_state(&id).unwrap()["migrated"], true);

        let history = h.registry.metadata(&id).unwrap().migration_history;
        assert_eq!(history.len(), 2);
        assert!(history[0].success);
        assert!(!history[1].success);
    }

    #[test]
    fn test_cleanup_connection_unmounts_bound_components() {
        let h = harness(RegistryConfig::default());
        h.registry.mount("conn-1", "Counter", &json!({}), MountOptions::default()).unwrap();
        h.registry.mount("conn-1", "Counter", &json!({}), MountOptions::default()).unwrap();
        assert_eq!(h.registry.cleanup_connection("conn-1"), 2);
        assert!(h.registry.component_ids().is_empty());
        assert!(!h.registry.connections().is_connected("conn-1"));
    }

    #[test]
    fn test_update_property() {
        let h = harness(RegistryConfig::default());
        let id = h
            .registry
            .mount("conn-1", "Counter", &json!({}), MountOptions::default())
            .unwrap()
            .component_id;
        let state = h.registry.update_property(&id, "label", json!("clicks")).unwrap();
        assert_eq!(state, json!({"count": 0, "label": "clicks"}));
        assert_eq!(h.registry.metadata(&id).unwrap().version, 2);
        assert!(h.registry.update_property("live-none", "x", json!(1)).is_err());
    }
}
