//! # Core Engine Module
//!
//! The live component engine. Each component is an explicitly constructed
//! value shared by `Arc`; there are no module-level singletons.
//!
//! ## Core Components:
//!
//! - **`registry`**: owns mounted component instances and their metadata,
//!   drives mount/action/rehydrate/unmount, rooms and health recovery.
//!
//! - **`signature`**: HMAC-signed, optionally compressed and encrypted state
//!   envelopes handed to the client, plus server-side backups, versioned
//!   migrations and key rotation.
//!
//! - **`connections`**: outbound channels per socket, pools with load
//!   balancing, heartbeat-based staleness and eviction.
//!
//! - **`uploads`**: chunked file transfer with out-of-order reassembly and
//!   idempotent finalization.
//!
//! - **`performance`**: per-component metrics, rate-limited alerts,
//!   optimization suggestions and a dashboard.
//!
//! - **`dispatcher`**: maps one inbound protocol frame to one engine call and
//!   wraps the outcome into a correlated reply.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Component definitions, instances and the action context.
pub mod component;
/// Bidirectional transport bookkeeping and pool routing.
pub mod connections;
/// Frame-to-engine routing.
pub mod dispatcher;
/// Error taxonomy and wire error codes.
pub mod error;
/// Metrics, alerts and the performance dashboard.
pub mod performance;
/// Client and server frame types.
pub mod protocol;
/// Component lifecycle, rooms and health.
pub mod registry;
/// Typed service container for component dependencies.
pub mod services;
/// Signed state envelopes.
pub mod signature;
/// Chunked upload reassembly.
pub mod uploads;

pub use component::{
    ActionContext, ActionHandler, ComponentDefinition, ComponentDefinitionBuilder, ComponentInstance, Dependency,
    RoomBroadcast,
};
pub use connections::{
    ConnectionManager, ConnectionMetrics, ConnectionStats, HeartbeatReport, OutboundFrame, OutboundSender,
    PoolMetrics, SendTarget,
};
pub use dispatcher::ProtocolDispatcher;
pub use error::{LiveError, LiveResult};
pub use performance::{
    AlertKind, AlertSeverity, ComponentPerformance, OptimizationSuggestion, PerformanceAlert, PerformanceDashboard,
    PerformanceMonitor, SuggestionKind,
};
pub use protocol::{ClientMessage, ClientMessageType, ServerMessage, ServerMessageType};
pub use registry::{
    ComponentMetadata, ComponentRegistry, HealthReport, HealthStatus, LifecycleState, MigrationRecord, MountOptions,
    MountResult, RegistryStats, RehydrateFailure, RehydrateResult,
};
pub use services::{ServiceContainer, ServiceInstance};
pub use signature::{SignOptions, SignatureError, SignedState, StateBackup, StateSigner, ValidationResult};
pub use uploads::{
    ChunkOutcome, UploadComplete, UploadError, UploadManager, UploadProgress, UploadStart, UploadStats,
};
