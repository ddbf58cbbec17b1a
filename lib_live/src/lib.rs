//! # lib_live
//!
//! The live component engine. Server-held component instances are mounted,
//! mutated through their action tables, broadcast to rooms and recovered from
//! client-held signed snapshots after a reconnect.
//!
//! Modules are gated by folder-level features (all enabled by default):
//!
//! - **`configs`**: engine configuration with serde defaults.
//! - **`core`**: the engine itself (signature, uploads, connections, registry,
//!   performance monitor, protocol dispatcher).
//! - **`utils`**: time and JSON helpers.

#![forbid(unsafe_code)]

#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "utils")]
pub mod utils;

// Re-export the engine surface
#[cfg(feature = "configs")]
pub use configs::config_live::*;
#[cfg(feature = "core")]
pub use self::core::*;
