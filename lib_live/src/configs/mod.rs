//! # Configuration Modules
//!
//! Engine configuration. Every threshold the engine uses (idle time, memory
//! ceilings, error cutoffs, heartbeat windows, upload limits) lives here so the
//! hosting binary can override it from a file or the environment.

/// Engine configuration types and file loading.
pub mod config_live;
