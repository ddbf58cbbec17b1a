//! # Utilities Module
//!
//! General-purpose helpers shared by the engine modules: wall-clock
//! timestamps in the millisecond resolution used on the wire, deterministic
//! JSON rendering and object merging for component state.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Epoch-millisecond clock.
pub mod time;
/// JSON helpers (canonical rendering, shallow merge, size estimation).
pub mod json;

pub use json::{canonical_json, estimate_json_size, merge_objects};
pub use time::now_millis;
