//! Unit Filter
//!
//! A library for turning raw state-store watcher notifications about a unit,
//! its service, its charm configuration, and its relations into the small set
//! of coalesced, semantically meaningful event streams that a unit controller
//! wants to consume.

// Module declarations
pub mod backend;
pub mod common;
pub mod core;
pub mod filter;
pub mod watcher;

// Re-export main entry points
pub use backend::{Backend, ServiceSnapshot, UnitSnapshot};
pub use common::error::{Error, Result};
pub use core::types::{CharmUrl, Life, RelationId, ResolvedMode};
pub use filter::{EventFilter, EventStream};
