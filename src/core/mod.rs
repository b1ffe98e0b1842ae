//! Core domain types

pub mod types;

pub use types::{CharmUrl, Life, RelationId, ResolvedMode};
