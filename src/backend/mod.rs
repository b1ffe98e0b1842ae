//! State backend capability interface
//!
//! The filter does not talk to a concrete store; it consumes this capability
//! set. Snapshots are fetched fresh on every refresh, and watchers deliver
//! coalesced change notifications (see [`crate::watcher`]).

pub mod memory;

use crate::common::prelude::*;
use crate::core::types::{CharmUrl, Life, ResolvedMode};
use crate::watcher::{NotifyWatcher, RelationsWatcher};

/// Point-in-time view of a unit
#[derive(Debug, Clone)]
pub struct UnitSnapshot {
    pub name: String,
    /// Name of the service this unit belongs to
    pub service: String,
    pub life: Life,
    pub resolved: ResolvedMode,
    /// The charm the unit is currently running; unset until the unit has
    /// adopted one
    pub charm_url: Option<CharmUrl>,
}

/// Point-in-time view of a service
#[derive(Debug, Clone)]
pub struct ServiceSnapshot {
    pub name: String,
    pub life: Life,
    /// The charm the service currently announces
    pub charm_url: CharmUrl,
    /// Whether the announced charm was force-published
    pub force_upgrade: bool,
}

/// State store operations the filter depends on.
///
/// Both the filter loop and out-of-process implementations use this trait.
/// Errors are classified through [`Error::is_not_found`]; any other error is
/// treated as fatal by the filter.
///
/// Watcher contract: a newly created watcher delivers one initial
/// notification reflecting current state (the relations watcher's initial
/// notification carries the full current id set). After that, a notification
/// means at least one change since last observation.
#[trait_variant::make(Backend: Send)]
pub trait LocalBackend {
    /// Fetch a fresh snapshot of the named unit
    async fn unit(&self, name: &str) -> Result<UnitSnapshot>;

    /// Fetch a fresh snapshot of the named service
    async fn service(&self, name: &str) -> Result<ServiceSnapshot>;

    /// Record that the unit is now running the given charm
    async fn set_charm_url(&self, unit: &str, url: &CharmUrl) -> Result<()>;

    /// Clear the unit's resolved marker
    async fn clear_resolved(&self, unit: &str) -> Result<()>;

    /// Request destruction of the unit (advances its life towards Dying)
    async fn destroy_unit(&self, unit: &str) -> Result<()>;

    /// Watch the unit document for changes
    async fn watch_unit(&self, name: &str) -> Result<NotifyWatcher>;

    /// Watch the service document for changes
    async fn watch_service(&self, name: &str) -> Result<NotifyWatcher>;

    /// Watch the unit's config settings.
    ///
    /// Settings documents are charm-scoped, so the watcher is bound to a
    /// charm URL; the filter restarts it whenever the unit changes charm.
    async fn watch_config_settings(&self, unit: &str, charm: &CharmUrl) -> Result<NotifyWatcher>;

    /// Watch the service's relations for changes
    async fn watch_relations(&self, service: &str) -> Result<RelationsWatcher>;
}
