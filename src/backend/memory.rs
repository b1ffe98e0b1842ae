//! In-memory state backend
//!
//! A cloneable, fully functional [`Backend`] backed by plain maps. Mutations
//! fan out to watcher tasks through a broadcast channel, so filter behavior
//! can be driven end-to-end without a real store. The integration tests run
//! against this backend; embedders can use it for local development.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

use super::{Backend, ServiceSnapshot, UnitSnapshot};
use crate::common::prelude::*;
use crate::core::types::{CharmUrl, Life, RelationId, ResolvedMode};
use crate::watcher::{self, NotifyWatcher, RelationsWatcher, WatcherController};

/// Capacity of the state-event fan-out channel
const EVENT_BUS_CAPACITY: usize = 64;

/// Buffer for payload-free watchers; one slot coalesces naturally
const NOTIFY_BUFFER: usize = 1;

/// Buffer for relations watchers, which carry ids per notification
const RELATIONS_BUFFER: usize = 16;

/// State mutation notifications fanned out to watcher tasks
#[derive(Debug, Clone)]
enum StateEvent {
    Unit(String),
    Service(String),
    Config(CharmUrl),
    Relations {
        service: String,
        ids: Vec<RelationId>,
    },
}

#[derive(Debug, Clone)]
struct UnitRecord {
    service: String,
    life: Life,
    resolved: ResolvedMode,
    charm_url: Option<CharmUrl>,
}

#[derive(Debug, Clone)]
struct ServiceRecord {
    life: Life,
    charm_url: CharmUrl,
    force_upgrade: bool,
    relations: Vec<RelationId>,
}

#[derive(Default)]
struct MemoryState {
    units: HashMap<String, UnitRecord>,
    services: HashMap<String, ServiceRecord>,
}

/// In-memory implementation of [`Backend`]
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    events: broadcast::Sender<StateEvent>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            events,
        }
    }

    fn publish(&self, event: StateEvent) {
        // No receivers just means nobody is watching yet
        let _ = self.events.send(event);
    }

    // ─────────────────────────────────────────────────────────
    // Mutator surface (used by tests and embedders)
    // ─────────────────────────────────────────────────────────

    pub async fn add_service(&self, name: &str, charm_url: CharmUrl, force_upgrade: bool) {
        let mut state = self.state.lock().await;
        state.services.insert(
            name.to_string(),
            ServiceRecord {
                life: Life::Alive,
                charm_url,
                force_upgrade,
                relations: Vec::new(),
            },
        );
    }

    pub async fn add_unit(&self, name: &str, service: &str, charm_url: Option<CharmUrl>) {
        let mut state = self.state.lock().await;
        state.units.insert(
            name.to_string(),
            UnitRecord {
                service: service.to_string(),
                life: Life::Alive,
                resolved: ResolvedMode::None,
                charm_url,
            },
        );
    }

    /// Announce a new charm for the service
    pub async fn set_service_charm(&self, name: &str, charm_url: CharmUrl, force_upgrade: bool) {
        {
            let mut state = self.state.lock().await;
            let Some(record) = state.services.get_mut(name) else {
                warn!("set_service_charm: unknown service {}", name);
                return;
            };
            record.charm_url = charm_url;
            record.force_upgrade = force_upgrade;
        }
        self.publish(StateEvent::Service(name.to_string()));
    }

    pub async fn set_service_life(&self, name: &str, life: Life) {
        {
            let mut state = self.state.lock().await;
            let Some(record) = state.services.get_mut(name) else {
                warn!("set_service_life: unknown service {}", name);
                return;
            };
            record.life = life;
        }
        self.publish(StateEvent::Service(name.to_string()));
    }

    pub async fn remove_service(&self, name: &str) {
        {
            let mut state = self.state.lock().await;
            state.services.remove(name);
        }
        self.publish(StateEvent::Service(name.to_string()));
    }

    pub async fn set_unit_life(&self, name: &str, life: Life) {
        {
            let mut state = self.state.lock().await;
            let Some(record) = state.units.get_mut(name) else {
                warn!("set_unit_life: unknown unit {}", name);
                return;
            };
            record.life = life;
        }
        self.publish(StateEvent::Unit(name.to_string()));
    }

    pub async fn set_resolved(&self, name: &str, resolved: ResolvedMode) {
        {
            let mut state = self.state.lock().await;
            let Some(record) = state.units.get_mut(name) else {
                warn!("set_resolved: unknown unit {}", name);
                return;
            };
            record.resolved = resolved;
        }
        self.publish(StateEvent::Unit(name.to_string()));
    }

    pub async fn remove_unit(&self, name: &str) {
        {
            let mut state = self.state.lock().await;
            state.units.remove(name);
        }
        self.publish(StateEvent::Unit(name.to_string()));
    }

    /// Record a settings change for the given charm's config document
    pub async fn update_config(&self, charm: &CharmUrl) {
        self.publish(StateEvent::Config(charm.clone()));
    }

    /// Add relations to a service.
    ///
    /// The resulting notification carries `ids` exactly as given, duplicates
    /// and already-known ids included; deduplication is the consumer's job.
    pub async fn add_relations(&self, service: &str, ids: &[RelationId]) {
        {
            let mut state = self.state.lock().await;
            let Some(record) = state.services.get_mut(service) else {
                warn!("add_relations: unknown service {}", service);
                return;
            };
            for id in ids {
                if !record.relations.contains(id) {
                    record.relations.push(*id);
                }
            }
        }
        self.publish(StateEvent::Relations {
            service: service.to_string(),
            ids: ids.to_vec(),
        });
    }

    fn spawn_notify_watcher(
        &self,
        matches: impl Fn(&StateEvent) -> bool + Send + Sync + 'static,
    ) -> NotifyWatcher {
        let events = self.events.subscribe();
        let (mut controller, watcher) = watcher::channel(NOTIFY_BUFFER);
        tokio::spawn(async move {
            // A fresh watcher reports current state as its first change
            if !controller.try_notify(()) {
                controller.finish(Ok(()));
                return;
            }
            let result = run_watcher(&mut controller, events, |event| {
                matches(event).then_some(())
            })
            .await;
            controller.finish(result);
        });
        watcher
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward matching state events into the watcher channel until stopped
async fn run_watcher<T>(
    controller: &mut WatcherController<T>,
    mut events: broadcast::Receiver<StateEvent>,
    mut payload: impl FnMut(&StateEvent) -> Option<T>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = controller.stopped() => return Ok(()),
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(change) = payload(&event) {
                        if !controller.try_notify(change) {
                            return Ok(());
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("watcher lagged behind {} state events", missed);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::backend("state store dropped"));
                }
            }
        }
    }
}

impl Backend for MemoryBackend {
    async fn unit(&self, name: &str) -> Result<UnitSnapshot> {
        let state = self.state.lock().await;
        let record = state
            .units
            .get(name)
            .ok_or_else(|| Error::not_found(format!("unit {}", name)))?;
        Ok(UnitSnapshot {
            name: name.to_string(),
            service: record.service.clone(),
            life: record.life,
            resolved: record.resolved,
            charm_url: record.charm_url.clone(),
        })
    }

    async fn service(&self, name: &str) -> Result<ServiceSnapshot> {
        let state = self.state.lock().await;
        let record = state
            .services
            .get(name)
            .ok_or_else(|| Error::not_found(format!("service {}", name)))?;
        Ok(ServiceSnapshot {
            name: name.to_string(),
            life: record.life,
            charm_url: record.charm_url.clone(),
            force_upgrade: record.force_upgrade,
        })
    }

    async fn set_charm_url(&self, unit: &str, url: &CharmUrl) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let record = state
                .units
                .get_mut(unit)
                .ok_or_else(|| Error::not_found(format!("unit {}", unit)))?;
            record.charm_url = Some(url.clone());
        }
        self.publish(StateEvent::Unit(unit.to_string()));
        Ok(())
    }

    async fn clear_resolved(&self, unit: &str) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let record = state
                .units
                .get_mut(unit)
                .ok_or_else(|| Error::not_found(format!("unit {}", unit)))?;
            record.resolved = ResolvedMode::None;
        }
        self.publish(StateEvent::Unit(unit.to_string()));
        Ok(())
    }

    async fn destroy_unit(&self, unit: &str) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let record = state
                .units
                .get_mut(unit)
                .ok_or_else(|| Error::not_found(format!("unit {}", unit)))?;
            if record.life == Life::Alive {
                record.life = Life::Dying;
            }
        }
        self.publish(StateEvent::Unit(unit.to_string()));
        Ok(())
    }

    async fn watch_unit(&self, name: &str) -> Result<NotifyWatcher> {
        {
            let state = self.state.lock().await;
            if !state.units.contains_key(name) {
                return Err(Error::not_found(format!("unit {}", name)));
            }
        }
        let name = name.to_string();
        Ok(self.spawn_notify_watcher(move |event| matches!(event, StateEvent::Unit(n) if *n == name)))
    }

    async fn watch_service(&self, name: &str) -> Result<NotifyWatcher> {
        {
            let state = self.state.lock().await;
            if !state.services.contains_key(name) {
                return Err(Error::not_found(format!("service {}", name)));
            }
        }
        let name = name.to_string();
        Ok(self
            .spawn_notify_watcher(move |event| matches!(event, StateEvent::Service(n) if *n == name)))
    }

    async fn watch_config_settings(&self, unit: &str, charm: &CharmUrl) -> Result<NotifyWatcher> {
        {
            let state = self.state.lock().await;
            if !state.units.contains_key(unit) {
                return Err(Error::not_found(format!("unit {}", unit)));
            }
        }
        let charm = charm.clone();
        Ok(self.spawn_notify_watcher(move |event| matches!(event, StateEvent::Config(c) if *c == charm)))
    }

    async fn watch_relations(&self, service: &str) -> Result<RelationsWatcher> {
        // Subscribe before snapshotting so no mutation can fall in between;
        // a duplicated id is harmless, the consumer deduplicates.
        let events = self.events.subscribe();
        let initial = {
            let state = self.state.lock().await;
            let record = state
                .services
                .get(service)
                .ok_or_else(|| Error::not_found(format!("service {}", service)))?;
            record.relations.clone()
        };
        let service = service.to_string();
        let (mut controller, watcher) = watcher::channel(RELATIONS_BUFFER);
        tokio::spawn(async move {
            if !controller.try_notify(initial) {
                controller.finish(Ok(()));
                return;
            }
            let result = run_watcher(&mut controller, events, |event| match event {
                StateEvent::Relations { service: s, ids } if *s == service => Some(ids.clone()),
                _ => None,
            })
            .await;
            controller.finish(result);
        });
        Ok(watcher)
    }
}
