//! The filter's event loop
//!
//! A single task owns every piece of mutable filter state. It multiplexes
//! the four backend watchers, the consumer request channels, and the armed
//! event deliveries through one `select!`, so watcher restarts and state
//! refreshes always happen at safe points.
//!
//! An output category is "armed" when its pending-state field says so; the
//! matching delivery branch is enabled only while armed, which is how an
//! event can be withdrawn (a pending upgrade wiped by `SetCharm`, or by the
//! unit going Dying) before anyone observes it.

use std::future;
use std::mem;

use tokio::sync::{mpsc, oneshot, watch};

use crate::backend::Backend;
use crate::common::prelude::*;
use crate::core::types::{CharmUrl, Life, RelationId, ResolvedMode};
use crate::watcher::{NotifyWatcher, RelationsWatcher};

/// A charm announcement: where an upgrade comes from, or is available from
#[derive(Debug, Clone, Default)]
struct CharmSource {
    url: Option<CharmUrl>,
    force: bool,
}

/// Receiver ends of every channel the loop serves
pub(crate) struct FilterChannels {
    pub(crate) set_charm: mpsc::Receiver<(CharmUrl, oneshot::Sender<()>)>,
    pub(crate) want_forced_upgrade: mpsc::Receiver<bool>,
    pub(crate) want_resolved: mpsc::Receiver<()>,
    pub(crate) clear_resolved: mpsc::Receiver<oneshot::Sender<()>>,
    pub(crate) discard_config: mpsc::Receiver<()>,
    pub(crate) upgrade_pulls: mpsc::Receiver<oneshot::Sender<CharmUrl>>,
    pub(crate) resolved_pulls: mpsc::Receiver<oneshot::Sender<ResolvedMode>>,
    pub(crate) config_pulls: mpsc::Receiver<oneshot::Sender<()>>,
    pub(crate) relations_pulls: mpsc::Receiver<oneshot::Sender<Vec<RelationId>>>,
}

/// Single-owner state aggregator behind an [`crate::filter::EventFilter`]
pub(crate) struct FilterWorker<B> {
    backend: B,
    unit_name: String,
    service_name: String,

    // Collected state, used to detect interesting changes
    life: Life,
    resolved: ResolvedMode,
    upgrade_from: CharmSource,
    upgrade_available: CharmSource,
    /// Set once the consumer has established its upgrade baseline with
    /// `WantUpgradeEvent`; nothing arms before that.
    upgrade_requested: bool,

    // Armed outputs
    out_upgrade: Option<CharmUrl>,
    out_resolved: bool,
    out_config: bool,
    /// Pending relation ids; non-empty means the relations event is armed
    relations: Vec<RelationId>,

    /// Config discards only apply once a config event has been offered
    config_seen: bool,

    dying_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    chans: FilterChannels,
}

impl<B: Backend> FilterWorker<B> {
    pub(crate) fn new(
        backend: B,
        unit_name: String,
        dying_tx: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
        chans: FilterChannels,
    ) -> Self {
        Self {
            backend,
            unit_name,
            service_name: String::new(),
            life: Life::Alive,
            resolved: ResolvedMode::None,
            upgrade_from: CharmSource::default(),
            upgrade_available: CharmSource::default(),
            upgrade_requested: false,
            out_upgrade: None,
            out_resolved: false,
            out_config: false,
            relations: Vec::new(),
            config_seen: false,
            dying_tx,
            shutdown_rx,
            chans,
        }
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        info!("starting event filter for unit {}", self.unit_name);

        let unit = self.backend.unit(&self.unit_name).await?;
        self.service_name = unit.service.clone();
        self.unit_changed().await?;
        self.service_changed().await?;

        let mut unitw = self.backend.watch_unit(&self.unit_name).await?;
        let mut servicew = self.backend.watch_service(&self.service_name).await?;
        let mut configw = match &unit.charm_url {
            Some(curl) => {
                self.upgrade_from.url = Some(curl.clone());
                Some(
                    self.backend
                        .watch_config_settings(&self.unit_name, curl)
                        .await?,
                )
            }
            None => None,
        };
        let mut relationsw = self.backend.watch_relations(&self.service_name).await?;

        let result = self
            .event_loop(&mut unitw, &mut servicew, &mut configw, &mut relationsw)
            .await;

        // Stop watchers in reverse acquisition order. A watcher's terminal
        // error only becomes the loop result when the loop itself exited
        // cleanly.
        let mut result = join_stop(result, relationsw.stop().await);
        if let Some(w) = configw.as_mut() {
            result = join_stop(result, w.stop().await);
        }
        let result = join_stop(result, servicew.stop().await);
        join_stop(result, unitw.stop().await)
    }

    async fn event_loop(
        &mut self,
        unitw: &mut NotifyWatcher,
        servicew: &mut NotifyWatcher,
        configw: &mut Option<NotifyWatcher>,
        relationsw: &mut RelationsWatcher,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    debug!("filter loop stopping");
                    return Ok(());
                }

                // Watcher changes.
                change = unitw.recv() => match change {
                    Some(()) => {
                        debug!("got unit change");
                        self.unit_changed().await?;
                    }
                    None => return Err(unitw.terminal_error().await),
                },
                change = servicew.recv() => match change {
                    Some(()) => {
                        debug!("got service change");
                        self.service_changed().await?;
                    }
                    None => return Err(servicew.terminal_error().await),
                },
                change = config_changes(&mut *configw) => {
                    change?;
                    debug!("got config change");
                    self.out_config = true;
                    self.config_seen = true;
                },
                change = relationsw.recv() => match change {
                    Some(ids) => {
                        debug!("got relations change");
                        self.relations_changed(ids);
                    }
                    None => return Err(relationsw.terminal_error().await),
                },

                // Deliveries on armed outputs.
                Some(reply) = self.chans.upgrade_pulls.recv(), if self.out_upgrade.is_some() => {
                    if let Some(url) = self.out_upgrade.take() {
                        match reply.send(url) {
                            Ok(()) => debug!("sent upgrade event"),
                            // Reader gave up; the event stays armed
                            Err(url) => self.out_upgrade = Some(url),
                        }
                    }
                },
                Some(reply) = self.chans.resolved_pulls.recv(), if self.out_resolved => {
                    if reply.send(self.resolved).is_ok() {
                        debug!("sent resolved event");
                        self.out_resolved = false;
                    }
                },
                Some(reply) = self.chans.config_pulls.recv(), if self.out_config => {
                    if reply.send(()).is_ok() {
                        debug!("sent config event");
                        self.out_config = false;
                    }
                },
                Some(reply) = self.chans.relations_pulls.recv(), if !self.relations.is_empty() => {
                    let ids = mem::take(&mut self.relations);
                    match reply.send(ids) {
                        Ok(()) => debug!("sent relations event"),
                        Err(ids) => self.relations = ids,
                    }
                },

                // Consumer requests.
                Some((url, ack)) = self.chans.set_charm.recv() => {
                    self.set_charm(url, ack, configw, relationsw).await?;
                },
                Some(force) = self.chans.want_forced_upgrade.recv() => {
                    debug!("want forced upgrade: {}", force);
                    self.upgrade_from.force = force;
                    self.upgrade_requested = true;
                    self.upgrade_changed();
                },
                Some(()) = self.chans.want_resolved.recv() => {
                    debug!("want resolved event");
                    if self.resolved.is_set() {
                        self.out_resolved = true;
                    }
                },
                Some(ack) = self.chans.clear_resolved.recv() => {
                    debug!("clearing resolved flag");
                    self.out_resolved = false;
                    self.backend.clear_resolved(&self.unit_name).await?;
                    self.unit_changed().await?;
                    let _ = ack.send(());
                },
                Some(()) = self.chans.discard_config.recv(), if self.config_seen => {
                    debug!("discarded config event");
                    self.out_config = false;
                },
            }
        }
    }

    /// Adopt a new charm: persist the URL, restart the charm-scoped config
    /// watcher, and refresh the relations view under the new charm.
    async fn set_charm(
        &mut self,
        url: CharmUrl,
        ack: oneshot::Sender<()>,
        configw: &mut Option<NotifyWatcher>,
        relationsw: &mut RelationsWatcher,
    ) -> Result<()> {
        debug!("changing charm to {}", url);

        // The old watcher must stop before the charm URL changes: settings
        // documents are charm-scoped, and the old one may vanish with the
        // last reference to the old charm.
        if let Some(mut w) = configw.take() {
            w.stop().await?;
        }
        self.backend.set_charm_url(&self.unit_name, &url).await?;
        let _ = ack.send(());

        *configw = Some(
            self.backend
                .watch_config_settings(&self.unit_name, &url)
                .await?,
        );

        // Restart the relations watcher so the consumer gets a fresh full
        // view of relations under the new charm.
        relationsw.stop().await?;
        *relationsw = self.backend.watch_relations(&self.service_name).await?;

        // Any config event observed under the old charm is stale now; the
        // fresh watcher's initial notification re-arms.
        self.out_config = false;
        self.upgrade_from.url = Some(url);
        self.upgrade_changed();
        Ok(())
    }

    /// Respond to changes in the unit
    async fn unit_changed(&mut self) -> Result<()> {
        let unit = match self.backend.unit(&self.unit_name).await {
            Ok(unit) => unit,
            Err(err) if err.is_not_found() => return Err(Error::TerminateAgent),
            Err(err) => return Err(err),
        };
        if self.life != unit.life {
            self.life = unit.life;
            match self.life {
                Life::Dying => {
                    info!("unit {} is dying", self.unit_name);
                    // Transition-guarded, so this fires exactly once
                    let _ = self.dying_tx.send(true);
                    self.out_upgrade = None;
                }
                Life::Dead => {
                    info!("unit {} is dead", self.unit_name);
                    return Err(Error::TerminateAgent);
                }
                Life::Alive => {}
            }
        }
        if unit.resolved != self.resolved {
            self.resolved = unit.resolved;
            if self.resolved.is_set() {
                self.out_resolved = true;
            }
        }
        Ok(())
    }

    /// Respond to changes in the service
    async fn service_changed(&mut self) -> Result<()> {
        let service = match self.backend.service(&self.service_name).await {
            Ok(service) => service,
            Err(err) if err.is_not_found() => return Err(Error::ServiceRemoved),
            Err(err) => return Err(err),
        };
        self.upgrade_available = CharmSource {
            url: Some(service.charm_url),
            force: service.force_upgrade,
        };
        match service.life {
            Life::Dying => {
                info!(
                    "service {} is dying, destroying unit {}",
                    self.service_name, self.unit_name
                );
                self.backend.destroy_unit(&self.unit_name).await?;
            }
            Life::Dead => return Err(Error::ServiceDead),
            Life::Alive => {}
        }
        self.upgrade_changed();
        Ok(())
    }

    /// Re-evaluate whether a pending upgrade should be offered
    fn upgrade_changed(&mut self) {
        self.out_upgrade = upgrade_candidate(
            self.life,
            self.upgrade_requested,
            &self.upgrade_from,
            &self.upgrade_available,
        );
        match &self.out_upgrade {
            Some(url) => debug!("preparing upgrade event for {}", url),
            None => debug!("no upgrade event pending"),
        }
    }

    /// Fold newly changed relation ids into the pending delivery
    fn relations_changed(&mut self, ids: Vec<RelationId>) {
        merge_relation_ids(&mut self.relations, &ids);
    }
}

/// Receive from the config watcher, which only exists once a charm has been
/// adopted. Pends forever while absent; surfaces the terminal error when the
/// stream closes.
async fn config_changes(watcher: &mut Option<NotifyWatcher>) -> Result<()> {
    match watcher {
        Some(w) => match w.recv().await {
            Some(()) => Ok(()),
            None => Err(w.terminal_error().await),
        },
        None => future::pending().await,
    }
}

/// Decide the pending upgrade, if any.
///
/// In order: a unit that is not alive, or has not yet adopted a charm, or
/// whose consumer has not yet stated an upgrade baseline, gets nothing. A
/// candidate equal to the adopted charm is no upgrade. Otherwise the
/// candidate is offered unless the consumer asked for forced upgrades only
/// and the candidate is unforced.
fn upgrade_candidate(
    life: Life,
    baseline_requested: bool,
    from: &CharmSource,
    available: &CharmSource,
) -> Option<CharmUrl> {
    if !life.is_alive() {
        return None;
    }
    let from_url = from.url.as_ref()?;
    if !baseline_requested {
        return None;
    }
    let available_url = available.url.as_ref()?;
    if available_url == from_url {
        return None;
    }
    if available.force || !from.force {
        return Some(available_url.clone());
    }
    None
}

/// Append ids not already pending, keeping the delivery sorted
fn merge_relation_ids(pending: &mut Vec<RelationId>, incoming: &[RelationId]) {
    for id in incoming {
        if !pending.contains(id) {
            pending.push(*id);
        }
    }
    pending.sort_unstable();
}

fn join_stop(result: Result<()>, stop: Result<()>) -> Result<()> {
    match result {
        Err(err) => Err(err),
        Ok(()) => stop,
    }
}
