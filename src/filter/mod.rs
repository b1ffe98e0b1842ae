//! Public surface of the event filter
//!
//! [`EventFilter`] spawns the worker loop and hands out event streams and
//! request entry points. Every operation races cleanly against the filter's
//! termination: streams and synchronous requests yield [`Error::Dying`]
//! instead of blocking once the loop is gone.

mod worker;

use std::future;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Mutex};

use crate::backend::Backend;
use crate::common::prelude::*;
use crate::core::types::{CharmUrl, RelationId, ResolvedMode};
use worker::{FilterChannels, FilterWorker};

/// Consumer requests are rendezvous-style; one slot is enough
const REQUEST_BUFFER: usize = 1;

/// Parked event reads; sized for a few abandoned (timed-out) readers
const PULL_BUFFER: usize = 16;

/// Receiving end of one event category.
///
/// [`EventStream::next`] blocks until the filter has an armed event of this
/// category to deliver. Events are coalesced: a read observes the latest
/// pending state, not every intermediate change.
pub struct EventStream<T> {
    pulls: mpsc::Sender<oneshot::Sender<T>>,
}

impl<T> EventStream<T> {
    /// Wait for the next event of this category.
    ///
    /// Returns [`Error::Dying`] once the filter has terminated.
    pub async fn next(&mut self) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pulls
            .send(reply_tx)
            .await
            .map_err(|_| Error::Dying)?;
        reply_rx.await.map_err(|_| Error::Dying)
    }
}

impl<T> Clone for EventStream<T> {
    fn clone(&self) -> Self {
        Self {
            pulls: self.pulls.clone(),
        }
    }
}

/// Handle to a running event filter.
///
/// The filter collects unit, service, config, and relations changes from
/// separate state watchers and presents them as events shaped for the
/// convenience of a unit controller. Dropping the handle shuts the filter
/// down.
pub struct EventFilter {
    set_charm_tx: mpsc::Sender<(CharmUrl, oneshot::Sender<()>)>,
    want_forced_upgrade_tx: mpsc::Sender<bool>,
    want_resolved_tx: mpsc::Sender<()>,
    clear_resolved_tx: mpsc::Sender<oneshot::Sender<()>>,
    discard_config_tx: mpsc::Sender<()>,

    upgrade_pull_tx: mpsc::Sender<oneshot::Sender<CharmUrl>>,
    resolved_pull_tx: mpsc::Sender<oneshot::Sender<ResolvedMode>>,
    config_pull_tx: mpsc::Sender<oneshot::Sender<()>>,
    relations_pull_tx: mpsc::Sender<oneshot::Sender<Vec<RelationId>>>,

    dying_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
    dead_rx: watch::Receiver<bool>,
    error: Arc<Mutex<Option<Error>>>,
}

impl EventFilter {
    /// Spawn a filter for the named unit.
    ///
    /// Must be called from within a tokio runtime. Failures during startup
    /// (unknown unit, backend errors) surface through [`EventFilter::wait`].
    pub fn new<B>(backend: B, unit_name: impl Into<String>) -> Self
    where
        B: Backend + 'static,
    {
        let unit_name = unit_name.into();

        let (set_charm_tx, set_charm_rx) = mpsc::channel(REQUEST_BUFFER);
        let (want_forced_upgrade_tx, want_forced_upgrade_rx) = mpsc::channel(REQUEST_BUFFER);
        let (want_resolved_tx, want_resolved_rx) = mpsc::channel(REQUEST_BUFFER);
        let (clear_resolved_tx, clear_resolved_rx) = mpsc::channel(REQUEST_BUFFER);
        let (discard_config_tx, discard_config_rx) = mpsc::channel(REQUEST_BUFFER);

        let (upgrade_pull_tx, upgrade_pull_rx) = mpsc::channel(PULL_BUFFER);
        let (resolved_pull_tx, resolved_pull_rx) = mpsc::channel(PULL_BUFFER);
        let (config_pull_tx, config_pull_rx) = mpsc::channel(PULL_BUFFER);
        let (relations_pull_tx, relations_pull_rx) = mpsc::channel(PULL_BUFFER);

        let (dying_tx, dying_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dead_tx, dead_rx) = watch::channel(false);
        let error = Arc::new(Mutex::new(None));

        let worker = FilterWorker::new(
            backend,
            unit_name.clone(),
            dying_tx,
            shutdown_rx,
            FilterChannels {
                set_charm: set_charm_rx,
                want_forced_upgrade: want_forced_upgrade_rx,
                want_resolved: want_resolved_rx,
                clear_resolved: clear_resolved_rx,
                discard_config: discard_config_rx,
                upgrade_pulls: upgrade_pull_rx,
                resolved_pulls: resolved_pull_rx,
                config_pulls: config_pull_rx,
                relations_pulls: relations_pull_rx,
            },
        );

        let error_slot = error.clone();
        tokio::spawn(async move {
            match worker.run().await {
                Ok(()) => debug!("filter for unit {} stopped", unit_name),
                Err(err) => {
                    if err.is_terminate_agent() {
                        info!("filter for unit {} terminating agent", unit_name);
                    } else {
                        error!("filter for unit {} failed: {}", unit_name, err);
                    }
                    *error_slot.lock().await = Some(err);
                }
            }
            let _ = dead_tx.send(true);
        });

        Self {
            set_charm_tx,
            want_forced_upgrade_tx,
            want_resolved_tx,
            clear_resolved_tx,
            discard_config_tx,
            upgrade_pull_tx,
            resolved_pull_tx,
            config_pull_tx,
            relations_pull_tx,
            dying_rx,
            shutdown_tx,
            dead_rx,
            error,
        }
    }

    // ─────────────────────────────────────────────────────────
    // Event surface
    // ─────────────────────────────────────────────────────────

    /// Resolves once the unit's life has become Dying; ready forever after.
    ///
    /// Never resolves if the filter terminates while the unit is still
    /// alive.
    pub async fn unit_dying(&self) {
        let mut dying_rx = self.dying_rx.clone();
        if dying_rx.wait_for(|dying| *dying).await.is_err() {
            future::pending::<()>().await;
        }
    }

    /// Upgrade events, one charm URL per indicated upgrade.
    ///
    /// Events are not generated until the baseline has been specified with
    /// [`EventFilter::want_upgrade_event`].
    pub fn upgrade_events(&self) -> EventStream<CharmUrl> {
        EventStream {
            pulls: self.upgrade_pull_tx.clone(),
        }
    }

    /// Resolved-mode events. A `None` mode never generates an event.
    pub fn resolved_events(&self) -> EventStream<ResolvedMode> {
        EventStream {
            pulls: self.resolved_pull_tx.clone(),
        }
    }

    /// Config change events, one tick per coalesced settings change
    pub fn config_events(&self) -> EventStream<()> {
        EventStream {
            pulls: self.config_pull_tx.clone(),
        }
    }

    /// Relations events: the sorted, deduplicated ids of relations that
    /// changed since the last delivery
    pub fn relations_events(&self) -> EventStream<Vec<RelationId>> {
        EventStream {
            pulls: self.relations_pull_tx.clone(),
        }
    }

    // ─────────────────────────────────────────────────────────
    // Requests
    // ─────────────────────────────────────────────────────────

    /// Establish the upgrade baseline and whether only forced upgrades
    /// should generate events. Fire-and-forget; ignored when dying.
    pub async fn want_upgrade_event(&self, must_force: bool) {
        let _ = self.want_forced_upgrade_tx.send(must_force).await;
    }

    /// Ask for a resolved event if one is available (resolved mode is not
    /// `None`). Fire-and-forget; ignored when dying.
    pub async fn want_resolved_event(&self) {
        let _ = self.want_resolved_tx.send(()).await;
    }

    /// Discard any pending config event. Only meaningful once a config
    /// event has been offered; ignored when dying.
    pub async fn discard_config_event(&self) {
        let _ = self.discard_config_tx.send(()).await;
    }

    /// Notify the filter that the unit runs a new charm.
    ///
    /// Blocks until the charm URL is persisted. Afterwards, upgrade events
    /// are only generated for charms other than `url`, a fresh relations
    /// event carries every current relation, and config events follow the
    /// settings of the new charm.
    pub async fn set_charm(&self, url: CharmUrl) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.set_charm_tx
            .send((url, ack_tx))
            .await
            .map_err(|_| Error::Dying)?;
        ack_rx.await.map_err(|_| Error::Dying)
    }

    /// Notify the filter that a resolved event has been handled.
    ///
    /// Guarantees that no stale resolved event arrives after this returns,
    /// unless a new watcher notification lands first.
    pub async fn clear_resolved(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.clear_resolved_tx
            .send(ack_tx)
            .await
            .map_err(|_| Error::Dying)?;
        ack_rx.await.map_err(|_| Error::Dying)?;
        debug!("resolved clear completed");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────

    /// Request shutdown and wait for the loop to finish
    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.wait().await
    }

    /// Wait for the loop to finish and report its terminal error, if any.
    /// A requested stop is a clean exit.
    pub async fn wait(&self) -> Result<()> {
        let mut dead_rx = self.dead_rx.clone();
        let _ = dead_rx.wait_for(|dead| *dead).await;
        match self.error.lock().await.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Observe termination: the receiver reads `true` once the loop is gone
    pub fn dead(&self) -> watch::Receiver<bool> {
        self.dead_rx.clone()
    }
}
