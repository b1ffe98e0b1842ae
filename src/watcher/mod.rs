//! Watcher façade over backend change notification streams
//!
//! A watcher delivers coalesced change notifications from the state backend:
//! one pending notification stands for "at least one change since last
//! observation". The consuming side can stop the watcher and retrieve its
//! terminal error; the producing side runs in its own task and reports back
//! through a dedicated channel when it winds down.

use tokio::sync::{mpsc, oneshot};

use crate::common::prelude::*;
use crate::core::types::RelationId;

/// Watcher over payload-free change notifications (unit, service, config)
pub type NotifyWatcher = Watcher<()>;

/// Watcher yielding the ids of changed relations
pub type RelationsWatcher = Watcher<Vec<RelationId>>;

/// Create a connected controller/watcher pair.
///
/// `buffer` bounds the number of undelivered notifications; producers use
/// [`WatcherController::try_notify`], so a full buffer coalesces rather
/// than blocks.
pub fn channel<T>(buffer: usize) -> (WatcherController<T>, Watcher<T>) {
    let (changes_tx, changes_rx) = mpsc::channel(buffer);
    let (stop_tx, stop_rx) = oneshot::channel();
    let (done_tx, done_rx) = oneshot::channel();

    let controller = WatcherController {
        changes: changes_tx,
        stop_rx,
        done_tx,
    };
    let watcher = Watcher {
        changes: changes_rx,
        stop_tx: Some(stop_tx),
        done_rx,
        terminal: None,
    };
    (controller, watcher)
}

/// Consumer half: a stream of change notifications with scoped shutdown
pub struct Watcher<T> {
    changes: mpsc::Receiver<T>,
    stop_tx: Option<oneshot::Sender<()>>,
    done_rx: oneshot::Receiver<Result<()>>,
    /// Cached terminal result, once obtained
    terminal: Option<Result<()>>,
}

impl<T> Watcher<T> {
    /// Receive the next change notification.
    ///
    /// Returns `None` when the stream has closed; if no stop was requested
    /// that means the watcher failed, and [`Watcher::terminal_error`] yields
    /// the reason.
    pub async fn recv(&mut self) -> Option<T> {
        self.changes.recv().await
    }

    /// Stop the watcher and wait for its terminal result. Idempotent.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        self.wait_terminal().await
    }

    /// Obtain the error that closed the change stream.
    ///
    /// A watcher whose stream closed without being asked to stop must have
    /// an error to report; if it claims a clean shutdown anyway, that is
    /// itself reported as a watcher error.
    pub async fn terminal_error(&mut self) -> Error {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        match self.wait_terminal().await {
            Err(err) => err,
            Ok(()) => Error::watcher("watcher closed without reporting an error"),
        }
    }

    async fn wait_terminal(&mut self) -> Result<()> {
        if let Some(result) = &self.terminal {
            return result.clone();
        }
        let result = (&mut self.done_rx)
            .await
            .unwrap_or_else(|_| Err(Error::watcher("watcher terminated without reporting")));
        self.terminal = Some(result.clone());
        result
    }
}

impl<T> Drop for Watcher<T> {
    fn drop(&mut self) {
        // Releases the producer on every exit path; nobody waits for the
        // terminal result here.
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Producer half, owned by the backend task feeding the watcher
pub struct WatcherController<T> {
    changes: mpsc::Sender<T>,
    stop_rx: oneshot::Receiver<()>,
    done_tx: oneshot::Sender<Result<()>>,
}

impl<T> WatcherController<T> {
    /// Deliver a change notification without blocking.
    ///
    /// A full buffer counts as delivered: the notification coalesces into
    /// the one already pending. Returns `false` once the consumer is gone.
    pub fn try_notify(&self, change: T) -> bool {
        match self.changes.try_send(change) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Wait until the consumer requests a stop (or disappears)
    pub async fn stopped(&mut self) {
        let _ = (&mut self.stop_rx).await;
    }

    /// Report the terminal result and close the change stream
    pub fn finish(self, result: Result<()>) {
        if let Err(ref err) = result {
            debug!("watcher finished with error: {}", err);
        }
        let _ = self.done_tx.send(result);
    }
}
