//! Background position poller.
//!
//! While the port is open and the poller is not paused, it reads every
//! enabled axis's position once per update interval and publishes the
//! snapshot on a broadcast channel for whoever is listening (the drawing
//! collaborator, the console printer). Coordinated operations pause it while
//! they own the target-ladder axes, and resume it afterwards.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;

use crate::axis::Snapshot;
use crate::client::DriveController;

/// Default pause between polling passes.
pub const UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to the polling task.
pub struct Poller {
    task: JoinHandle<()>,
    paused_tx: watch::Sender<bool>,
    stop: Arc<Notify>,
    snapshots: broadcast::Sender<Snapshot>,
}

impl Poller {
    /// Spawn the poller.
    pub fn spawn(client: Arc<DriveController>, interval: Duration) -> Self {
        let (paused_tx, mut paused_rx) = watch::channel(false);
        let (snapshots, _) = broadcast::channel(64);
        let stop = Arc::new(Notify::new());

        let task_stop = stop.clone();
        let task_snapshots = snapshots.clone();
        let task = tokio::spawn(async move {
            loop {
                let connected = client.is_connected().await;
                let paused = *paused_rx.borrow_and_update();
                if connected && !paused {
                    let started = tokio::time::Instant::now();
                    let snapshot = client.poll_positions(None).await;
                    // Publishing fails only when nobody is subscribed.
                    let _ = task_snapshots.send(snapshot);
                    let elapsed = started.elapsed();
                    let remaining = interval.saturating_sub(elapsed);
                    tokio::select! {
                        _ = tokio::time::sleep(remaining) => {}
                        _ = paused_rx.changed() => {}
                        _ = task_stop.notified() => break,
                    }
                } else {
                    // Stay alive but idle while disconnected or paused.
                    tokio::select! {
                        _ = tokio::time::sleep(UPDATE_INTERVAL) => {}
                        _ = paused_rx.changed() => {}
                        _ = task_stop.notified() => break,
                    }
                }
            }
            debug!("poller stopped");
        });

        Self {
            task,
            paused_tx,
            stop,
            snapshots,
        }
    }

    /// Subscribe to published snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<Snapshot> {
        self.snapshots.subscribe()
    }

    /// Stop polling until [`resume`](Self::resume); used by coordinated
    /// operations that want the link to themselves.
    pub fn pause(&self) {
        let _ = self.paused_tx.send(true);
    }

    /// Restart polling after a pause.
    pub fn resume(&self) {
        let _ = self.paused_tx.send(false);
    }

    /// Whether the poller is currently paused.
    pub fn is_paused(&self) -> bool {
        *self.paused_tx.borrow()
    }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(self) {
        self.stop.notify_one();
        let _ = self.task.await;
    }
}
