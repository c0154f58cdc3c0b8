//! Background sync worker
//!
//! Turns connectivity edges, the interval timer and explicit requests into
//! sync passes. Passes are spawned rather than awaited inline so a trigger
//! arriving mid-pass hits the engine's in-flight guard and is coalesced.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use super::engine::WeakSyncEngine;
use super::SyncTrigger;

/// Commands for the sync worker
#[derive(Debug)]
pub enum WorkerCommand {
    /// Run a pass
    Sync(SyncTrigger),
    /// Stop the worker
    Stop,
}

/// Background sync worker
pub struct SyncWorker {
    sender: mpsc::Sender<WorkerCommand>,
    handle: JoinHandle<()>,
}

impl SyncWorker {
    /// Start the worker on the current runtime
    pub(crate) fn start(
        engine: WeakSyncEngine,
        mut online: watch::Receiver<bool>,
        period: Option<Duration>,
    ) -> Self {
        let (sender, mut receiver) = mpsc::channel::<WorkerCommand>(32);

        let handle = tokio::spawn(async move {
            let mut was_online = *online.borrow_and_update();
            let mut ticker = period.map(|period| {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });

            tracing::debug!(
                "Sync worker started (online: {}, interval: {:?})",
                was_online,
                period
            );

            loop {
                tokio::select! {
                    cmd = receiver.recv() => match cmd {
                        Some(WorkerCommand::Sync(trigger)) => {
                            if !spawn_pass(&engine, trigger) {
                                break;
                            }
                        }
                        Some(WorkerCommand::Stop) | None => break,
                    },
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let now_online = *online.borrow_and_update();
                        if now_online && !was_online {
                            tracing::info!("Connectivity restored, starting sync");
                            if !spawn_pass(&engine, SyncTrigger::Reconnect) {
                                break;
                            }
                        } else if !now_online && was_online {
                            tracing::info!("Connectivity lost, sync paused");
                        }
                        was_online = now_online;
                    }
                    _ = next_tick(&mut ticker) => {
                        if was_online && !spawn_pass(&engine, SyncTrigger::Periodic) {
                            break;
                        }
                    }
                }
            }

            tracing::debug!("Sync worker stopped");
        });

        Self { sender, handle }
    }

    /// Ask the worker to run a pass. Returns false if the worker is gone.
    pub fn request(&self, trigger: SyncTrigger) -> bool {
        match self.sender.try_send(WorkerCommand::Sync(trigger)) {
            Ok(()) => true,
            // A full channel means passes are already pending
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Stop the worker and wait for it to exit
    pub async fn stop(self) {
        let _ = self.sender.send(WorkerCommand::Stop).await;
        if let Err(e) = self.handle.await {
            tracing::warn!("Sync worker ended abnormally: {}", e);
        }
    }
}

/// Returns false once the engine has been dropped
fn spawn_pass(engine: &WeakSyncEngine, trigger: SyncTrigger) -> bool {
    let Some(engine) = engine.upgrade() else {
        return false;
    };
    tokio::spawn(async move {
        engine.run(trigger).await;
    });
    true
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
