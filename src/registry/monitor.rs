//! Heartbeat Monitor
//!
//! Periodically removes registrations whose last heartbeat is older than
//! the expiry threshold. The sweep walks a snapshot of ids and removes
//! entries one at a time, so it never blocks register/heartbeat traffic for
//! longer than a single shard operation.

use super::{HealthStatus, RegistryStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,

    pub removed: Vec<String>,

    pub degraded: usize,
}

pub struct HeartbeatMonitor {
    store: Arc<RegistryStore>,

    interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(store: Arc<RegistryStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for id in self.store.ids() {
            report.examined += 1;
            match self.store.status_of(&id) {
                Some(HealthStatus::Expired) => {
                    if self.store.remove_if_expired(&id) {
                        info!(component = %id, "removing expired registration");
                        report.removed.push(id);
                    }
                }
                Some(HealthStatus::Degraded) => report.degraded += 1,
                Some(HealthStatus::Healthy) | None => {}
            }
        }

        report
    }

    /// Runs the sweep on a tokio task until the returned handle is shut down
    /// or dropped.
    pub fn spawn(self) -> MonitorHandle {
        let (shutdown, mut stop) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.sweep_once();
                        if !report.removed.is_empty() || report.degraded > 0 {
                            debug!(
                                examined = report.examined,
                                removed = report.removed.len(),
                                degraded = report.degraded,
                                "heartbeat sweep"
                            );
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("heartbeat monitor stopped");
        });

        MonitorHandle { shutdown, task }
    }
}

pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,

    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
