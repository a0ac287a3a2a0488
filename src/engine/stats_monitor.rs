//! Periodic container stats sampling. Unlike health, every tick emits for
//! every deployed app; consumers chart the stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::db::DbPool;
use crate::notifier::{Event, EventKind, Notifier};
use crate::runtime::ContainerDriver;

use super::health_monitor::fetch_deployed_local_apps;

pub struct StatsMonitor {
    db: DbPool,
    driver: Arc<dyn ContainerDriver>,
    notifier: Arc<Notifier>,
    interval: Duration,
}

impl StatsMonitor {
    pub fn new(
        db: DbPool,
        driver: Arc<dyn ContainerDriver>,
        notifier: Arc<Notifier>,
        interval_secs: u64,
    ) -> Self {
        Self {
            db,
            driver,
            notifier,
            interval: Duration::from_secs(interval_secs),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => self.sweep().await,
                _ = shutdown.changed() => {
                    debug!("Stats monitor stopping");
                    return;
                }
            }
        }
    }

    async fn sweep(&self) {
        let apps = match fetch_deployed_local_apps(&self.db).await {
            Ok(apps) => apps,
            Err(e) => {
                warn!(error = %e, "Stats sweep skipped: could not load apps");
                return;
            }
        };

        for app in apps {
            match self.driver.stats(&app.name).await {
                Ok(stats) => {
                    self.notifier.emit(
                        Event::new(EventKind::Stats, &app.id).with_payload(serde_json::json!({
                            "cpu_percent": stats.cpu_percent,
                            "memory_usage": stats.memory_usage,
                            "memory_limit": stats.memory_limit,
                            "network_rx": stats.network_rx,
                            "network_tx": stats.network_tx,
                            "pids": stats.pids,
                        })),
                    );
                }
                Err(e) => {
                    debug!(app = %app.name, error = %e, "Stats collection failed");
                }
            }
        }
    }
}
