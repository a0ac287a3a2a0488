//! Periodic container health sweep.
//!
//! Every tick, inspect the container of each deployed local app and emit a
//! HEALTH event only when the `(status, health)` pair changed since the
//! last sweep. Apps that disappear are dropped from the dedup map so a
//! re-created app always reports fresh.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::db::{App, DbPool};
use crate::notifier::{Event, EventKind, Notifier};
use crate::runtime::{ContainerDriver, ContainerState};

const DB_RETRIES: u32 = 3;
const DB_RETRY_DELAY: Duration = Duration::from_secs(2);

/// The dedup key for one app's observed health.
pub fn health_key(state: &ContainerState) -> (String, String) {
    match state {
        ContainerState::NotFound => ("not_found".to_string(), "none".to_string()),
        ContainerState::Present { state, health, .. } => (state.clone(), health.clone()),
    }
}

/// Change-detection map: `note` returns true only when the key differs from
/// the previously recorded one. `retain` implements clear-on-delete.
#[derive(Default)]
pub struct ChangeTracker {
    last: RwLock<HashMap<String, (String, String)>>,
}

impl ChangeTracker {
    pub fn note(&self, app_id: &str, key: (String, String)) -> bool {
        let mut last = self.last.write();
        match last.get(app_id) {
            Some(previous) if *previous == key => false,
            _ => {
                last.insert(app_id.to_string(), key);
                true
            }
        }
    }

    pub fn retain(&self, live: &HashSet<String>) {
        self.last.write().retain(|id, _| live.contains(id));
    }
}

pub struct HealthMonitor {
    db: DbPool,
    driver: Arc<dyn ContainerDriver>,
    notifier: Arc<Notifier>,
    interval: Duration,
    tracker: ChangeTracker,
}

impl HealthMonitor {
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
            tracker: ChangeTracker::default(),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => self.sweep().await,
                _ = shutdown.changed() => {
                    debug!("Health monitor stopping");
                    return;
                }
            }
        }
    }

    async fn sweep(&self) {
        let apps = match fetch_deployed_local_apps(&self.db).await {
            Ok(apps) => apps,
            Err(e) => {
                warn!(error = %e, "Health sweep skipped: could not load apps");
                return;
            }
        };

        let live: HashSet<String> = apps.iter().map(|a| a.id.clone()).collect();
        self.tracker.retain(&live);

        for app in apps {
            let state = match self.driver.inspect(&app.name).await {
                Ok(state) => state,
                Err(e) => {
                    debug!(app = %app.name, error = %e, "Inspect failed during health sweep");
                    continue;
                }
            };

            let key = health_key(&state);
            if self.tracker.note(&app.id, key.clone()) {
                self.notifier.emit(
                    Event::new(EventKind::Health, &app.id).with_payload(serde_json::json!({
                        "status": key.0,
                        "health": key.1,
                    })),
                );
            }
        }
    }
}

/// Active local apps that have deployed at least once, with a bounded retry
/// for transient database errors.
pub(crate) async fn fetch_deployed_local_apps(db: &DbPool) -> Result<Vec<App>, sqlx::Error> {
    let mut attempt = 0;
    loop {
        match sqlx::query_as::<_, App>(
            "SELECT * FROM apps WHERE status = 'active' AND last_deployed_at IS NOT NULL \
             AND server_id IS NULL",
        )
        .fetch_all(db)
        .await
        {
            Ok(apps) => return Ok(apps),
            Err(e) => {
                attempt += 1;
                if attempt >= DB_RETRIES {
                    return Err(e);
                }
                warn!(error = %e, attempt, "App fetch failed, retrying");
                tokio::time::sleep(DB_RETRY_DELAY).await;
            }
        }
    }
}
