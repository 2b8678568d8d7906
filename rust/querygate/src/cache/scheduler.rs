use super::SyncTrigger;
use crate::time::{Clock, CronSchedule};
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

/// Wait before recomputing when the schedule yields no further occurrence.
const NO_OCCURRENCE_RETRY: Duration = Duration::from_secs(60);

/// Owned background task that fires a [`SyncTrigger`] on every cron occurrence until
/// the shutdown channel flips to `true` or its sender is dropped.
pub struct SyncScheduler {
    trigger: Arc<dyn SyncTrigger>,
    schedule: CronSchedule,
    clock: Arc<dyn Clock>,
    enabled: bool,
}

impl SyncScheduler {
    pub fn new(
        trigger: Arc<dyn SyncTrigger>,
        schedule: CronSchedule,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            trigger,
            schedule,
            clock,
            enabled: true,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if !self.enabled {
            info!("cache sync scheduler disabled");
            return;
        }
        info!(cron = self.schedule.expression(), "cache sync scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = self.clock.now();
            let next = self.schedule.next_after(now);
            let delay = match next {
                Some(at) => (at - now).to_std().unwrap_or(Duration::ZERO),
                None => {
                    warn!(
                        cron = self.schedule.expression(),
                        "cron schedule has no next occurrence"
                    );
                    NO_OCCURRENCE_RETRY
                }
            };
            if let Some(at) = next {
                debug!(next_run = %at, delay_secs = delay.as_secs(), "next cache sync scheduled");
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if next.is_none() || *shutdown.borrow() {
                continue;
            }

            match self.trigger.run_sync().await {
                Ok(result) => debug!(
                    added = result.added,
                    removed = result.removed,
                    total = result.total,
                    "scheduled cache sync finished"
                ),
                Err(err) => error!(error = %err, "scheduled cache sync failed"),
            }
        }

        info!("cache sync scheduler stopped");
    }
}
