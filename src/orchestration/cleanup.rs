//! Periodic garbage collection of stale, malformed and finished instances.

use super::orchestrator::CommandOrchestrator;
use crate::config::CleanupConfig;
use crate::error::BridgeResult;
use crate::logging::log_error;
use crate::models::DeliveryReason;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    /// Non-terminal instances older than the max age, forced to TimedOut
    pub timed_out: usize,
    /// Instances with malformed correlation, forced to Failed
    pub failed: usize,
    /// Terminal instances past retention, removed from the store
    pub purged: usize,
    /// Index entries with no instance behind them
    pub orphaned_keys: usize,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct GarbageCollector {
    orchestrator: CommandOrchestrator,
    config: CleanupConfig,
}

impl GarbageCollector {
    pub fn new(orchestrator: CommandOrchestrator, config: CleanupConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Run one sweep as of `now`
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> BridgeResult<CleanupReport> {
        let mut report = CleanupReport::default();
        let max_age = self.config.instance_max_age();
        let retention = self.config.retention();

        let instances = self.orchestrator.store().list().await?;
        for instance in &instances {
            if !instance.is_terminal() {
                let reason = if instance.is_malformed() {
                    DeliveryReason::Error
                } else if instance.age(now) > max_age {
                    DeliveryReason::OrchestrationTimeout
                } else {
                    continue;
                };

                debug!(
                    instance_id = %instance.instance_id,
                    state = %instance.state,
                    reason = %reason,
                    "Garbage collecting live instance"
                );
                if self.orchestrator.terminate(instance, reason).await? {
                    if reason.is_timeout() {
                        report.timed_out += 1;
                    } else {
                        report.failed += 1;
                    }
                }
            } else if instance.completion_emitted
                && instance.idle_for(now) > retention
                && !self.orchestrator.has_runner(&instance.instance_id)
                && self.orchestrator.store().delete(&instance.instance_id).await?
            {
                report.purged += 1;
            }
        }

        // Keys nobody is waiting on any more
        for entry in self.orchestrator.index().list_all() {
            let orphaned =
                entry.key.is_malformed() || !self.orchestrator.has_runner(&entry.instance_id);
            if orphaned && self.orchestrator.index().deregister_if_key(&entry.instance_id, &entry.key) {
                report.orphaned_keys += 1;
            }
        }

        if !report.is_empty() {
            info!(
                timed_out = report.timed_out,
                failed = report.failed,
                purged = report.purged,
                orphaned_keys = report.orphaned_keys,
                "🧹 Garbage collection sweep"
            );
        }
        Ok(report)
    }

    /// Sweep on a fixed interval until `shutdown` flips to true
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.sweep_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(error) = self.sweep_at(Utc::now()).await {
                            log_error("garbage_collector", "sweep", &error.to_string(), None);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Garbage collector stopping");
                            return;
                        }
                    }
                }
            }
        })
    }
}
