//! Consumer groups and lag monitoring on the global log.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::{LogSeq, StreamEvent};

use super::gateway::GatewayError;
use super::publisher::{decode_entry, GLOBAL_LOG};
use super::store::{GroupInfo, GroupStart, LogStore, StoreError};

/// Lag threshold and check period
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub lag_threshold: usize,
    pub interval: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            lag_threshold: 500,
            interval: Duration::from_secs(30),
        }
    }
}

/// Aggregated lag of every consumer group on the global log
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LagReport {
    pub key: String,
    pub groups: Vec<GroupInfo>,
    pub total_lag: usize,
    pub max_lag: usize,
    pub threshold: usize,
    /// Groups whose lag exceeds the threshold
    pub exceeded: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl LagReport {
    fn from_groups(groups: Vec<GroupInfo>, threshold: usize) -> Self {
        let total_lag = groups.iter().map(|g| g.lag).sum();
        let max_lag = groups.iter().map(|g| g.lag).max().unwrap_or(0);
        let exceeded = groups
            .iter()
            .filter(|g| g.lag > threshold)
            .map(|g| g.name.clone())
            .collect();

        Self {
            key: GLOBAL_LOG.to_string(),
            groups,
            total_lag,
            max_lag,
            threshold,
            exceeded,
            generated_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.exceeded.is_empty()
    }
}

/// Named readers over the global log, each with an independent cursor
#[derive(Clone)]
pub struct LagMonitor {
    store: Option<Arc<dyn LogStore>>,
    settings: MonitorSettings,
}

impl LagMonitor {
    pub fn new(store: Option<Arc<dyn LogStore>>, settings: MonitorSettings) -> Self {
        Self { store, settings }
    }

    fn store(&self) -> Result<&Arc<dyn LogStore>, GatewayError> {
        self.store.as_ref().ok_or(GatewayError::Disabled)
    }

    /// Create a group. Registering an existing group is a no-op.
    pub async fn register_group(&self, group: &str, start: GroupStart) -> Result<(), GatewayError> {
        match self.store()?.create_group(GLOBAL_LOG, group, start).await {
            Ok(()) | Err(StoreError::GroupExists { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Register configured groups. They start at the current end of the log
    /// so retained history does not count as lag.
    pub async fn register_groups(&self, groups: &[String]) -> Result<(), GatewayError> {
        for group in groups {
            self.register_group(group, GroupStart::Latest).await?;
            debug!(group = %group, "Registered consumer group");
        }
        Ok(())
    }

    /// Deliver the next events to `consumer` on behalf of `group`
    pub async fn read(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEvent>, GatewayError> {
        let entries = self
            .store()?
            .read_group(GLOBAL_LOG, group, consumer, count)
            .await?;

        Ok(entries
            .iter()
            .filter_map(|entry| match decode_entry(entry) {
                Ok(event) => Some(event),
                Err(err) => {
                    warn!(group, seq = %entry.seq, error = %err, "Skipping undecodable entry");
                    None
                }
            })
            .collect())
    }

    pub async fn ack(&self, group: &str, seqs: &[LogSeq]) -> Result<usize, GatewayError> {
        Ok(self.store()?.ack(GLOBAL_LOG, group, seqs).await?)
    }

    /// Retained entries the group has not been delivered yet
    pub async fn lag(&self, group: &str) -> Result<usize, GatewayError> {
        let groups = self.store()?.groups(GLOBAL_LOG).await?;
        groups
            .into_iter()
            .find(|g| g.name == group)
            .map(|g| g.lag)
            .ok_or_else(|| {
                GatewayError::Store(StoreError::NoSuchGroup {
                    key: GLOBAL_LOG.to_string(),
                    group: group.to_string(),
                })
            })
    }

    pub async fn report(&self) -> Result<LagReport, GatewayError> {
        let groups = self.store()?.groups(GLOBAL_LOG).await?;
        Ok(LagReport::from_groups(groups, self.settings.lag_threshold))
    }

    /// One monitoring pass. Threshold breaches are logged, never fatal.
    pub async fn check(&self) -> Option<LagReport> {
        match self.report().await {
            Ok(report) => {
                for group in report.groups.iter().filter(|g| g.lag > report.threshold) {
                    warn!(
                        group = %group.name,
                        lag = group.lag,
                        threshold = report.threshold,
                        "Consumer group lag exceeds threshold"
                    );
                }
                debug!(total_lag = report.total_lag, max_lag = report.max_lag, "Lag check");
                Some(report)
            }
            Err(err) => {
                warn!(error = %err, "Lag check failed");
                None
            }
        }
    }

    /// Run `check` every interval until `shutdown` flips to true
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.check().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Lag monitor stopped");
        })
    }
}
