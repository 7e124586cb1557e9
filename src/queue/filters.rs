//! Pluggable rules that temporarily keep whole partitions from being dispatched

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::info;

/// Decides which partitions may not start new jobs right now
///
/// Consulted on every dispatch cycle, so implementations should be cheap.
/// Records in an excluded partition stay queued until the filter lets them go.
pub trait AcquisitionFilter: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn excluded_partitions(&self, now: DateTime<Utc>) -> HashSet<String>;
}

#[derive(Debug, Clone)]
struct Ban {
    until: DateTime<Utc>,
    reason: String,
}

/// Time-limited bans on partitions, e.g. after a provider starts returning 429s
///
/// Expired bans stop excluding as soon as their deadline passes.
#[derive(Debug, Default)]
pub struct PartitionBans {
    bans: RwLock<HashMap<String, Ban>>,
}

impl PartitionBans {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ban `partition` for `duration`, extending any existing ban
    pub fn ban(&self, partition: &str, duration: Duration, reason: impl Into<String>) -> DateTime<Utc> {
        let delta = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365));
        let until = Utc::now()
            .checked_add_signed(delta)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let reason = reason.into();
        let mut bans = self.bans.write();
        let until = match bans.get(partition) {
            Some(existing) if existing.until > until => existing.until,
            _ => until,
        };
        info!(partition, until = %until, reason = %reason, "Partition banned");
        bans.insert(partition.to_string(), Ban { until, reason });
        until
    }

    /// Lift a ban early; returns whether one was active
    pub fn lift(&self, partition: &str) -> bool {
        let lifted = self
            .bans
            .write()
            .remove(partition)
            .is_some_and(|ban| ban.until > Utc::now());
        if lifted {
            info!(partition, "Partition ban lifted");
        }
        lifted
    }

    pub fn is_banned(&self, partition: &str) -> bool {
        self.banned_until(partition).is_some()
    }

    pub fn banned_until(&self, partition: &str) -> Option<DateTime<Utc>> {
        self.bans
            .read()
            .get(partition)
            .filter(|ban| ban.until > Utc::now())
            .map(|ban| ban.until)
    }

    /// Active bans as `(partition, until, reason)`
    pub fn active(&self) -> Vec<(String, DateTime<Utc>, String)> {
        let now = Utc::now();
        let mut active: Vec<_> = self
            .bans
            .read()
            .iter()
            .filter(|(_, ban)| ban.until > now)
            .map(|(partition, ban)| (partition.clone(), ban.until, ban.reason.clone()))
            .collect();
        active.sort_by(|a, b| a.0.cmp(&b.0));
        active
    }
}

impl AcquisitionFilter for PartitionBans {
    fn name(&self) -> &str {
        "partition-bans"
    }

    fn excluded_partitions(&self, now: DateTime<Utc>) -> HashSet<String> {
        self.bans
            .read()
            .iter()
            .filter(|(_, ban)| ban.until > now)
            .map(|(partition, _)| partition.clone())
            .collect()
    }
}
