//! Cross-queue concurrency bounds per partition tag
//!
//! Every partition declared by a registered job type gets one counter when the
//! scheduler is built, so the map is never written afterwards and claiming a
//! slot is a single compare-and-swap on that partition's counter.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use super::registry::JobRegistry;

#[derive(Debug)]
struct Partition {
    max: usize,
    in_flight: AtomicUsize,
}

/// Tracks how many jobs of each partition are executing
#[derive(Debug, Default)]
pub struct PartitionLimiter {
    partitions: HashMap<&'static str, Arc<Partition>>,
}

impl PartitionLimiter {
    /// Build counters for every partition in `registry`
    ///
    /// An override replaces the declared maximum; overrides of 0 are ignored.
    /// Job types sharing a tag with different declared maxima get the largest.
    pub fn new(registry: &JobRegistry, overrides: &HashMap<String, usize>) -> Self {
        let mut declared: HashMap<&'static str, usize> = HashMap::new();
        for descriptor in registry.descriptors() {
            if let (Some(tag), Some(max)) = (descriptor.partition_tag(), descriptor.partition_max()) {
                let entry = declared.entry(tag).or_insert(max);
                *entry = (*entry).max(max);
            }
        }

        let partitions = declared
            .into_iter()
            .map(|(tag, declared_max)| {
                let max = match overrides.get(tag) {
                    Some(&limit) if limit > 0 => {
                        debug!(partition = tag, declared_max, limit, "Partition limit overridden");
                        limit
                    }
                    _ => declared_max.max(1),
                };
                (
                    tag,
                    Arc::new(Partition {
                        max,
                        in_flight: AtomicUsize::new(0),
                    }),
                )
            })
            .collect();

        Self { partitions }
    }

    /// Effective bound for `tag`, or None if nothing declared it
    pub fn max(&self, tag: &str) -> Option<usize> {
        self.partitions.get(tag).map(|p| p.max)
    }

    pub fn in_flight(&self, tag: &str) -> usize {
        self.partitions
            .get(tag)
            .map(|p| p.in_flight.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn is_saturated(&self, tag: &str) -> bool {
        self.partitions
            .get(tag)
            .is_some_and(|p| p.in_flight.load(Ordering::Acquire) >= p.max)
    }

    /// Claim a slot in `tag`; None if the partition is full
    ///
    /// Undeclared tags are treated as unbounded and get a no-op permit.
    pub fn try_acquire(&self, tag: &str) -> Option<PartitionPermit> {
        let Some(partition) = self.partitions.get(tag) else {
            return Some(PartitionPermit { partition: None });
        };
        partition
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < partition.max).then_some(n + 1)
            })
            .ok()
            .map(|_| PartitionPermit {
                partition: Some(partition.clone()),
            })
    }

    /// `(tag, in_flight, max)` for every partition
    pub fn usage(&self) -> Vec<(&'static str, usize, usize)> {
        let mut usage: Vec<_> = self
            .partitions
            .iter()
            .map(|(tag, p)| (*tag, p.in_flight.load(Ordering::Acquire), p.max))
            .collect();
        usage.sort_by_key(|(tag, _, _)| *tag);
        usage
    }
}

/// A claimed partition slot, released on drop
#[derive(Debug)]
pub struct PartitionPermit {
    partition: Option<Arc<Partition>>,
}

impl Drop for PartitionPermit {
    fn drop(&mut self) {
        if let Some(partition) = self.partition.take() {
            partition.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
