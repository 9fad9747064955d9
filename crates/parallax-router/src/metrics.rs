//! Concurrent cache of per-node memory metrics.
//!
//! Two writers feed this cache: the periodic status poller and the
//! in-band response headers. The monotonic `last_update` rule is the
//! only tie-breaker between them; a write carrying a strictly older
//! timestamp than the stored entry is dropped.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Free memory assumed for a node that has never reported: effectively
/// infinite, so dispatch is not starved during the bootstrap window
/// before the first poll completes.
pub const UNKNOWN_FREE_MEM_MB: i64 = 10_000_000;

/// Memory figures for one node. `free_mem_mb` may transiently go
/// negative under optimistic decrements; it is only compared, never
/// clamped, on the read side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeMetric {
    pub total_mem_mb: i64,
    pub free_mem_mb: i64,
    /// Unix seconds of the report this entry came from.
    pub last_update: i64,
}

/// Node-name keyed metric cache. Many concurrent readers, exclusive
/// writers.
#[derive(Debug, Default)]
pub struct NodeMetricCache {
    metrics: RwLock<HashMap<String, NodeMetric>>,
}

impl NodeMetricCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies an update unless a strictly fresher entry is already
    /// stored. A `total_mem_mb` of zero keeps the previously known
    /// total, for update sources that only report free memory.
    pub fn update(&self, node: &str, free_mem_mb: i64, total_mem_mb: i64, last_update: i64) {
        let mut metrics = self
            .metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let prior = metrics.get(node).copied();
        if let Some(prior) = prior {
            if last_update < prior.last_update {
                tracing::trace!(
                    %node,
                    stored = prior.last_update,
                    incoming = last_update,
                    "dropping stale metric update"
                );
                return;
            }
        }

        let total_mem_mb = if total_mem_mb == 0 {
            prior.map_or(0, |p| p.total_mem_mb)
        } else {
            total_mem_mb
        };

        metrics.insert(
            node.to_owned(),
            NodeMetric {
                total_mem_mb,
                free_mem_mb,
                last_update,
            },
        );
    }

    /// Free memory of a node, or the optimistic sentinel when the node
    /// has never reported.
    pub fn free_memory(&self, node: &str) -> i64 {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node)
            .map_or(UNKNOWN_FREE_MEM_MB, |m| m.free_mem_mb)
    }

    pub fn get(&self, node: &str) -> Option<NodeMetric> {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node)
            .copied()
    }

    /// Forgets a node, typically when its target is removed.
    pub fn remove(&self, node: &str) {
        self.metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node);
    }
}

/// Current time as unix seconds, the timestamp unit used across metric
/// updates.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}
