//! Consistent-hashing ring of proxy targets with memory-aware lookup.
//!
//! Each physical target appears `replicas` times on a 32-bit FNV-1a
//! ring, which keeps the per-function mapping stable across membership
//! changes and gives warm containers a chance to be reused. When the
//! hash-selected node is short on memory, the lookup walks the ring
//! forward, so repeated requests converge on the same secondary node.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::metrics::NodeMetricCache;
use crate::types::{FunctionDescriptor, ProxyTarget};

/// Decides whether a candidate node can host a function right now.
/// Injected into the ring so tests can pin the answers.
pub trait MemoryChecker: Send + Sync {
    fn has_enough_memory(&self, target: &ProxyTarget, fun: &FunctionDescriptor) -> bool;
}

/// Default policy: the cached free-memory figure must cover the
/// function's declared demand. Nodes that never reported read as the
/// sentinel and always pass.
#[derive(Debug)]
pub struct FreeMemoryChecker {
    metrics: Arc<NodeMetricCache>,
}

impl FreeMemoryChecker {
    pub fn new(metrics: Arc<NodeMetricCache>) -> Self {
        Self { metrics }
    }
}

impl MemoryChecker for FreeMemoryChecker {
    fn has_enough_memory(&self, target: &ProxyTarget, fun: &FunctionDescriptor) -> bool {
        self.metrics.free_memory(&target.name) >= fun.memory_mb
    }
}

/// 32-bit FNV-1a. Fast, well distributed, not cryptographic; fine for
/// placing ring entries.
pub(crate) fn fnv1a(s: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in s.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

pub struct HashRing {
    replicas: usize,
    /// Sorted virtual-node hashes.
    ring: Vec<u32>,
    /// hash -> physical target; each target owns `replicas` entries.
    targets: HashMap<u32, Arc<ProxyTarget>>,
    mem_checker: Arc<dyn MemoryChecker>,
}

impl std::fmt::Debug for HashRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashRing")
            .field("replicas", &self.replicas)
            .field("entries", &self.ring.len())
            .field("targets", &self.size())
            .finish()
    }
}

impl HashRing {
    pub fn new(replicas: usize, mem_checker: Arc<dyn MemoryChecker>) -> Self {
        Self {
            replicas,
            ring: Vec::new(),
            targets: HashMap::new(),
            mem_checker,
        }
    }

    /// Inserts a target by hashing `"<name>#<i>"` for each replica.
    pub fn add(&mut self, target: Arc<ProxyTarget>) {
        for i in 0..self.replicas {
            let hash = fnv1a(&format!("{}#{}", target.name, i));
            self.ring.push(hash);
            self.targets.insert(hash, Arc::clone(&target));
        }
        self.ring.sort_unstable();
    }

    /// Removes every ring entry belonging to `name`. Returns whether
    /// anything was removed.
    pub fn remove_by_name(&mut self, name: &str) -> bool {
        let targets = &mut self.targets;
        let before = self.ring.len();
        self.ring.retain(|hash| {
            let matches = targets
                .get(hash)
                .is_some_and(|t| t.name == name);
            if matches {
                targets.remove(hash);
            }
            !matches
        });
        before != self.ring.len()
    }

    /// Picks the node for a function: the first target at or after the
    /// function's hash whose memory check passes, walking forward with
    /// wrap-around. Replicas of an already-rejected target are skipped.
    pub fn get(&self, fun: &FunctionDescriptor) -> Option<Arc<ProxyTarget>> {
        if self.ring.is_empty() {
            return None;
        }

        let hash = fnv1a(&fun.name);
        let start = match self.ring.partition_point(|&h| h < hash) {
            idx if idx == self.ring.len() => 0,
            idx => idx,
        };

        let mut seen: HashSet<&str> = HashSet::new();
        let mut idx = start;
        loop {
            let candidate = self.targets.get(&self.ring[idx])?;
            if seen.insert(candidate.name.as_str())
                && self.mem_checker.has_enough_memory(candidate, fun)
            {
                return Some(Arc::clone(candidate));
            }
            idx = (idx + 1) % self.ring.len();
            if idx == start {
                return None;
            }
        }
    }

    /// Number of distinct physical targets, not ring entries.
    pub fn size(&self) -> usize {
        self.targets
            .values()
            .map(|t| t.name.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Distinct names of the targets currently on the ring.
    pub fn target_names(&self) -> Vec<String> {
        let names: HashSet<&str> = self.targets.values().map(|t| t.name.as_str()).collect();
        names.into_iter().map(str::to_owned).collect()
    }

    #[cfg(test)]
    pub(crate) fn entries(&self) -> &[u32] {
        &self.ring
    }
}
