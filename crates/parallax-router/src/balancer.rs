//! Architecture-aware balancer: picks an architecture, then a node.
//!
//! One ring per architecture keeps placement consistent within an
//! architecture while the bandit (or round-robin) decides between
//! them. Everything membership- and selection-related runs under a
//! single balancer-wide lock; the hot path is two hash lookups and a
//! ring walk, and the lock is never held across I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BalanceError;
use crate::mab::{BanditManager, ContextStorage, DecisionContext};
use crate::metrics::{unix_now, NodeMetricCache};
use crate::ring::{HashRing, MemoryChecker};
use crate::types::{
    Architecture, FunctionDescriptor, NodeStatus, ProxyTarget, HEADER_MAB_REQUEST_ID,
};

/// Path prefix of invocation requests.
pub const INVOKE_PREFIX: &str = "/invoke/";

/// How long a cached architecture choice stays usable for the non-MAB
/// tie-break.
const ARCH_CACHE_VALIDITY: Duration = Duration::from_secs(30);

/// Resolves function descriptors, typically a read-through cache over
/// the external function store.
#[async_trait]
pub trait FunctionProvider: Send + Sync {
    async fn lookup(&self, name: &str) -> Option<FunctionDescriptor>;
}

/// Fetches a node's `/status` snapshot. Best-effort: a `None` leaves
/// the node's metrics uninitialised until it first reports in-band.
#[async_trait]
pub trait StatusProber: Send + Sync {
    async fn status(&self, target: &ProxyTarget) -> Option<NodeStatus>;
}

/// Architecture-selection mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LbMode {
    #[default]
    #[serde(rename = "MAB")]
    Mab,
    #[serde(rename = "RoundRobin")]
    RoundRobin,
}

/// Recently chosen architecture for a function; biases the non-MAB
/// tie-break toward warm containers.
#[derive(Debug, Clone, Copy)]
struct ArchCacheEntry {
    arch: Architecture,
    stamped: Instant,
}

struct BalancerState {
    arm_ring: HashRing,
    x86_ring: HashRing,
    rr_index: usize,
    arch_cache: HashMap<String, ArchCacheEntry>,
}

impl BalancerState {
    fn ring(&self, arch: Architecture) -> &HashRing {
        match arch {
            Architecture::Arm64 => &self.arm_ring,
            Architecture::Amd64 => &self.x86_ring,
        }
    }

    fn ring_mut(&mut self, arch: Architecture) -> &mut HashRing {
        match arch {
            Architecture::Arm64 => &mut self.arm_ring,
            Architecture::Amd64 => &mut self.x86_ring,
        }
    }
}

pub struct ArchAwareBalancer {
    state: Mutex<BalancerState>,
    mode: LbMode,
    cache_validity: Duration,
    functions: Arc<dyn FunctionProvider>,
    prober: Arc<dyn StatusProber>,
    metrics: Arc<NodeMetricCache>,
    bandits: Arc<BanditManager>,
    contexts: Arc<ContextStorage>,
}

impl std::fmt::Debug for ArchAwareBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchAwareBalancer")
            .field("mode", &self.mode)
            .finish()
    }
}

impl ArchAwareBalancer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        replicas: usize,
        mode: LbMode,
        mem_checker: Arc<dyn MemoryChecker>,
        functions: Arc<dyn FunctionProvider>,
        prober: Arc<dyn StatusProber>,
        metrics: Arc<NodeMetricCache>,
        bandits: Arc<BanditManager>,
        contexts: Arc<ContextStorage>,
    ) -> Self {
        tracing::info!(replicas, mode = ?mode, "running architecture-aware balancer");
        Self {
            state: Mutex::new(BalancerState {
                arm_ring: HashRing::new(replicas, Arc::clone(&mem_checker)),
                x86_ring: HashRing::new(replicas, mem_checker),
                rr_index: 0,
                arch_cache: HashMap::new(),
            }),
            mode,
            cache_validity: ARCH_CACHE_VALIDITY,
            functions,
            prober,
            metrics,
            bandits,
            contexts,
        }
    }

    /// Picks the upstream target for an invocation request.
    ///
    /// When the decision goes through the bandit, the system-context
    /// snapshot is stored under a fresh request id and the id is
    /// stamped into the request headers so the completion report can be
    /// matched back.
    pub async fn next(
        &self,
        path: &str,
        headers: &mut HeaderMap,
    ) -> Result<Arc<ProxyTarget>, BalanceError> {
        let name = extract_function_name(path)
            .ok_or_else(|| BalanceError::NotAnInvocation(path.to_owned()))?;
        let fun = self
            .functions
            .lookup(name)
            .await
            .ok_or_else(|| BalanceError::UnknownFunction(name.to_owned()))?;

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let target_arch = if fun.supported_archs.len() == 1 {
            fun.supported_archs[0]
        } else if self.mode == LbMode::Mab {
            let ctx = system_context(&state, &self.metrics);
            let request_id = Uuid::new_v4().to_string();
            self.contexts.store(request_id.clone(), ctx.clone());
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                headers.insert(HEADER_MAB_REQUEST_ID, value);
            }
            self.bandits
                .get(name)
                .select_arm(Some(&ctx))
                .ok_or_else(|| BalanceError::NoAvailableTarget(name.to_owned()))?
        } else {
            select_architecture_rr(&mut state)
        };

        // Consistent hashing inside the chosen ring; if it comes up
        // empty the other ring is tried, provided the function can run
        // there.
        let candidate = state.ring(target_arch).get(&fun).or_else(|| {
            let other = target_arch.other();
            if fun.supports(other) {
                state.ring(other).get(&fun)
            } else {
                None
            }
        });
        let Some(candidate) = candidate else {
            tracing::debug!(function = %name, arch = %target_arch, "no target with enough memory");
            return Err(BalanceError::NoAvailableTarget(name.to_owned()));
        };

        // Pre-debit the node so concurrent selections see this dispatch
        // before the worker reports back. Stamped `now`, which also
        // shields it from stale reports already in flight.
        let free = self.metrics.free_memory(&candidate.name) - fun.memory_mb;
        self.metrics.update(&candidate.name, free, 0, unix_now());

        Ok(candidate)
    }

    /// Architecture choice for the non-bandit path when a function
    /// supports both architectures: reuse the recently chosen
    /// architecture while it still has nodes (its warm containers are
    /// likely alive), otherwise prefer arm64 for the lower energy draw.
    pub fn select_architecture(&self, fun: &FunctionDescriptor) -> Option<Architecture> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let supports_arm = fun.supports(Architecture::Arm64);
        let supports_x86 = fun.supports(Architecture::Amd64);

        if supports_arm && supports_x86 {
            if let Some(entry) = state.arch_cache.get(&fun.name).copied() {
                if entry.stamped.elapsed() < self.cache_validity
                    && state.ring(entry.arch).size() > 0
                {
                    state.arch_cache.insert(
                        fun.name.clone(),
                        ArchCacheEntry {
                            arch: entry.arch,
                            stamped: Instant::now(),
                        },
                    );
                    return Some(entry.arch);
                }
            }

            let chosen = if state.ring(Architecture::Arm64).size() > 0 {
                Architecture::Arm64
            } else if state.ring(Architecture::Amd64).size() > 0 {
                Architecture::Amd64
            } else {
                return None;
            };
            state.arch_cache.insert(
                fun.name.clone(),
                ArchCacheEntry {
                    arch: chosen,
                    stamped: Instant::now(),
                },
            );
            return Some(chosen);
        }

        if supports_arm {
            return (state.ring(Architecture::Arm64).size() > 0).then_some(Architecture::Arm64);
        }
        if supports_x86 {
            return (state.ring(Architecture::Amd64).size() > 0).then_some(Architecture::Amd64);
        }
        None
    }

    /// Registers a node, seeding its memory metrics from a best-effort
    /// `/status` probe. The probe completes before the balancer lock is
    /// taken.
    pub async fn add_target(&self, target: ProxyTarget) {
        if let Some(status) = self.prober.status(&target).await {
            self.metrics.update(
                &target.name,
                status.total_memory - status.used_memory,
                status.total_memory,
                status.last_update_time,
            );
        } else {
            tracing::debug!(node = %target.name, "status probe failed; metrics uninitialised");
        }

        let arch = target.arch;
        let target = Arc::new(target);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.ring_mut(arch).add(target);
    }

    /// Drops a node from both rings and forgets its metrics. Returns
    /// whether a removal occurred.
    pub fn remove_target(&self, name: &str) -> bool {
        self.metrics.remove(name);

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let removed_arm = state.arm_ring.remove_by_name(name);
        let removed_x86 = state.x86_ring.remove_by_name(name);
        removed_arm || removed_x86
    }

    /// Distinct targets currently in the given architecture's ring.
    pub fn ring_size(&self, arch: Architecture) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ring(arch)
            .size()
    }
}

/// Round-robin architecture pick for functions that run on both
/// architectures: alternate, but fall through to the other side when
/// the preferred ring is empty.
fn select_architecture_rr(state: &mut BalancerState) -> Architecture {
    let archs = [Architecture::Arm64, Architecture::Amd64];
    let selected = archs[state.rr_index];
    state.rr_index = (state.rr_index + 1) % archs.len();

    if state.ring(selected).size() == 0 {
        selected.other()
    } else {
        selected
    }
}

/// Memory-usage ratio per architecture across the ring's targets. An
/// empty ring reads as fully used so the bandit steers away from it.
fn system_context(state: &BalancerState, metrics: &NodeMetricCache) -> DecisionContext {
    let mut ctx = DecisionContext::default();
    for arch in Architecture::ALL {
        let mut total: i64 = 0;
        let mut free: i64 = 0;
        for name in state.ring(arch).target_names() {
            if let Some(metric) = metrics.get(&name) {
                total += metric.total_mem_mb;
                free += metric.free_mem_mb;
            }
        }
        let usage = if total <= 0 {
            1.0
        } else {
            ((total - free) as f64 / total as f64).clamp(0.0, 1.0)
        };
        ctx.arch_mem_usage.insert(arch, usage);
    }
    ctx
}

/// Function name from an invocation path (`/invoke/<name>`).
pub fn extract_function_name(path: &str) -> Option<&str> {
    let name = path.strip_prefix(INVOKE_PREFIX)?;
    (!name.is_empty()).then_some(name)
}
