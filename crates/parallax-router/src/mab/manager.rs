//! Lazy per-function policy instantiation.

use std::sync::Arc;

use dashmap::DashMap;

use super::{LinUcbPolicy, Policy, PolicyKind, Ucb1Policy};
use crate::types::Architecture;

/// Hands out the bandit policy of each function, creating it on first
/// access. Policies are never destroyed; their per-arm state is a few
/// scalars.
pub struct BanditManager {
    kind: PolicyKind,
    ucb1_c: f64,
    linucb_alpha: f64,
    policies: DashMap<String, Arc<dyn Policy>>,
}

impl std::fmt::Debug for BanditManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BanditManager")
            .field("kind", &self.kind)
            .field("policies", &self.policies.len())
            .finish()
    }
}

impl BanditManager {
    pub fn new(kind: PolicyKind, ucb1_c: f64, linucb_alpha: f64) -> Self {
        Self {
            kind,
            ucb1_c,
            linucb_alpha,
            policies: DashMap::new(),
        }
    }

    /// Returns the policy for a function, creating it with both
    /// architecture arms initialised on first access.
    pub fn get(&self, function: &str) -> Arc<dyn Policy> {
        if let Some(policy) = self.policies.get(function) {
            return Arc::clone(policy.value());
        }

        let policy: Arc<dyn Policy> = match self.kind {
            PolicyKind::LinUcb => Arc::new(LinUcbPolicy::new(self.linucb_alpha)),
            PolicyKind::Ucb1 => Arc::new(Ucb1Policy::new(self.ucb1_c)),
        };
        for arch in Architecture::ALL {
            policy.init_arm(arch);
        }
        tracing::info!(%function, kind = ?self.kind, "initialised bandit");

        // A concurrent creation may have won the race; keep whichever
        // policy landed first so callers share one model.
        let entry = self.policies.entry(function.to_owned()).or_insert(policy);
        Arc::clone(entry.value())
    }

    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
