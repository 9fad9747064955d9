//! Per-function multi-armed bandits choosing between architectures.
//!
//! Naming note: `arm64` is an architecture, an "arm" is a bandit
//! choice. Here every arm happens to be an architecture.

mod linucb;
mod manager;
mod storage;
mod ucb1;

pub use linucb::{LinUcbArmState, LinUcbPolicy, SymMatrix2};
pub use manager::BanditManager;
pub use storage::ContextStorage;
pub use ucb1::{ArmStats, Ucb1Policy};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::Architecture;

/// Which algorithm backs a per-function policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyKind {
    #[default]
    #[serde(rename = "UCB1")]
    Ucb1,
    #[serde(rename = "LinUCB")]
    LinUcb,
}

/// Snapshot of system state at decision time, keyed by architecture.
/// Values are memory-usage ratios in `[0, 1]`. Captured when an arm is
/// selected and replayed on the matching reward update, so contextual
/// policies learn against the state they actually decided under.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionContext {
    pub arch_mem_usage: BTreeMap<Architecture, f64>,
}

impl DecisionContext {
    /// Usage ratio for an architecture; an absent entry reads as idle.
    pub fn usage(&self, arch: Architecture) -> f64 {
        self.arch_mem_usage.get(&arch).copied().unwrap_or(0.0)
    }
}

/// A bandit policy for a single function.
///
/// Implementations synchronise internally, so policies for different
/// functions update in parallel without shared locks.
pub trait Policy: Send + Sync {
    /// Registers an arm before first use. Adding an existing arm is a
    /// no-op.
    fn init_arm(&self, arm: Architecture);

    /// Picks the arm to play. Counter-based policies account for the
    /// play here, before the reward is known. Returns `None` only if
    /// no arm was ever registered.
    fn select_arm(&self, ctx: Option<&DecisionContext>) -> Option<Architecture>;

    /// Feeds an observed execution back into the model. Cold starts
    /// are excluded from learning: container setup dominates their
    /// duration and would distort the architecture signal.
    fn update_reward(
        &self,
        arm: Architecture,
        ctx: Option<&DecisionContext>,
        is_warm_start: bool,
        duration_ms: f64,
    );

    fn kind(&self) -> PolicyKind;
}

/// Reward for a warm execution. The negative log keeps very fast and
/// very slow runs on a comparable scale.
pub(crate) fn reward(duration_ms: f64) -> f64 {
    -duration_ms.ln()
}
