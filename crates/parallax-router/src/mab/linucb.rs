//! Disjoint LinUCB: one independent linear model per arm.
//!
//! Li et al., "A Contextual-Bandit Approach to Personalized News
//! Article Recommendation", Algorithm 1. The feature vector is
//! `[1, 1/(1 - u + eps)]` where `u` is the memory-usage ratio of the
//! arm's architecture at decision time; the second term grows sharply
//! as memory fills up, so the model can learn how each architecture
//! degrades under pressure.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use super::{reward, DecisionContext, Policy, PolicyKind};
use crate::types::Architecture;

/// Feature dimension: bias + memory-pressure term.
const DIM: usize = 2;
/// Keeps the pressure feature finite at 100% usage.
const EPSILON: f64 = 0.01;

/// Symmetric 2x2 matrix. At `DIM = 2` a closed-form inverse beats
/// pulling in a linear-algebra crate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymMatrix2 {
    pub m00: f64,
    pub m01: f64,
    pub m11: f64,
}

impl SymMatrix2 {
    pub const IDENTITY: Self = Self {
        m00: 1.0,
        m01: 0.0,
        m11: 1.0,
    };

    /// Closed-form inverse. The design matrix is the identity plus a
    /// sum of outer products, so it stays positive-definite and the
    /// determinant stays strictly positive; anything else is a broken
    /// invariant.
    fn inverse(self) -> Self {
        let det = self.m00 * self.m11 - self.m01 * self.m01;
        debug_assert!(det > 0.0, "design matrix lost positive-definiteness");
        Self {
            m00: self.m11 / det,
            m01: -self.m01 / det,
            m11: self.m00 / det,
        }
    }

    fn mul_vec(self, v: [f64; DIM]) -> [f64; DIM] {
        [
            self.m00 * v[0] + self.m01 * v[1],
            self.m01 * v[0] + self.m11 * v[1],
        ]
    }

    /// `self += v * v^T`
    fn add_outer(&mut self, v: [f64; DIM]) {
        self.m00 += v[0] * v[0];
        self.m01 += v[0] * v[1];
        self.m11 += v[1] * v[1];
    }

    pub fn determinant(self) -> f64 {
        self.m00 * self.m11 - self.m01 * self.m01
    }
}

fn dot(a: [f64; DIM], b: [f64; DIM]) -> f64 {
    a[0] * b[0] + a[1] * b[1]
}

fn features(mem_usage: f64) -> [f64; DIM] {
    [1.0, 1.0 / (1.0 - mem_usage + EPSILON)]
}

/// Per-arm model state: design matrix `A` and reward vector `b`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinUcbArmState {
    pub a: SymMatrix2,
    pub b: [f64; DIM],
}

impl LinUcbArmState {
    fn new() -> Self {
        Self {
            a: SymMatrix2::IDENTITY,
            b: [0.0; DIM],
        }
    }
}

/// Contextual policy scoring each arm as
/// `x^T theta_hat + alpha * sqrt(x^T A^-1 x)` with `theta_hat = A^-1 b`.
///
/// No forced initial plays are needed: with `A = I` and `b = 0` the
/// confidence term dominates until an arm has data.
#[derive(Debug)]
pub struct LinUcbPolicy {
    /// Exploration parameter.
    alpha: f64,
    arms: Mutex<BTreeMap<Architecture, LinUcbArmState>>,
}

impl LinUcbPolicy {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            arms: Mutex::new(BTreeMap::new()),
        }
    }

    /// Snapshot of one arm's model state.
    pub fn arm_state(&self, arm: Architecture) -> Option<LinUcbArmState> {
        self.arms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&arm)
            .copied()
    }
}

impl Policy for LinUcbPolicy {
    fn init_arm(&self, arm: Architecture) {
        self.arms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(arm)
            .or_insert_with(LinUcbArmState::new);
    }

    fn select_arm(&self, ctx: Option<&DecisionContext>) -> Option<Architecture> {
        let arms = self.arms.lock().unwrap_or_else(PoisonError::into_inner);

        let mut best: Option<(Architecture, f64)> = None;
        for (&arm, state) in arms.iter() {
            let usage = ctx.map_or(0.0, |c| c.usage(arm));
            let x = features(usage);

            let a_inv = state.a.inverse();
            let theta = a_inv.mul_vec(state.b);
            let expected = dot(x, theta);
            let confidence = self.alpha * dot(x, a_inv.mul_vec(x)).sqrt();
            let score = expected + confidence;

            tracing::trace!(arm = %arm, usage, expected, confidence, score, "scored arm");
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((arm, score));
            }
        }

        best.map(|(arm, _)| arm)
    }

    fn update_reward(
        &self,
        arm: Architecture,
        ctx: Option<&DecisionContext>,
        is_warm_start: bool,
        duration_ms: f64,
    ) {
        if !is_warm_start {
            // Outliers are simply ignored; there are no selection-side
            // counters to take back here.
            return;
        }

        // The feature vector must be rebuilt from the snapshot taken at
        // decision time, not from current state.
        let Some(ctx) = ctx else {
            tracing::warn!(arm = %arm, "missing decision context, skipping update");
            return;
        };

        let mut arms = self.arms.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(state) = arms.get_mut(&arm) else {
            tracing::warn!(arm = %arm, "reward for unknown arm ignored");
            return;
        };

        let x = features(ctx.usage(arm));
        let r = reward(duration_ms);
        state.a.add_outer(x);
        state.b[0] += r * x[0];
        state.b[1] += r * x[1];
    }

    fn kind(&self) -> PolicyKind {
        PolicyKind::LinUcb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_context() -> DecisionContext {
        let mut ctx = DecisionContext::default();
        ctx.arch_mem_usage.insert(Architecture::Amd64, 0.0);
        ctx.arch_mem_usage.insert(Architecture::Arm64, 0.0);
        ctx
    }

    fn policy() -> LinUcbPolicy {
        let policy = LinUcbPolicy::new(0.1);
        policy.init_arm(Architecture::Amd64);
        policy.init_arm(Architecture::Arm64);
        policy
    }

    #[test]
    fn arms_start_at_identity() {
        let policy = policy();
        let state = policy.arm_state(Architecture::Arm64).unwrap();
        assert_eq!(state.a, SymMatrix2::IDENTITY);
        assert_eq!(state.b, [0.0, 0.0]);
    }

    #[test]
    fn tied_arms_select_deterministically() {
        let policy = policy();
        let ctx = idle_context();
        // Fresh arms with the same context score identically; the first
        // arm in canonical order must win, stably.
        for _ in 0..10 {
            assert_eq!(policy.select_arm(Some(&ctx)), Some(Architecture::Amd64));
        }
    }

    #[test]
    fn good_reward_shifts_selection_toward_the_arm() {
        let policy = policy();
        let ctx = idle_context();

        // A sub-millisecond warm run earns a positive reward for arm64.
        policy.update_reward(Architecture::Arm64, Some(&ctx), true, 0.5);

        assert_eq!(policy.select_arm(Some(&ctx)), Some(Architecture::Arm64));
    }

    #[test]
    fn bad_reward_shifts_selection_away_from_the_arm() {
        let policy = policy();
        let ctx = idle_context();

        // A slow warm run earns a strongly negative reward for amd64.
        policy.update_reward(Architecture::Amd64, Some(&ctx), true, 5000.0);

        assert_eq!(policy.select_arm(Some(&ctx)), Some(Architecture::Arm64));
    }

    #[test]
    fn cold_start_update_is_ignored() {
        let policy = policy();
        let ctx = idle_context();
        policy.update_reward(Architecture::Arm64, Some(&ctx), false, 5000.0);
        let state = policy.arm_state(Architecture::Arm64).unwrap();
        assert_eq!(state.a, SymMatrix2::IDENTITY);
        assert_eq!(state.b, [0.0, 0.0]);
    }

    #[test]
    fn missing_context_update_is_ignored() {
        let policy = policy();
        policy.update_reward(Architecture::Arm64, None, true, 100.0);
        let state = policy.arm_state(Architecture::Arm64).unwrap();
        assert_eq!(state.a, SymMatrix2::IDENTITY);
    }

    #[test]
    fn design_matrix_stays_positive_definite() {
        let policy = policy();
        for i in 0..100 {
            let mut ctx = DecisionContext::default();
            let usage = f64::from(i % 10) / 10.0;
            ctx.arch_mem_usage.insert(Architecture::Arm64, usage);
            policy.update_reward(Architecture::Arm64, Some(&ctx), true, 10.0 + f64::from(i));
        }

        let state = policy.arm_state(Architecture::Arm64).unwrap();
        assert!(state.a.m00 > 0.0);
        assert!(state.a.m11 > 0.0);
        assert!(state.a.determinant() > 0.0);
    }

    #[test]
    fn updates_accumulate_rank_one_outer_products() {
        let policy = policy();
        let ctx = idle_context();
        policy.update_reward(Architecture::Arm64, Some(&ctx), true, 1.0);

        let x = features(0.0);
        let state = policy.arm_state(Architecture::Arm64).unwrap();
        assert!((state.a.m00 - (1.0 + x[0] * x[0])).abs() < 1e-12);
        assert!((state.a.m01 - x[0] * x[1]).abs() < 1e-12);
        assert!((state.a.m11 - (1.0 + x[1] * x[1])).abs() < 1e-12);
        // reward(1.0) == 0, so b is untouched by a 1ms run.
        assert_eq!(state.b, [0.0, 0.0]);
    }

    #[test]
    fn pressure_feature_grows_with_usage() {
        assert!(features(0.9)[1] > features(0.5)[1]);
        assert!(features(1.0)[1].is_finite());
    }
}
