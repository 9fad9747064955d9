//! Classic (non-contextual) UCB1 policy.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use super::{reward, DecisionContext, Policy, PolicyKind};
use crate::types::Architecture;

/// Arms are forced into play until they have this many samples.
const MIN_SAMPLES: i64 = 1;

/// Running statistics for one arm.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ArmStats {
    pub count: i64,
    pub sum_rewards: f64,
    /// `sum_rewards / count` whenever `count > 0`.
    pub avg_reward: f64,
}

#[derive(Debug, Default)]
struct Ucb1State {
    /// Total plays across all arms (the `t` in the UCB1 formula).
    total_counts: i64,
    arms: BTreeMap<Architecture, ArmStats>,
}

/// UCB1: `avg_reward + c * sqrt(ln(t) / count)`.
///
/// Selection runs on the dispatch hot path; the play counters are
/// incremented there, optimistically, and taken back later if the
/// execution turns out to be a cold start.
#[derive(Debug)]
pub struct Ucb1Policy {
    /// Exploration constant. Larger values explore more.
    c: f64,
    state: Mutex<Ucb1State>,
}

impl Ucb1Policy {
    pub fn new(c: f64) -> Self {
        Self {
            c,
            state: Mutex::new(Ucb1State::default()),
        }
    }

    /// Snapshot of one arm's statistics.
    pub fn arm_stats(&self, arm: Architecture) -> Option<ArmStats> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .arms
            .get(&arm)
            .copied()
    }

    pub fn total_counts(&self) -> i64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .total_counts
    }
}

impl Policy for Ucb1Policy {
    fn init_arm(&self, arm: Architecture) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .arms
            .entry(arm)
            .or_default();
    }

    fn select_arm(&self, _ctx: Option<&DecisionContext>) -> Option<Architecture> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        // Forced exploration first: any arm under the sample floor gets
        // played, fewest plays winning, canonical order breaking ties.
        let mut least_tried: Option<(Architecture, i64)> = None;
        for (&arm, stats) in &state.arms {
            if stats.count < MIN_SAMPLES
                && least_tried.map_or(true, |(_, count)| stats.count < count)
            {
                least_tried = Some((arm, stats.count));
            }
        }

        let chosen = match least_tried {
            Some((arm, _)) => {
                tracing::trace!(arm = %arm, "forcing least-tried arm");
                arm
            }
            None => {
                let total = state.total_counts as f64;
                let mut best: Option<(Architecture, f64)> = None;
                for (&arm, stats) in &state.arms {
                    let bonus = self.c * (total.ln() / stats.count as f64).sqrt();
                    let score = stats.avg_reward + bonus;
                    tracing::trace!(arm = %arm, score, "scored arm");
                    if best.map_or(true, |(_, s)| score > s) {
                        best = Some((arm, score));
                    }
                }
                best?.0
            }
        };

        state.total_counts += 1;
        if let Some(stats) = state.arms.get_mut(&chosen) {
            stats.count += 1;
        }
        Some(chosen)
    }

    fn update_reward(
        &self,
        arm: Architecture,
        _ctx: Option<&DecisionContext>,
        is_warm_start: bool,
        duration_ms: f64,
    ) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if !is_warm_start {
            // The selection-side increments assumed a usable sample.
            // Take them back and leave the reward statistics untouched.
            state.total_counts -= 1;
            if let Some(stats) = state.arms.get_mut(&arm) {
                stats.count -= 1;
            }
            return;
        }

        let Some(stats) = state.arms.get_mut(&arm) else {
            tracing::warn!(arm = %arm, "reward for unknown arm ignored");
            return;
        };

        stats.sum_rewards += reward(duration_ms);
        stats.avg_reward = stats.sum_rewards / stats.count as f64;
    }

    fn kind(&self) -> PolicyKind {
        PolicyKind::Ucb1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Ucb1Policy {
        let policy = Ucb1Policy::new(std::f64::consts::SQRT_2);
        policy.init_arm(Architecture::Amd64);
        policy.init_arm(Architecture::Arm64);
        policy
    }

    #[test]
    fn first_selection_forces_amd64() {
        let policy = policy();
        assert_eq!(policy.select_arm(None), Some(Architecture::Amd64));
        assert_eq!(policy.total_counts(), 1);
        assert_eq!(policy.arm_stats(Architecture::Amd64).unwrap().count, 1);
        assert_eq!(policy.arm_stats(Architecture::Arm64).unwrap().count, 0);
    }

    #[test]
    fn second_selection_forces_the_other_arm() {
        let policy = policy();
        assert_eq!(policy.select_arm(None), Some(Architecture::Amd64));
        assert_eq!(policy.select_arm(None), Some(Architecture::Arm64));
        assert_eq!(policy.total_counts(), 2);
    }

    #[test]
    fn cold_start_redacts_the_optimistic_counters() {
        let policy = policy();
        let arm = policy.select_arm(None).unwrap();
        assert_eq!(policy.total_counts(), 1);

        policy.update_reward(arm, None, false, 5000.0);

        assert_eq!(policy.total_counts(), 0);
        assert_eq!(policy.arm_stats(arm).unwrap().count, 0);
        assert_eq!(policy.arm_stats(arm).unwrap().sum_rewards, 0.0);
    }

    #[test]
    fn counters_stay_consistent_over_warm_updates() {
        let policy = policy();
        for i in 0..20 {
            let arm = policy.select_arm(None).unwrap();
            policy.update_reward(arm, None, true, 50.0 + f64::from(i));
        }

        let amd = policy.arm_stats(Architecture::Amd64).unwrap();
        let arm = policy.arm_stats(Architecture::Arm64).unwrap();
        assert_eq!(policy.total_counts(), amd.count + arm.count);
        for stats in [amd, arm] {
            if stats.count > 0 {
                let expected = stats.sum_rewards / stats.count as f64;
                assert!((stats.avg_reward - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn exploitation_prefers_the_faster_arm() {
        let policy = Ucb1Policy::new(0.1);
        policy.init_arm(Architecture::Amd64);
        policy.init_arm(Architecture::Arm64);

        // Feed a clear signal: arm64 runs 10x faster.
        for _ in 0..50 {
            let arm = policy.select_arm(None).unwrap();
            let duration_ms = match arm {
                Architecture::Arm64 => 10.0,
                Architecture::Amd64 => 100.0,
            };
            policy.update_reward(arm, None, true, duration_ms);
        }

        let fast = policy.arm_stats(Architecture::Arm64).unwrap();
        let slow = policy.arm_stats(Architecture::Amd64).unwrap();
        assert!(fast.count > slow.count);
        assert_eq!(policy.select_arm(None), Some(Architecture::Arm64));
    }

    #[test]
    fn cold_start_then_reselect_matches_pre_selection_state() {
        let policy = policy();
        // Warm up both arms so the scoring branch is in play.
        for _ in 0..2 {
            let arm = policy.select_arm(None).unwrap();
            policy.update_reward(arm, None, true, 80.0);
        }
        let total_before = policy.total_counts();

        let arm = policy.select_arm(None).unwrap();
        let count_before = policy.arm_stats(arm).unwrap().count;
        policy.update_reward(arm, None, false, 9000.0);

        assert_eq!(policy.total_counts(), total_before);
        assert_eq!(policy.arm_stats(arm).unwrap().count, count_before - 1);
    }
}
