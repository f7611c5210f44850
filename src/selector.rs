//! The online selector: one capability, three interchangeable policies.
//!
//! [`OnlineSelector`] is a closed tagged variant over {UCB1, Thompson, EXP3}
//! — selection dispatches via `match`, so adding a policy is a compile-time
//! exhaustiveness change, not a runtime registration.
//!
//! The selector owns the canonical per-arm [`ArmStats`] (Welford running
//! statistics): they drive UCB1 directly, feed the dashboard snapshot for
//! every policy, and are mutated only inside [`OnlineSelector::update`].
//! Rewards must lie in the configured [`RewardRange`]; out-of-range or
//! non-finite rewards fail with `InvalidReward` before any state changes.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::decision::{Decision, DecisionNote, DecisionPolicy};
use crate::error::{PortfolioError, Result};
use crate::meta::WeightedPriorSet;
use crate::ucb::{ucb1_select, ArmStats};

#[cfg(feature = "stochastic")]
use crate::exp3::{Exp3, Exp3Config};
#[cfg(feature = "stochastic")]
use crate::thompson::{PosteriorFamily, ThompsonConfig, ThompsonSampling};

/// Inclusive reward bounds enforced by [`OnlineSelector::update`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardRange {
    pub lo: f64,
    pub hi: f64,
}

impl Default for RewardRange {
    fn default() -> Self {
        Self { lo: 0.0, hi: 1.0 }
    }
}

impl RewardRange {
    pub fn new(lo: f64, hi: f64) -> Self {
        Self { lo, hi }
    }

    pub fn contains(&self, reward: f64) -> bool {
        reward.is_finite() && reward >= self.lo && reward <= self.hi
    }

    /// Rescale a reward in this range to `[0, 1]`.
    pub fn to_unit(&self, reward: f64) -> f64 {
        let span = self.hi - self.lo;
        if span > 0.0 && span.is_finite() {
            ((reward - self.lo) / span).clamp(0.0, 1.0)
        } else {
            reward.clamp(0.0, 1.0)
        }
    }
}

/// Dashboard snapshot of one arm's running statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmStatistics {
    pub arm_id: String,
    pub pulls: u64,
    pub mean_reward: f64,
    pub variance: f64,
    pub last_update: SystemTime,
}

enum PolicyState {
    Ucb1,
    #[cfg(feature = "stochastic")]
    Thompson(ThompsonSampling),
    #[cfg(feature = "stochastic")]
    Exp3(Exp3),
}

/// Bandit selector over the registered arms.
pub struct OnlineSelector {
    policy: PolicyState,
    range: RewardRange,
    stats: BTreeMap<String, ArmStats>,
    /// Arms seeded since the last selection; reported once via
    /// [`DecisionNote::PriorSeeded`].
    freshly_seeded: Vec<String>,
}

impl OnlineSelector {
    /// Deterministic UCB1 selector.
    pub fn ucb1() -> Self {
        Self {
            policy: PolicyState::Ucb1,
            range: RewardRange::default(),
            stats: BTreeMap::new(),
            freshly_seeded: Vec::new(),
        }
    }

    /// Seedable Thompson-sampling selector.
    #[cfg(feature = "stochastic")]
    pub fn thompson(cfg: ThompsonConfig, seed: u64) -> Self {
        Self {
            policy: PolicyState::Thompson(ThompsonSampling::with_seed(cfg, seed)),
            range: RewardRange::default(),
            stats: BTreeMap::new(),
            freshly_seeded: Vec::new(),
        }
    }

    /// Seedable EXP3 selector.
    #[cfg(feature = "stochastic")]
    pub fn exp3(cfg: Exp3Config, seed: u64) -> Self {
        Self {
            policy: PolicyState::Exp3(Exp3::with_seed(cfg, seed)),
            range: RewardRange::default(),
            stats: BTreeMap::new(),
            freshly_seeded: Vec::new(),
        }
    }

    /// Set the accepted reward range (default `[0, 1]`).
    pub fn with_reward_range(mut self, range: RewardRange) -> Self {
        self.range = range;
        self
    }

    /// The accepted reward range.
    pub fn reward_range(&self) -> RewardRange {
        self.range
    }

    /// Which policy this selector dispatches to.
    pub fn policy(&self) -> DecisionPolicy {
        match &self.policy {
            PolicyState::Ucb1 => DecisionPolicy::Ucb1,
            #[cfg(feature = "stochastic")]
            PolicyState::Thompson(_) => DecisionPolicy::Thompson,
            #[cfg(feature = "stochastic")]
            PolicyState::Exp3(_) => DecisionPolicy::Exp3,
        }
    }

    /// Select one arm from `arms_in_order`.
    ///
    /// Returns `None` only if `arms_in_order` is empty.
    pub fn select(&mut self, arms_in_order: &[String]) -> Option<Decision> {
        if arms_in_order.is_empty() {
            return None;
        }
        for a in arms_in_order {
            self.stats.entry(a.clone()).or_default();
        }

        let (chosen, probs, note) = match &mut self.policy {
            PolicyState::Ucb1 => {
                let chosen = ucb1_select(arms_in_order, &self.stats)?.clone();
                (chosen, None, DecisionNote::DeterministicChoice)
            }
            #[cfg(feature = "stochastic")]
            PolicyState::Thompson(ts) => {
                let chosen = ts.select(arms_in_order)?.clone();
                (chosen, None, DecisionNote::SampledPosteriorMax)
            }
            #[cfg(feature = "stochastic")]
            PolicyState::Exp3(ex) => {
                let (chosen, probs) = ex.select_with_probs(arms_in_order)?;
                let chosen = chosen.clone();
                (chosen, Some(probs), DecisionNote::SampledFromDistribution)
            }
        };

        let mut notes = Vec::new();
        if !self.freshly_seeded.is_empty() {
            notes.push(DecisionNote::PriorSeeded {
                arms: std::mem::take(&mut self.freshly_seeded),
            });
        }
        if self.stats.get(&chosen).map(|s| s.pulls).unwrap_or(0) == 0 {
            notes.push(DecisionNote::ExploreFirst);
        }
        notes.push(note);

        Some(Decision {
            policy: self.policy(),
            chosen,
            probs,
            notes,
        })
    }

    /// Select up to `k` **distinct** arms (for ensemble rounds).
    ///
    /// Each pick re-runs the policy over the not-yet-chosen arms, so the
    /// result is ordered by preference.
    pub fn select_k(&mut self, arms_in_order: &[String], k: usize) -> Vec<Decision> {
        let mut remaining: Vec<String> = arms_in_order.to_vec();
        let mut out = Vec::new();
        while out.len() < k && !remaining.is_empty() {
            let Some(d) = self.select(&remaining) else {
                break;
            };
            remaining.retain(|a| a != &d.chosen);
            out.push(d);
        }
        out
    }

    /// Fold a realized reward into the chosen arm.
    ///
    /// Fails with [`PortfolioError::InvalidReward`] if the reward is outside
    /// the configured range, and [`PortfolioError::UnknownArm`] if the arm
    /// has never been offered to this selector.
    pub fn update(&mut self, arm: &str, reward: f64) -> Result<()> {
        if !self.stats.contains_key(arm) {
            return Err(PortfolioError::UnknownArm(arm.to_string()));
        }
        if !self.range.contains(reward) {
            return Err(PortfolioError::InvalidReward {
                reward,
                lo: self.range.lo,
                hi: self.range.hi,
            });
        }

        if let Some(s) = self.stats.get_mut(arm) {
            s.observe(reward);
        }

        match &mut self.policy {
            PolicyState::Ucb1 => {}
            #[cfg(feature = "stochastic")]
            PolicyState::Thompson(ts) => {
                let r = match ts.family() {
                    PosteriorFamily::Beta => self.range.to_unit(reward),
                    PosteriorFamily::NormalInverseGamma => reward,
                };
                ts.update_reward(arm, r);
            }
            #[cfg(feature = "stochastic")]
            PolicyState::Exp3(ex) => {
                ex.update_reward(arm, self.range.to_unit(reward));
            }
        }
        Ok(())
    }

    /// Snapshot of the per-arm statistics, sorted by arm id.
    pub fn statistics(&self) -> Vec<ArmStatistics> {
        self.stats
            .iter()
            .map(|(arm, s)| ArmStatistics {
                arm_id: arm.clone(),
                pulls: s.pulls,
                mean_reward: s.mean,
                variance: s.variance(),
                last_update: s.last_update,
            })
            .collect()
    }

    /// Seed statistics and policy state from a transferred prior set.
    ///
    /// No-op for an empty prior.
    pub fn seed_priors(&mut self, prior: &WeightedPriorSet) {
        let span = (self.range.hi - self.range.lo).max(f64::MIN_POSITIVE);
        for (arm, p) in &prior.priors {
            let pseudo = p.weight.round().max(1.0) as u64;
            let entry = self.stats.entry(arm.clone()).or_default();
            if entry.pulls == 0 {
                self.freshly_seeded.push(arm.clone());
            }
            entry.seed(p.mean, p.variance, pseudo);

            match &mut self.policy {
                PolicyState::Ucb1 => {}
                #[cfg(feature = "stochastic")]
                PolicyState::Thompson(ts) => {
                    let (mean, variance) = match ts.family() {
                        PosteriorFamily::Beta => {
                            (self.range.to_unit(p.mean), p.variance / (span * span))
                        }
                        PosteriorFamily::NormalInverseGamma => (p.mean, p.variance),
                    };
                    ts.seed_prior(arm, mean, variance, p.weight);
                }
                #[cfg(feature = "stochastic")]
                PolicyState::Exp3(ex) => {
                    ex.seed_prior(arm, self.range.to_unit(p.mean), p.weight);
                }
            }
        }
    }
}
