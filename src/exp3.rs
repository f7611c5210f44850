//! EXP3 (adversarial bandit) for arm selection.
//!
//! Classic EXP3: selection probability is a mixture of uniform exploration
//! (rate `gamma`) and weight-proportional exploitation, and the chosen arm's
//! weight is multiplied by `exp(gamma * reward / (K * prob))`.
//!
//! Per-arm state is keyed by arm id and persists across calls, so offering a
//! subset of the arms (as ensemble selection does) neither resets the weights
//! nor drops updates for arms outside the most recent offering.
//!
//! This policy is useful when rewards can be adversarial / highly
//! non-stationary. It is **seedable** so it can be reproducible in tests;
//! default construction is deterministic by default.

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use std::collections::BTreeMap;

/// Configuration for EXP3.
#[derive(Debug, Clone, Copy)]
pub struct Exp3Config {
    /// Uniform exploration rate in `(0, 1]`.
    pub gamma: f64,
    /// Seed for the internal RNG (used only after initial exploration).
    pub seed: u64,
}

impl Default for Exp3Config {
    fn default() -> Self {
        Self {
            gamma: 0.1,
            seed: 0,
        }
    }
}

/// Persistent per-arm EXP3 state.
#[derive(Debug, Clone)]
struct ArmState {
    weight: f64,
    uses: u64,
    /// Selection probability and offering size at the arm's most recent
    /// offering; the importance weight `1 / (K * prob)` comes from these.
    last_prob: f64,
    last_k: usize,
}

impl ArmState {
    fn new(weight: f64) -> Self {
        Self {
            weight,
            uses: 0,
            last_prob: 0.0,
            last_k: 0,
        }
    }
}

/// Seedable EXP3 bandit.
#[derive(Debug, Clone)]
pub struct Exp3 {
    cfg: Exp3Config,
    rng: StdRng,

    // Per-arm state, keyed by arm id; never discarded once an arm is seen.
    arms: BTreeMap<String, ArmState>,

    // Priors seeded before the arm is first seen.
    pending_priors: BTreeMap<String, f64>,
}

impl Exp3 {
    /// Create a new EXP3 instance with deterministic defaults.
    pub fn new(cfg: Exp3Config) -> Self {
        Self::with_seed(cfg, cfg.seed)
    }

    /// Create with an explicit seed.
    pub fn with_seed(mut cfg: Exp3Config, seed: u64) -> Self {
        cfg.seed = seed;
        if !(cfg.gamma.is_finite() && cfg.gamma > 0.0 && cfg.gamma <= 1.0) {
            cfg.gamma = 0.1;
        }
        Self {
            cfg,
            rng: StdRng::seed_from_u64(seed),
            arms: BTreeMap::new(),
            pending_priors: BTreeMap::new(),
        }
    }

    /// Exploration rate in use.
    pub fn gamma(&self) -> f64 {
        self.cfg.gamma
    }

    /// Seed an arm with a prior mean reward of strength `weight`
    /// (pseudo-pulls). Applied when the arm is first seen.
    pub fn seed_prior(&mut self, arm: &str, mean: f64, weight: f64) {
        if mean.is_finite() && weight.is_finite() && weight > 0.0 {
            self.pending_priors.insert(arm.to_string(), mean * weight);
        }
    }

    fn ensure_arms(&mut self, arms_in_order: &[String]) {
        let k = arms_in_order.len().max(1) as f64;
        for a in arms_in_order {
            if self.arms.contains_key(a) {
                continue;
            }
            // Fold any seeded prior into the initial weight, as if the prior
            // mean had been observed under uniform probabilities.
            let weight = match self.pending_priors.remove(a) {
                Some(mass) => (self.cfg.gamma * mass / k).exp(),
                None => 1.0,
            };
            self.arms.insert(a.clone(), ArmState::new(weight));
        }
    }

    /// Rescale all weights so the largest is 1 (overflow guard). A global
    /// scale factor leaves every selection probability unchanged.
    fn renormalize_weights(&mut self) {
        let w_max = self
            .arms
            .values()
            .map(|s| s.weight)
            .fold(f64::NEG_INFINITY, f64::max);
        if w_max.is_finite() && w_max > 0.0 {
            for s in self.arms.values_mut() {
                s.weight /= w_max;
            }
        } else {
            for s in self.arms.values_mut() {
                s.weight = 1.0;
            }
        }
    }

    /// Selection probabilities over the offered arms.
    ///
    /// Records each offered arm's probability and the offering size, which a
    /// later [`Exp3::update_reward`] for that arm will be credited against.
    pub fn probabilities(&mut self, arms_in_order: &[String]) -> BTreeMap<String, f64> {
        self.ensure_arms(arms_in_order);
        let mut out = BTreeMap::new();
        if arms_in_order.is_empty() {
            return out;
        }
        self.renormalize_weights();

        let k = arms_in_order.len();
        let kf = k as f64;
        let total: f64 = arms_in_order
            .iter()
            .filter_map(|a| self.arms.get(a))
            .map(|s| s.weight)
            .sum();
        let gamma = self.cfg.gamma;

        for a in arms_in_order {
            let Some(state) = self.arms.get_mut(a) else {
                continue;
            };
            let prob = if total > 0.0 && total.is_finite() {
                (1.0 - gamma) * state.weight / total + gamma / kf
            } else {
                1.0 / kf
            };
            state.last_prob = prob;
            state.last_k = k;
            out.insert(a.clone(), prob);
        }
        out
    }

    /// Select an arm and return the probabilities used for selection.
    ///
    /// The returned distribution is what `update_reward` should be credited
    /// against — the importance weight `1 / (K * prob)` comes from it.
    pub fn select_with_probs<'a>(
        &mut self,
        arms_in_order: &'a [String],
    ) -> Option<(&'a String, BTreeMap<String, f64>)> {
        if arms_in_order.is_empty() {
            return None;
        }
        let probs = self.probabilities(arms_in_order);

        // Explore each arm once in stable order.
        for a in arms_in_order {
            if self.arms.get(a).map(|s| s.uses).unwrap_or(0) == 0 {
                return Some((a, probs));
            }
        }

        let r: f64 = self.rng.random();
        let mut cdf = 0.0;
        for a in arms_in_order {
            cdf += probs.get(a).copied().unwrap_or(0.0);
            if r < cdf {
                return Some((a, probs));
            }
        }
        // Numerical fallback.
        arms_in_order.last().map(|a| (a, probs))
    }

    /// Select an arm.
    pub fn select<'a>(&mut self, arms_in_order: &'a [String]) -> Option<&'a String> {
        self.select_with_probs(arms_in_order).map(|(a, _)| a)
    }

    /// Update EXP3 with a bounded reward in `[0, 1]` for the chosen arm.
    ///
    /// `weight *= exp(gamma * reward / (K * prob))`, where `prob` and `K`
    /// are from the arm's most recent offering. The arm keeps its state even
    /// when later offerings exclude it.
    pub fn update_reward(&mut self, arm: &str, reward01: f64) {
        let gamma = self.cfg.gamma;
        let Some(state) = self.arms.get_mut(arm) else {
            // Never offered; nothing to credit.
            return;
        };
        if state.last_k == 0 {
            return;
        }
        let r = reward01.clamp(0.0, 1.0);
        let k = state.last_k as f64;
        let p = state.last_prob.max(1e-12);

        let xhat = r / (k * p);
        state.weight *= (gamma * xhat).exp();
        state.uses = state.uses.saturating_add(1);
        self.renormalize_weights();
    }
}

impl Default for Exp3 {
    fn default() -> Self {
        Self::new(Exp3Config::default())
    }
}
