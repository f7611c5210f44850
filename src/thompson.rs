//! Thompson sampling for arm selection.
//!
//! Maintains a conjugate posterior per arm, draws one sample per posterior on
//! each selection, and picks the arm with the highest sample.
//!
//! Two posterior families are supported:
//! - [`PosteriorFamily::Beta`] for rewards normalized to `[0, 1]` (the
//!   default; the selector enforces the bound before `update` is called).
//! - [`PosteriorFamily::NormalInverseGamma`] for unbounded reward scales.
//!
//! Notes:
//! - This policy is **seedable** so selection can be reproducible in tests.
//! - Default construction uses a fixed seed (deterministic by default).

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Beta, Distribution, Gamma, Normal};
use std::collections::BTreeMap;

/// Which conjugate posterior each arm maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PosteriorFamily {
    /// Beta posterior over a bounded `[0, 1]` reward rate.
    Beta,
    /// Normal-Inverse-Gamma posterior over an unbounded reward mean.
    NormalInverseGamma,
}

/// Configuration for Thompson sampling.
#[derive(Debug, Clone)]
pub struct ThompsonConfig {
    /// Posterior family used for every arm.
    pub family: PosteriorFamily,
    /// Beta prior alpha (must be > 0).
    pub alpha0: f64,
    /// Beta prior beta (must be > 0).
    pub beta0: f64,
    /// NIG prior mean.
    pub mu0: f64,
    /// NIG prior pseudo-observation count (must be > 0).
    pub kappa0: f64,
}

impl Default for ThompsonConfig {
    fn default() -> Self {
        Self {
            family: PosteriorFamily::Beta,
            alpha0: 1.0,
            beta0: 1.0,
            mu0: 0.0,
            kappa0: 1.0,
        }
    }
}

/// Posterior state for one arm.
#[derive(Debug, Clone, Copy)]
pub enum Posterior {
    /// Beta(alpha, beta) over the reward rate.
    Beta { alpha: f64, beta: f64, uses: u64 },
    /// Normal-Inverse-Gamma(mu, kappa, alpha, beta) over (mean, variance).
    Nig {
        mu: f64,
        kappa: f64,
        alpha: f64,
        beta: f64,
        uses: u64,
    },
}

impl Posterior {
    /// Posterior mean of the arm's reward.
    pub fn expected_value(&self) -> f64 {
        match *self {
            Posterior::Beta { alpha, beta, .. } => {
                let denom = alpha + beta;
                if denom <= 0.0 {
                    0.5
                } else {
                    alpha / denom
                }
            }
            Posterior::Nig { mu, .. } => mu,
        }
    }

    /// Number of observed rewards folded into this posterior.
    pub fn uses(&self) -> u64 {
        match *self {
            Posterior::Beta { uses, .. } | Posterior::Nig { uses, .. } => uses,
        }
    }
}

/// Seedable Thompson-sampling bandit.
#[derive(Debug, Clone)]
pub struct ThompsonSampling {
    cfg: ThompsonConfig,
    stats: BTreeMap<String, Posterior>,
    seeded: BTreeMap<String, bool>,
    rng: StdRng,
}

impl ThompsonSampling {
    /// Create a Thompson-sampling bandit with a deterministic fixed seed (0).
    pub fn new(cfg: ThompsonConfig) -> Self {
        Self::with_seed(cfg, 0)
    }

    /// Create a Thompson-sampling bandit with a fixed seed (reproducible).
    pub fn with_seed(cfg: ThompsonConfig, seed: u64) -> Self {
        Self {
            cfg,
            stats: BTreeMap::new(),
            seeded: BTreeMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Access the per-arm posteriors.
    pub fn stats(&self) -> &BTreeMap<String, Posterior> {
        &self.stats
    }

    /// Posterior family in use.
    pub fn family(&self) -> PosteriorFamily {
        self.cfg.family
    }

    /// Reset all learned state.
    pub fn reset(&mut self) {
        self.stats.clear();
        self.seeded.clear();
    }

    /// Seed an arm's posterior from a transferred prior: `weight`
    /// pseudo-observations at `mean` with the given variance.
    ///
    /// A seeded arm skips the forced cold-start pick — the prior stands in
    /// for the first observation. No-op once the arm has real observations:
    /// transfer never overwrites a learned posterior.
    pub fn seed_prior(&mut self, arm: &str, mean: f64, variance: f64, weight: f64) {
        if !(mean.is_finite() && weight.is_finite()) || weight <= 0.0 {
            return;
        }
        if self.stats.get(arm).map(|p| p.uses() > 0).unwrap_or(false) {
            return;
        }
        let p = match self.cfg.family {
            PosteriorFamily::Beta => {
                let m = mean.clamp(0.0, 1.0);
                Posterior::Beta {
                    alpha: (m * weight).max(1e-3),
                    beta: ((1.0 - m) * weight).max(1e-3),
                    uses: 0,
                }
            }
            PosteriorFamily::NormalInverseGamma => Posterior::Nig {
                mu: mean,
                kappa: weight,
                alpha: (weight / 2.0).max(0.5),
                beta: (variance.max(1e-6) * weight / 2.0).max(1e-6),
                uses: 0,
            },
        };
        self.stats.insert(arm.to_string(), p);
        self.seeded.insert(arm.to_string(), true);
    }

    fn fresh_posterior(&self) -> Posterior {
        match self.cfg.family {
            PosteriorFamily::Beta => Posterior::Beta {
                alpha: if self.cfg.alpha0.is_finite() && self.cfg.alpha0 > 0.0 {
                    self.cfg.alpha0
                } else {
                    1.0
                },
                beta: if self.cfg.beta0.is_finite() && self.cfg.beta0 > 0.0 {
                    self.cfg.beta0
                } else {
                    1.0
                },
                uses: 0,
            },
            PosteriorFamily::NormalInverseGamma => Posterior::Nig {
                mu: self.cfg.mu0,
                kappa: if self.cfg.kappa0.is_finite() && self.cfg.kappa0 > 0.0 {
                    self.cfg.kappa0
                } else {
                    1.0
                },
                alpha: 1.0,
                beta: 1.0,
                uses: 0,
            },
        }
    }

    fn get_or_create(&mut self, arm: &str) -> Posterior {
        if let Some(&p) = self.stats.get(arm) {
            return p;
        }
        let p = self.fresh_posterior();
        self.stats.insert(arm.to_string(), p);
        p
    }

    fn sample_posterior(&mut self, p: Posterior) -> f64 {
        match p {
            Posterior::Beta { alpha, beta, .. } => {
                if !(alpha.is_finite() && beta.is_finite()) || alpha <= 0.0 || beta <= 0.0 {
                    return 0.5;
                }
                match Beta::new(alpha, beta) {
                    Ok(dist) => dist.sample(&mut self.rng),
                    Err(_) => 0.5,
                }
            }
            Posterior::Nig {
                mu,
                kappa,
                alpha,
                beta,
                ..
            } => {
                // Precision ~ Gamma(alpha, rate = beta), then the mean
                // ~ Normal(mu, 1 / (kappa * precision)).
                let precision = match Gamma::new(alpha.max(1e-6), 1.0 / beta.max(1e-12)) {
                    Ok(dist) => dist.sample(&mut self.rng).max(1e-12),
                    Err(_) => return mu,
                };
                let sd = (1.0 / (kappa.max(1e-12) * precision)).sqrt();
                match Normal::new(mu, sd) {
                    Ok(dist) => dist.sample(&mut self.rng),
                    Err(_) => mu,
                }
            }
        }
    }

    /// Select an arm.
    ///
    /// Policy:
    /// - Explore: return the first unseeded arm (stable order) with
    ///   `uses == 0`.
    /// - Otherwise: sample from each arm's posterior and choose the max.
    /// - Tie-break: lexicographic arm name.
    pub fn select<'a>(&mut self, arms_in_order: &'a [String]) -> Option<&'a String> {
        for a in arms_in_order {
            let p = self.get_or_create(a);
            if p.uses() == 0 && !self.seeded.get(a.as_str()).copied().unwrap_or(false) {
                return Some(a);
            }
        }

        let mut best: Option<&'a String> = None;
        let mut best_sample = f64::NEG_INFINITY;
        for a in arms_in_order {
            let p = self.get_or_create(a);
            let x = self.sample_posterior(p);
            if x > best_sample
                || ((x - best_sample).abs() <= 1e-12 && best.map(|b| a < b).unwrap_or(true))
            {
                best_sample = x;
                best = Some(a);
            }
        }
        best
    }

    /// Update the chosen arm with an observed reward.
    ///
    /// The Beta family interprets the (already normalized) reward as a
    /// fractional success: `alpha += r`, `beta += 1 - r`. The NIG family
    /// performs the standard conjugate update for one Gaussian observation.
    pub fn update_reward(&mut self, arm: &str, reward: f64) {
        let p = self.get_or_create(arm);
        let updated = match p {
            Posterior::Beta { alpha, beta, uses } => {
                let r = reward.clamp(0.0, 1.0);
                Posterior::Beta {
                    alpha: alpha + r,
                    beta: beta + 1.0 - r,
                    uses: uses.saturating_add(1),
                }
            }
            Posterior::Nig {
                mu,
                kappa,
                alpha,
                beta,
                uses,
            } => {
                let kappa1 = kappa + 1.0;
                Posterior::Nig {
                    mu: (kappa * mu + reward) / kappa1,
                    kappa: kappa1,
                    alpha: alpha + 0.5,
                    beta: beta + kappa * (reward - mu).powi(2) / (2.0 * kappa1),
                    uses: uses.saturating_add(1),
                }
            }
        };
        self.stats.insert(arm.to_string(), updated);
    }
}

impl Default for ThompsonSampling {
    fn default() -> Self {
        Self::new(ThompsonConfig::default())
    }
}
