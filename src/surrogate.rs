//! Gaussian-process surrogate over configuration space.
//!
//! Solver runs are expensive; the surrogate is the cheap stand-in. It
//! regresses (configuration → performance) pairs with a squared-exponential
//! kernel and proposes untried configurations by maximizing Expected
//! Improvement over the incumbent best.
//!
//! Performance is on the selector's reward scale: **higher is better**
//! (objectives are normalized before they get here).
//!
//! Numeric contract: the covariance matrix is regularized with diagonal
//! jitter before Cholesky factorization. If factorization still fails, the
//! jitter escalates a fixed number of times; only then does `fit` fail with
//! [`PortfolioError::SurrogateFitFailure`], and the caller falls back to the
//! bandit-only path for the round.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PortfolioError, Result};
use crate::registry::ConfigSpace;

/// One observed (configuration, performance) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurrogateObservation {
    pub config: Vec<f64>,
    pub performance: f64,
    pub problem_id: String,
}

/// GP hyperparameters and proposal settings.
#[derive(Debug, Clone, Copy)]
pub struct GpConfig {
    /// Squared-exponential kernel length scale.
    pub length_scale: f64,
    /// Kernel signal variance.
    pub signal_variance: f64,
    /// Observation noise added to the covariance diagonal.
    pub noise_variance: f64,
    /// Initial regularization jitter.
    pub jitter: f64,
    /// How many ×10 jitter escalations to attempt before failing.
    pub max_jitter_escalations: u32,
    /// Expected-Improvement exploration bonus.
    pub ei_xi: f64,
    /// Candidate pool size per proposal batch.
    pub candidate_pool: usize,
}

impl Default for GpConfig {
    fn default() -> Self {
        Self {
            length_scale: 1.0,
            signal_variance: 1.0,
            noise_variance: 1e-4,
            jitter: 1e-8,
            max_jitter_escalations: 6,
            ei_xi: 0.01,
            candidate_pool: 64,
        }
    }
}

/// Gaussian-process regressor with EI-based proposals.
#[derive(Clone)]
pub struct GpSurrogate {
    cfg: GpConfig,
    prior_mean: f64,
    obs: Vec<SurrogateObservation>,
    chol: Option<Cholesky<f64, Dyn>>,
    /// `K⁻¹ (y - prior_mean)`, valid when `chol` is set.
    alpha: Option<DVector<f64>>,
}

impl GpSurrogate {
    pub fn new(cfg: GpConfig) -> Self {
        Self {
            cfg,
            prior_mean: 0.0,
            obs: Vec::new(),
            chol: None,
            alpha: None,
        }
    }

    /// Set the prior mean (e.g. a meta-transferred expectation).
    pub fn set_prior_mean(&mut self, mean: f64) {
        if mean.is_finite() {
            self.prior_mean = mean;
        }
    }

    /// Append an observation. Invalidates the current fit.
    pub fn observe(&mut self, obs: SurrogateObservation) {
        self.obs.push(obs);
        self.chol = None;
        self.alpha = None;
    }

    pub fn observations(&self) -> &[SurrogateObservation] {
        &self.obs
    }

    /// Best observed performance so far (higher is better).
    pub fn best_observed(&self) -> Option<f64> {
        self.obs
            .iter()
            .map(|o| o.performance)
            .filter(|p| p.is_finite())
            .fold(None, |acc, p| Some(acc.map_or(p, |a: f64| a.max(p))))
    }

    /// True if `predict` is backed by a factorized fit.
    pub fn is_fit(&self) -> bool {
        self.chol.is_some()
    }

    fn kernel(&self, a: &[f64], b: &[f64]) -> f64 {
        let l2 = self.cfg.length_scale * self.cfg.length_scale;
        let d2: f64 = a.iter().zip(b).map(|(&x, &y)| (x - y) * (x - y)).sum();
        self.cfg.signal_variance * (-d2 / (2.0 * l2)).exp()
    }

    /// Refit the GP over all observations.
    ///
    /// With zero observations this is a no-op success; `predict` then
    /// returns the prior.
    pub fn fit(&mut self) -> Result<()> {
        let n = self.obs.len();
        self.chol = None;
        self.alpha = None;
        if n == 0 {
            return Ok(());
        }

        let mut base = DMatrix::zeros(n, n);
        for i in 0..n {
            for j in 0..n {
                base[(i, j)] = self.kernel(&self.obs[i].config, &self.obs[j].config);
            }
        }
        for i in 0..n {
            base[(i, i)] += self.cfg.noise_variance;
        }

        let y = DVector::from_iterator(n, self.obs.iter().map(|o| o.performance - self.prior_mean));

        let mut jitter = self.cfg.jitter.max(1e-12);
        for escalation in 0..=self.cfg.max_jitter_escalations {
            let mut k = base.clone();
            for i in 0..n {
                k[(i, i)] += jitter;
            }
            if let Some(chol) = Cholesky::new(k) {
                if escalation > 0 {
                    debug!(escalation, jitter, "covariance factorized after jitter escalation");
                }
                self.alpha = Some(chol.solve(&y));
                self.chol = Some(chol);
                return Ok(());
            }
            jitter *= 10.0;
        }
        Err(PortfolioError::SurrogateFitFailure {
            escalations: self.cfg.max_jitter_escalations,
        })
    }

    /// Posterior mean and variance at `config`.
    ///
    /// Without a fit (no observations, or `fit` not called) this returns the
    /// prior: `(prior_mean, signal_variance + noise_variance)`.
    pub fn predict(&self, config: &[f64]) -> (f64, f64) {
        let (Some(chol), Some(alpha)) = (&self.chol, &self.alpha) else {
            return (
                self.prior_mean,
                self.cfg.signal_variance + self.cfg.noise_variance,
            );
        };
        let n = self.obs.len();
        let kstar = DVector::from_iterator(n, self.obs.iter().map(|o| self.kernel(config, &o.config)));
        let mean = self.prior_mean + kstar.dot(alpha);
        let w = chol.solve(&kstar);
        let variance =
            (self.cfg.signal_variance + self.cfg.noise_variance - kstar.dot(&w)).max(0.0);
        (mean, variance)
    }

    /// Expected Improvement of `config` over the incumbent best.
    pub fn expected_improvement(&self, config: &[f64]) -> f64 {
        let Some(best) = self.best_observed() else {
            // No incumbent: everything is equally improving.
            return 1.0;
        };
        let (mean, variance) = self.predict(config);
        let sigma = variance.sqrt();
        if sigma < 1e-12 {
            return 0.0;
        }
        let improvement = mean - best - self.cfg.ei_xi;
        let z = improvement / sigma;
        improvement * normal_cdf(z) + sigma * normal_pdf(z)
    }

    /// Propose `n` configurations from `space`, ranked by Expected
    /// Improvement over a sampled candidate pool.
    ///
    /// Without a fit the proposals are plain uniform samples (the bandit-only
    /// fallback shares this path).
    pub fn propose<R: Rng + ?Sized>(
        &self,
        n: usize,
        space: &ConfigSpace,
        rng: &mut R,
    ) -> Vec<Vec<f64>> {
        if n == 0 {
            return Vec::new();
        }
        let pool = self.cfg.candidate_pool.max(n);
        let mut candidates: Vec<Vec<f64>> = (0..pool).map(|_| space.sample(rng)).collect();
        if !self.is_fit() {
            candidates.truncate(n);
            return candidates;
        }
        let mut scored: Vec<(f64, Vec<f64>)> = candidates
            .into_iter()
            .map(|c| (self.expected_improvement(&c), c))
            .collect();
        scored.sort_by(|(a, _), (b, _)| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(n).map(|(_, c)| c).collect()
    }
}

fn normal_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

/// Standard normal CDF via the Abramowitz–Stegun 7.1.26 erf approximation
/// (max absolute error ~1.5e-7, ample for acquisition ranking).
fn normal_cdf(z: f64) -> f64 {
    let x = z / std::f64::consts::SQRT_2;
    let t = 1.0 / (1.0 + 0.3275911 * x.abs());
    let poly = t
        * (0.254829592
            + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    let erf = 1.0 - poly * (-x * x).exp();
    let erf = if x >= 0.0 { erf } else { -erf };
    0.5 * (1.0 + erf)
}
