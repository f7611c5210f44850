//! UCB1 scoring over Welford running statistics.
//!
//! UCB1 is fully determined by the per-arm reward statistics, so unlike the
//! sampling policies it carries no state of its own: selection is a pure
//! function of the [`ArmStats`] map maintained by the selector. This also
//! makes UCB1 deterministic — same stats, same choice.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Running reward statistics for one arm (Welford's online algorithm).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ArmStats {
    /// Number of observed rewards (including pseudo-counts from priors).
    pub pulls: u64,
    /// Running mean reward.
    pub mean: f64,
    /// Welford sum of squared deviations.
    pub m2: f64,
    /// Time of the last update.
    pub last_update: SystemTime,
}

impl Default for ArmStats {
    fn default() -> Self {
        Self {
            pulls: 0,
            mean: 0.0,
            m2: 0.0,
            last_update: SystemTime::UNIX_EPOCH,
        }
    }
}

impl ArmStats {
    /// Fold one reward into the running mean/variance.
    pub fn observe(&mut self, reward: f64) {
        self.pulls += 1;
        let delta = reward - self.mean;
        self.mean += delta / self.pulls as f64;
        let delta2 = reward - self.mean;
        self.m2 += delta * delta2;
        self.last_update = SystemTime::now();
    }

    /// Sample variance of observed rewards (0 with fewer than two pulls).
    pub fn variance(&self) -> f64 {
        if self.pulls < 2 {
            0.0
        } else {
            self.m2 / (self.pulls - 1) as f64
        }
    }

    /// Seed with a transferred prior as `weight` pseudo-observations at
    /// `mean` with the given variance.
    ///
    /// No-op once the arm has real observations: transfer only fills cold
    /// arms, it never overwrites learned statistics.
    pub fn seed(&mut self, mean: f64, variance: f64, weight: u64) {
        if weight == 0 || !mean.is_finite() || self.pulls > 0 {
            return;
        }
        self.pulls = weight;
        self.mean = mean;
        self.m2 = variance.max(0.0) * weight as f64;
        self.last_update = SystemTime::now();
    }
}

/// UCB1 score for one arm: `mean + sqrt(2 ln N / n)`.
///
/// Arms with zero pulls score `+inf`, which forces the cold-start sweep.
pub fn ucb1_score(stats: &ArmStats, total_pulls: u64) -> f64 {
    if stats.pulls == 0 {
        return f64::INFINITY;
    }
    let n = (total_pulls.max(1)) as f64;
    stats.mean + (2.0 * n.ln() / stats.pulls as f64).sqrt()
}

/// Select an arm by UCB1.
///
/// Policy:
/// - Every arm with zero pulls is selected before scores are compared
///   (cold-start sweep); among several untried arms, the lowest arm id wins.
/// - Otherwise: argmax of [`ucb1_score`]. Tie-break: lowest arm id.
pub fn ucb1_select<'a>(
    arms_in_order: &'a [String],
    stats: &BTreeMap<String, ArmStats>,
) -> Option<&'a String> {
    if arms_in_order.is_empty() {
        return None;
    }
    let pulls_of = |a: &String| stats.get(a).map(|s| s.pulls).unwrap_or(0);

    if let Some(untried) = arms_in_order
        .iter()
        .filter(|a| pulls_of(a) == 0)
        .min_by(|a, b| a.cmp(b))
    {
        return Some(untried);
    }

    let total: u64 = arms_in_order.iter().map(pulls_of).sum();
    let mut best: Option<&'a String> = None;
    let mut best_score = f64::NEG_INFINITY;
    for a in arms_in_order {
        let s = stats.get(a).copied().unwrap_or_default();
        let score = ucb1_score(&s, total);
        let better = score > best_score
            || ((score - best_score).abs() <= 1e-12 && best.map(|b| a < b).unwrap_or(true));
        if better {
            best_score = score;
            best = Some(a);
        }
    }
    best
}

/// UCB1 scores for all arms (explain / logging surface).
pub fn ucb1_scores(
    arms_in_order: &[String],
    stats: &BTreeMap<String, ArmStats>,
) -> BTreeMap<String, f64> {
    let total: u64 = arms_in_order
        .iter()
        .map(|a| stats.get(a).map(|s| s.pulls).unwrap_or(0))
        .sum();
    arms_in_order
        .iter()
        .map(|a| {
            let s = stats.get(a).copied().unwrap_or_default();
            (a.clone(), ucb1_score(&s, total))
        })
        .collect()
}
