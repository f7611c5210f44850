//! Cross-problem knowledge transfer.
//!
//! A brand-new problem has no per-arm statistics, so the first few rounds of
//! a session would otherwise be uniform-random. The meta-learner looks up
//! the k most similar historical problems in the performance store and
//! converts their realized rewards into per-arm pseudo-count priors, which
//! seed both the online selector and the surrogate's prior mean.
//!
//! Transfer is strictly best-effort: with fewer than the minimum neighbor
//! count (or no usable records), the result is an **empty** prior — never an
//! error.

use std::collections::BTreeMap;

use tracing::debug;

use crate::store::{PerformanceStore, RecordFilter};
use crate::{ProblemInstance, RunRecord};

/// Transferred prior for one arm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArmPrior {
    /// Similarity-weighted mean reward on neighboring problems.
    pub mean: f64,
    /// Similarity-weighted reward variance.
    pub variance: f64,
    /// Prior strength in pseudo-observations.
    pub weight: f64,
}

/// Per-arm priors transferred from neighboring problems.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightedPriorSet {
    pub priors: BTreeMap<String, ArmPrior>,
    /// How many neighbors contributed.
    pub neighbors_used: usize,
}

impl WeightedPriorSet {
    pub fn is_empty(&self) -> bool {
        self.priors.is_empty()
    }
}

/// Configuration-light meta-learner over the performance store.
#[derive(Debug, Clone, Copy)]
pub struct MetaLearner {
    /// Number of nearest historical problems to consult.
    pub k: usize,
    /// Below this many usable neighbors, no transfer happens.
    pub min_neighbors: usize,
    /// Neighbors at or below this similarity are ignored.
    pub min_similarity: f64,
    /// Prior strength at similarity 1.0, in pseudo-observations.
    pub prior_weight: f64,
}

impl Default for MetaLearner {
    fn default() -> Self {
        Self {
            k: 5,
            min_neighbors: 1,
            min_similarity: 0.0,
            prior_weight: 10.0,
        }
    }
}

impl MetaLearner {
    /// Build per-arm priors for `problem` from its feature-space neighbors.
    ///
    /// `reward_of` maps a historical record to the reward scale the selector
    /// uses (the manager passes its normalizer; terminal records map to the
    /// floor). Records yielding `None` are skipped.
    pub fn transfer_prior<F>(
        &self,
        store: &PerformanceStore,
        problem: &ProblemInstance,
        reward_of: F,
    ) -> WeightedPriorSet
    where
        F: Fn(&RunRecord) -> Option<f64>,
    {
        // Over-fetch by one so the problem's own entry can be dropped.
        let neighbors: Vec<_> = store
            .nearest_neighbors(&problem.features, self.k + 1)
            .into_iter()
            .filter(|(p, sim)| p.id != problem.id && *sim > self.min_similarity)
            .take(self.k)
            .collect();

        if neighbors.len() < self.min_neighbors.max(1) {
            return WeightedPriorSet::default();
        }

        // Similarity-weighted moments per arm across all neighbor records.
        struct Acc {
            w_sum: f64,
            mean: f64,
            m2: f64,
        }
        let mut accs: BTreeMap<String, Acc> = BTreeMap::new();
        let mut neighbors_used = 0usize;

        for (neighbor, sim) in &neighbors {
            let sim = *sim;
            let records = store.query(&RecordFilter::problem(&neighbor.id));
            let mut contributed = false;
            for record in &records {
                let Some(reward) = reward_of(record) else {
                    continue;
                };
                if !reward.is_finite() {
                    continue;
                }
                contributed = true;
                let acc = accs.entry(record.arm_id.clone()).or_insert(Acc {
                    w_sum: 0.0,
                    mean: 0.0,
                    m2: 0.0,
                });
                // Weighted Welford update.
                acc.w_sum += sim;
                let delta = reward - acc.mean;
                acc.mean += delta * sim / acc.w_sum;
                acc.m2 += sim * delta * (reward - acc.mean);
            }
            if contributed {
                neighbors_used += 1;
            }
        }

        if neighbors_used < self.min_neighbors.max(1) {
            return WeightedPriorSet::default();
        }

        let priors: BTreeMap<String, ArmPrior> = accs
            .into_iter()
            .filter(|(_, acc)| acc.w_sum > 0.0)
            .map(|(arm, acc)| {
                let variance = if acc.w_sum > 0.0 { acc.m2 / acc.w_sum } else { 0.0 };
                (
                    arm,
                    ArmPrior {
                        mean: acc.mean,
                        variance: variance.max(0.0),
                        weight: self.prior_weight * (acc.w_sum / neighbors.len() as f64).min(1.0),
                    },
                )
            })
            .collect();

        debug!(
            problem = %problem.id,
            neighbors_used,
            arms = priors.len(),
            "transferred prior"
        );
        WeightedPriorSet {
            priors,
            neighbors_used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ObjectiveSense, RunStatus};
    use std::time::Duration;

    fn reward_of(record: &RunRecord) -> Option<f64> {
        match record.status {
            RunStatus::Completed => record.objective,
            _ => Some(0.0),
        }
    }

    fn problem(id: &str, features: Vec<f64>) -> ProblemInstance {
        ProblemInstance::new(id, "qap", features, ObjectiveSense::Maximize)
    }

    fn store_with_history() -> PerformanceStore {
        let mut store = PerformanceStore::in_memory();
        store.register_problem(problem("old1", vec![1.0, 0.0]));
        store.register_problem(problem("old2", vec![0.9, 0.1]));
        for _ in 0..5 {
            store
                .record(RunRecord::completed("old1", "sa", vec![], 0.8, Duration::ZERO))
                .unwrap();
            store
                .record(RunRecord::completed("old1", "ga", vec![], 0.3, Duration::ZERO))
                .unwrap();
            store
                .record(RunRecord::completed("old2", "sa", vec![], 0.7, Duration::ZERO))
                .unwrap();
        }
        store
    }

    #[test]
    fn zero_neighbors_yields_empty_prior_not_error() {
        let store = PerformanceStore::in_memory();
        let prior = MetaLearner::default().transfer_prior(
            &store,
            &problem("new", vec![1.0, 0.0]),
            reward_of,
        );
        assert!(prior.is_empty());
        assert_eq!(prior.neighbors_used, 0);
    }

    #[test]
    fn transfer_weights_similar_problems() {
        let store = store_with_history();
        let prior = MetaLearner::default().transfer_prior(
            &store,
            &problem("new", vec![1.0, 0.05]),
            reward_of,
        );
        assert!(!prior.is_empty());
        assert_eq!(prior.neighbors_used, 2);

        let sa = prior.priors.get("sa").unwrap();
        let ga = prior.priors.get("ga").unwrap();
        assert!(sa.mean > ga.mean, "sa prior {} ga prior {}", sa.mean, ga.mean);
        // Weighted mean of 0.8 and 0.7 lands between them.
        assert!(sa.mean > 0.7 && sa.mean < 0.8, "sa mean {}", sa.mean);
        assert!(sa.weight > 0.0);
    }

    #[test]
    fn own_problem_is_excluded_from_neighbors() {
        let mut store = store_with_history();
        let me = problem("me", vec![1.0, 0.0]);
        store.register_problem(me.clone());
        store
            .record(RunRecord::completed("me", "sa", vec![], 0.0, Duration::ZERO))
            .unwrap();

        let prior = MetaLearner::default().transfer_prior(&store, &me, reward_of);
        // Own perfect-similarity record must not drag the sa prior to 0.
        let sa = prior.priors.get("sa").unwrap();
        assert!(sa.mean > 0.5, "own records leaked into prior: {}", sa.mean);
    }

    #[test]
    fn min_neighbors_gate_suppresses_transfer() {
        let store = store_with_history();
        let learner = MetaLearner {
            min_neighbors: 3,
            ..MetaLearner::default()
        };
        let prior = learner.transfer_prior(&store, &problem("new", vec![1.0, 0.05]), reward_of);
        assert!(prior.is_empty());
    }

    #[test]
    fn terminal_records_contribute_floor_reward() {
        let mut store = PerformanceStore::in_memory();
        store.register_problem(problem("old", vec![1.0, 0.0]));
        for _ in 0..4 {
            store
                .record(RunRecord::terminal(
                    "old",
                    "flaky",
                    vec![],
                    RunStatus::Failed,
                    Duration::ZERO,
                ))
                .unwrap();
        }
        let prior = MetaLearner::default().transfer_prior(
            &store,
            &problem("new", vec![0.9, 0.1]),
            reward_of,
        );
        let flaky = prior.priors.get("flaky").unwrap();
        assert_eq!(flaky.mean, 0.0, "failures must transfer as floor reward");
    }
}
