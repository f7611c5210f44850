//! `quiver`: adaptive algorithm-portfolio selection over pluggable solver arms.
//!
//! Designed for "which method should I run on this problem" loops: you have a
//! registered set of candidate optimization methods ("arms" — simulated
//! annealing, genetic search, ant colony, anything behind the [`Solver`]
//! contract), a stream of problem instances, and a budget. `quiver` decides
//! which arm(s) to run, with what configuration, learns from every outcome,
//! and transfers what it learned to the next problem.
//!
//! **Goals:**
//! - **Deterministic by default**: every stochastic component is seedable,
//!   and default construction uses a fixed seed.
//! - **Learning at three ranges**: online bandit policies within a session,
//!   a Gaussian-process surrogate over each arm's configuration space, and
//!   meta-learned priors across problems (feature-space neighbors).
//! - **Failure is signal**: a solver crash or timeout becomes a recorded
//!   outcome with a floor reward, never an aborted session.
//! - **Small K**: designed for 2–10 arms; not intended for K in the hundreds.
//!
//! **Selection policies** ([`OnlineSelector`]):
//! - UCB1: deterministic, driven by Welford running statistics.
//! - [`ThompsonSampling`]: seedable, Beta or Normal-Inverse-Gamma posteriors.
//! - [`Exp3`]: seedable EXP3 for adversarial / fast-shifting rewards.
//!
//! **Modeling:**
//! - [`GpSurrogate`]: GP regression over (configuration → performance), with
//!   Expected-Improvement proposals for untried configurations.
//! - [`MetaLearner`]: similarity-weighted priors from historical runs on
//!   neighboring problems, seeded into the selector and the surrogate.
//!
//! **Execution:**
//! - [`EnsembleExecutor`]: runs several arms concurrently under a shared
//!   deadline with cooperative cancellation, then votes on a winner.
//! - [`PortfolioManager`]: the per-session orchestrator tying all of the
//!   above together, with shared cross-session statistics and an append-only
//!   [`PerformanceStore`].
//!
//! **Non-goals:**
//! - No metaheuristic internals: solvers are opaque collaborators.
//! - Not a serving platform (no dashboards, no storage engines beyond the
//!   JSONL record sink).

#![forbid(unsafe_code)]

mod error;
pub use error::*;

mod decision;
pub use decision::*;

mod registry;
pub use registry::*;

mod features;
pub use features::*;

mod store;
pub use store::*;

mod ucb;
pub use ucb::*;

#[cfg(feature = "stochastic")]
mod thompson;
#[cfg(feature = "stochastic")]
pub use thompson::*;

#[cfg(feature = "stochastic")]
mod exp3;
#[cfg(feature = "stochastic")]
pub use exp3::*;

mod selector;
pub use selector::*;

mod surrogate;
pub use surrogate::*;

mod meta;
pub use meta::*;

mod executor;
pub use executor::*;

mod manager;
pub use manager::*;

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Whether lower or higher objective values are better for a problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ObjectiveSense {
    #[default]
    Minimize,
    Maximize,
}

impl ObjectiveSense {
    /// True if `a` is a strictly better objective than `b` under this sense.
    pub fn better(&self, a: f64, b: f64) -> bool {
        match self {
            ObjectiveSense::Minimize => a < b,
            ObjectiveSense::Maximize => a > b,
        }
    }
}

/// An immutable optimization problem instance.
///
/// Created once per incoming problem; never mutated. The feature vector is
/// the standardized numeric form produced by a domain adapter (or a
/// [`FeatureExtractor`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemInstance {
    /// Stable identifier.
    pub id: String,
    /// Domain tag (e.g. "qap", "routing").
    pub domain: String,
    /// Fixed-length numeric feature vector.
    pub features: Vec<f64>,
    /// Optional free-form metadata.
    pub metadata: BTreeMap<String, String>,
    /// Objective direction.
    pub sense: ObjectiveSense,
}

impl ProblemInstance {
    pub fn new(id: &str, domain: &str, features: Vec<f64>, sense: ObjectiveSense) -> Self {
        Self {
            id: id.to_string(),
            domain: domain.to_string(),
            features,
            metadata: BTreeMap::new(),
            sense,
        }
    }
}

/// Terminal status of one arm execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Completed,
    Failed,
    TimedOut,
}

/// One run outcome: written exactly once, immutable thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub problem_id: String,
    pub arm_id: String,
    /// Configuration vector the arm ran with.
    pub config: Vec<f64>,
    /// Objective value achieved (`None` for Failed / TimedOut runs).
    pub objective: Option<f64>,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
    pub status: RunStatus,
    pub timestamp: SystemTime,
}

impl RunRecord {
    /// A completed run with an objective value.
    pub fn completed(
        problem_id: &str,
        arm_id: &str,
        config: Vec<f64>,
        objective: f64,
        elapsed: Duration,
    ) -> Self {
        Self {
            problem_id: problem_id.to_string(),
            arm_id: arm_id.to_string(),
            config,
            objective: Some(objective),
            elapsed,
            status: RunStatus::Completed,
            timestamp: SystemTime::now(),
        }
    }

    /// A terminal Failed / TimedOut run (no objective).
    pub fn terminal(
        problem_id: &str,
        arm_id: &str,
        config: Vec<f64>,
        status: RunStatus,
        elapsed: Duration,
    ) -> Self {
        Self {
            problem_id: problem_id.to_string(),
            arm_id: arm_id.to_string(),
            config,
            objective: None,
            elapsed,
            status,
            timestamp: SystemTime::now(),
        }
    }
}
