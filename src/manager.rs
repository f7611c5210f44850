//! Per-session orchestration: selection, execution, recording, learning.
//!
//! A [`PortfolioManager`] ties the components together: the arm [`Registry`]
//! and bound [`Solver`]s, the shared [`OnlineSelector`], per-arm
//! [`GpSurrogate`]s, the [`MetaLearner`], and the append-only
//! [`PerformanceStore`]. Selector and store live behind mutexes shared by
//! every session, so learning accumulates across problems; a manager clone is
//! a handle onto the same shared state.
//!
//! Each session is a round loop driven by a [`SessionBudget`]:
//!
//! ```text
//! Initializing -> (Selecting -> Executing -> Recording)* -> Done
//! ```
//!
//! Initialization transfers meta-learned priors for the new problem.
//! Selecting picks an ensemble of arms and proposes configurations from each
//! arm's surrogate (uniform samples until the surrogate has a fit; on a fit
//! failure the round degrades to the bandit-only path). Executing runs the
//! ensemble under the round deadline. Recording appends every outcome to the
//! store, folds normalized rewards into the selector (terminal runs get the
//! floor reward), and feeds completed runs back into the surrogates. A store
//! outage never stops the loop; the session is merely flagged degraded.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::error::{PortfolioError, Result};
use crate::executor::{ArmTask, EnsembleExecutor, Solver};
use crate::meta::MetaLearner;
use crate::registry::{ConfigSpace, MethodArm, Registry};
use crate::selector::{ArmStatistics, OnlineSelector, RewardRange};
use crate::store::{PerformanceStore, RecordFilter};
use crate::surrogate::{GpConfig, GpSurrogate, SurrogateObservation};
use crate::{ObjectiveSense, ProblemInstance, RunRecord, RunStatus};

/// Maps raw objectives onto the selector's reward scale.
///
/// Implementations must be sense-aware: a better objective maps to a higher
/// reward regardless of [`ObjectiveSense`].
pub trait RewardNormalizer: Send + Sync {
    /// Reward range the selector enforces.
    fn range(&self) -> RewardRange {
        RewardRange::default()
    }

    /// Reward for a completed run with the given raw objective.
    fn normalize(&self, problem: &ProblemInstance, objective: f64) -> f64;

    /// Reward assigned to Failed / TimedOut runs.
    fn floor(&self) -> f64 {
        self.range().lo
    }
}

/// Linear clamp of objectives in `[lo, hi]` onto `[0, 1]`, inverted for
/// minimization problems.
#[derive(Debug, Clone, Copy)]
pub struct LinearNormalizer {
    pub lo: f64,
    pub hi: f64,
}

impl LinearNormalizer {
    pub fn new(lo: f64, hi: f64) -> Self {
        Self { lo, hi }
    }
}

impl RewardNormalizer for LinearNormalizer {
    fn normalize(&self, problem: &ProblemInstance, objective: f64) -> f64 {
        let span = self.hi - self.lo;
        let unit = if span > 0.0 && span.is_finite() {
            ((objective - self.lo) / span).clamp(0.0, 1.0)
        } else {
            0.5
        };
        match problem.sense {
            ObjectiveSense::Maximize => unit,
            ObjectiveSense::Minimize => 1.0 - unit,
        }
    }
}

/// Bridge from a raw domain problem to the engine-facing instance.
///
/// The engine itself only ever sees [`ProblemInstance`]; adapters live at the
/// call site and own domain knowledge (feature encoding, objective sense).
pub trait DomainAdapter: Send + Sync {
    type Problem;

    fn domain(&self) -> &str;

    fn sense(&self) -> ObjectiveSense;

    /// Standardized feature vector for a raw problem.
    fn features(&self, problem: &Self::Problem) -> Vec<f64>;

    /// Engine-facing instance for a raw problem.
    fn instance(&self, id: &str, problem: &Self::Problem) -> ProblemInstance {
        ProblemInstance::new(id, self.domain(), self.features(problem), self.sense())
    }
}

/// How long a session may run: a round count, a wall-clock deadline, or both.
/// At least one bound is required.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionBudget {
    pub rounds: Option<u32>,
    pub deadline: Option<Duration>,
}

impl SessionBudget {
    pub fn rounds(n: u32) -> Self {
        Self {
            rounds: Some(n),
            deadline: None,
        }
    }

    pub fn deadline(d: Duration) -> Self {
        Self {
            rounds: None,
            deadline: Some(d),
        }
    }

    pub fn with_deadline(mut self, d: Duration) -> Self {
        self.deadline = Some(d);
        self
    }

    pub fn validate(&self) -> Result<()> {
        match (self.rounds, self.deadline) {
            (None, None) => Err(PortfolioError::InvalidBudget(
                "neither rounds nor deadline set".to_string(),
            )),
            (Some(0), _) => Err(PortfolioError::InvalidBudget(
                "round budget must be nonzero".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Session lifecycle states, in transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Selecting,
    Executing,
    Recording,
    Done,
}

/// Best completed run seen during a session.
#[derive(Debug, Clone, PartialEq)]
pub struct BestRun {
    pub arm_id: String,
    pub objective: f64,
    pub config: Vec<f64>,
}

/// Terminal summary of one session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: u64,
    pub problem_id: String,
    /// Rounds actually executed.
    pub rounds: u32,
    /// Records appended to the store.
    pub records: u64,
    pub best: Option<BestRun>,
    /// True if the store was unavailable at any point; in-memory learning
    /// still happened.
    pub degraded: bool,
    /// Arms that received a transferred prior at initialization.
    pub transferred_arms: usize,
}

/// Manager-level tuning knobs.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Distinct arms to run concurrently per round.
    pub ensemble_size: usize,
    /// Per-round execution deadline.
    pub round_deadline: Duration,
    /// Surrogate hyperparameters (one surrogate per arm).
    pub gp: GpConfig,
    /// Cross-problem transfer settings.
    pub meta: MetaLearner,
    /// Seed for configuration sampling.
    pub seed: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            ensemble_size: 2,
            round_deadline: Duration::from_secs(5),
            gp: GpConfig::default(),
            meta: MetaLearner::default(),
            seed: 0,
        }
    }
}

struct ManagerInner {
    registry: Mutex<Registry>,
    solvers: Mutex<BTreeMap<String, Arc<dyn Solver>>>,
    selector: Mutex<OnlineSelector>,
    store: Mutex<PerformanceStore>,
    surrogates: Mutex<BTreeMap<String, GpSurrogate>>,
    rng: Mutex<StdRng>,
    normalizer: Arc<dyn RewardNormalizer>,
    cfg: ManagerConfig,
    next_session: AtomicU64,
}

/// Shared-state orchestrator; clones are handles onto the same state.
#[derive(Clone)]
pub struct PortfolioManager {
    inner: Arc<ManagerInner>,
}

// A poisoned lock means a panic elsewhere; the data is still the best
// available truth, so sessions keep going.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn advance(session_id: u64, state: &mut SessionState, next: SessionState) {
    debug!(session_id, from = ?*state, to = ?next, "state transition");
    *state = next;
}

impl PortfolioManager {
    pub fn new(
        registry: Registry,
        selector: OnlineSelector,
        store: PerformanceStore,
        cfg: ManagerConfig,
    ) -> Self {
        Self::with_normalizer(
            registry,
            selector,
            store,
            cfg,
            Arc::new(LinearNormalizer::new(0.0, 1.0)),
        )
    }

    /// The selector's reward range is overwritten by the normalizer's range
    /// so the two can never disagree.
    pub fn with_normalizer(
        registry: Registry,
        selector: OnlineSelector,
        store: PerformanceStore,
        cfg: ManagerConfig,
        normalizer: Arc<dyn RewardNormalizer>,
    ) -> Self {
        let selector = selector.with_reward_range(normalizer.range());
        let seed = cfg.seed;
        Self {
            inner: Arc::new(ManagerInner {
                registry: Mutex::new(registry),
                solvers: Mutex::new(BTreeMap::new()),
                selector: Mutex::new(selector),
                store: Mutex::new(store),
                surrogates: Mutex::new(BTreeMap::new()),
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
                normalizer,
                cfg,
                next_session: AtomicU64::new(0),
            }),
        }
    }

    /// Register an arm and bind its solver in one step.
    pub fn register_arm(&self, arm: MethodArm, solver: Arc<dyn Solver>) -> Result<()> {
        let id = arm.id.clone();
        lock(&self.inner.registry).register(arm)?;
        lock(&self.inner.solvers).insert(id, solver);
        Ok(())
    }

    /// Bind (or replace) the solver behind an already-registered arm.
    pub fn bind_solver(&self, arm_id: &str, solver: Arc<dyn Solver>) -> Result<()> {
        if !lock(&self.inner.registry).contains(arm_id) {
            return Err(PortfolioError::UnknownArm(arm_id.to_string()));
        }
        lock(&self.inner.solvers).insert(arm_id.to_string(), solver);
        Ok(())
    }

    /// Retire an arm from future selection.
    pub fn deregister_arm(&self, arm_id: &str) -> Result<()> {
        lock(&self.inner.registry).deregister(arm_id)
    }

    /// Snapshot of cross-session per-arm statistics.
    pub fn statistics(&self) -> Vec<ArmStatistics> {
        lock(&self.inner.selector).statistics()
    }

    /// Query the performance store.
    pub fn query(&self, filter: &RecordFilter) -> Vec<RunRecord> {
        lock(&self.inner.store).query(filter)
    }

    /// Flush the store's sink, if any.
    pub fn flush(&self) -> Result<()> {
        lock(&self.inner.store).flush()
    }

    /// Run a session on the calling thread.
    pub fn run_session(
        &self,
        problem: &ProblemInstance,
        budget: &SessionBudget,
    ) -> Result<SessionReport> {
        budget.validate()?;
        let session_id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        let mut state = SessionState::Initializing;
        debug!(session_id, problem = %problem.id, ?state, "session start");

        // Initializing: register the instance and transfer priors from its
        // feature-space neighbors.
        let transferred_arms = {
            let normalizer = &self.inner.normalizer;
            let mut store = lock(&self.inner.store);
            store.register_problem(problem.clone());
            let prior = self.inner.cfg.meta.transfer_prior(&store, problem, |r| {
                let p = store.problem(&r.problem_id)?;
                match r.status {
                    RunStatus::Completed => r.objective.map(|o| normalizer.normalize(p, o)),
                    RunStatus::Failed | RunStatus::TimedOut => Some(normalizer.floor()),
                }
            });
            drop(store);

            if !prior.is_empty() {
                lock(&self.inner.selector).seed_priors(&prior);
                let mut surrogates = lock(&self.inner.surrogates);
                for (arm, p) in &prior.priors {
                    surrogates
                        .entry(arm.clone())
                        .or_insert_with(|| GpSurrogate::new(self.inner.cfg.gp))
                        .set_prior_mean(p.mean);
                }
                info!(
                    session_id,
                    arms = prior.priors.len(),
                    neighbors = prior.neighbors_used,
                    "transferred priors"
                );
            }
            prior.priors.len()
        };

        let started = Instant::now();
        let mut rounds = 0u32;
        let mut records = 0u64;
        let mut degraded = false;
        let mut best: Option<BestRun> = None;

        loop {
            if let Some(max) = budget.rounds {
                if rounds >= max {
                    break;
                }
            }
            let remaining = budget.deadline.map(|d| d.saturating_sub(started.elapsed()));
            if let Some(rem) = remaining {
                if rem < Duration::from_millis(1) {
                    break;
                }
            }

            advance(session_id, &mut state, SessionState::Selecting);
            let (arms, spaces) = {
                let registry = lock(&self.inner.registry);
                let arms = registry.arms_in_order();
                let spaces: BTreeMap<String, ConfigSpace> = arms
                    .iter()
                    .filter_map(|id| registry.get(id).map(|a| (id.clone(), a.space.clone())))
                    .collect();
                (arms, spaces)
            };
            if arms.is_empty() {
                return Err(PortfolioError::EmptyPortfolio);
            }

            let mut decisions = lock(&self.inner.selector)
                .select_k(&arms, self.inner.cfg.ensemble_size.max(1));
            // Dispatch in registration order; exact-tie votes in the
            // executor then resolve by it.
            decisions.sort_by_key(|d| arms.iter().position(|a| a == &d.chosen));
            let mut tasks = Vec::with_capacity(decisions.len());
            {
                let solvers = lock(&self.inner.solvers);
                let mut surrogates = lock(&self.inner.surrogates);
                let mut rng = lock(&self.inner.rng);
                for d in &decisions {
                    let Some(solver) = solvers.get(&d.chosen) else {
                        return Err(PortfolioError::SessionFailure(format!(
                            "no solver bound for arm '{}'",
                            d.chosen
                        )));
                    };
                    let space = spaces.get(&d.chosen).cloned().unwrap_or_default();
                    let surrogate = surrogates
                        .entry(d.chosen.clone())
                        .or_insert_with(|| GpSurrogate::new(self.inner.cfg.gp));
                    if !surrogate.is_fit() && !surrogate.observations().is_empty() {
                        if let Err(err) = surrogate.fit() {
                            // Bandit-only round: proposals below degrade to
                            // uniform samples.
                            warn!(session_id, arm = %d.chosen, %err, "surrogate fit failed");
                        }
                    }
                    let config = surrogate
                        .propose(1, &space, &mut *rng)
                        .pop()
                        .unwrap_or_default();
                    tasks.push(ArmTask {
                        arm_id: d.chosen.clone(),
                        config,
                        solver: Arc::clone(solver),
                    });
                }
            }

            advance(session_id, &mut state, SessionState::Executing);
            let deadline = match remaining {
                Some(rem) => self.inner.cfg.round_deadline.min(rem),
                None => self.inner.cfg.round_deadline,
            };
            let result = EnsembleExecutor::new(deadline).run(problem, tasks);
            debug!(
                session_id,
                round = rounds,
                winner = result.winner.as_deref().unwrap_or("-"),
                "round executed"
            );

            advance(session_id, &mut state, SessionState::Recording);
            for outcome in &result.outcomes {
                match lock(&self.inner.store).record(outcome.to_record(&problem.id)) {
                    Ok(_) => records += 1,
                    Err(PortfolioError::StoreUnavailable(reason)) => {
                        // In-memory log still holds the record.
                        records += 1;
                        if !degraded {
                            warn!(session_id, %reason, "store degraded");
                        }
                        degraded = true;
                    }
                    Err(err) => return Err(err),
                }

                let range = self.inner.normalizer.range();
                let reward = match (outcome.status, outcome.objective) {
                    (RunStatus::Completed, Some(objective)) => self
                        .inner
                        .normalizer
                        .normalize(problem, objective)
                        .clamp(range.lo, range.hi),
                    _ => self.inner.normalizer.floor(),
                };
                lock(&self.inner.selector).update(&outcome.arm_id, reward)?;

                if let (RunStatus::Completed, Some(objective)) =
                    (outcome.status, outcome.objective)
                {
                    lock(&self.inner.surrogates)
                        .entry(outcome.arm_id.clone())
                        .or_insert_with(|| GpSurrogate::new(self.inner.cfg.gp))
                        .observe(SurrogateObservation {
                            config: outcome.config.clone(),
                            performance: reward,
                            problem_id: problem.id.clone(),
                        });

                    let improved = match &best {
                        None => true,
                        Some(b) => problem.sense.better(objective, b.objective),
                    };
                    if improved {
                        best = Some(BestRun {
                            arm_id: outcome.arm_id.clone(),
                            objective,
                            config: outcome.config.clone(),
                        });
                    }
                }
            }
            rounds += 1;
        }

        advance(session_id, &mut state, SessionState::Done);
        if let Err(PortfolioError::StoreUnavailable(_)) = lock(&self.inner.store).flush() {
            degraded = true;
        }
        info!(
            session_id,
            problem = %problem.id,
            rounds,
            records,
            degraded,
            best_arm = best.as_ref().map(|b| b.arm_id.as_str()).unwrap_or("-"),
            ?state,
            "session complete"
        );
        Ok(SessionReport {
            session_id,
            problem_id: problem.id.clone(),
            rounds,
            records,
            best,
            degraded,
            transferred_arms,
        })
    }

    /// Run a session on a background thread.
    pub fn submit(&self, problem: ProblemInstance, budget: SessionBudget) -> SessionHandle {
        let mgr = self.clone();
        let thread = thread::Builder::new()
            .name(format!("quiver-session-{}", problem.id))
            .spawn(move || mgr.run_session(&problem, &budget))
            .ok();
        SessionHandle { thread }
    }
}

/// Handle onto a background session.
pub struct SessionHandle {
    thread: Option<thread::JoinHandle<Result<SessionReport>>>,
}

impl SessionHandle {
    /// True once the session has terminated (successfully or not).
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }

    /// Non-blocking peek: the report once the session has finished, `None`
    /// while it is still running. Consumes the report on success.
    pub fn try_result(&mut self) -> Option<Result<SessionReport>> {
        match &self.thread {
            Some(thread) if !thread.is_finished() => None,
            Some(_) => {
                let thread = self.thread.take()?;
                Some(thread.join().unwrap_or_else(|_| {
                    Err(PortfolioError::SessionFailure(
                        "session thread panicked".to_string(),
                    ))
                }))
            }
            None => Some(Err(PortfolioError::SessionFailure(
                "session thread could not be spawned".to_string(),
            ))),
        }
    }

    /// Wait for the session and take its report.
    pub fn join(mut self) -> Result<SessionReport> {
        match self.thread.take() {
            Some(thread) => thread.join().unwrap_or_else(|_| {
                Err(PortfolioError::SessionFailure(
                    "session thread panicked".to_string(),
                ))
            }),
            None => Err(PortfolioError::SessionFailure(
                "session thread could not be spawned".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CancelToken, SolverOutput};
    use crate::registry::ParamSpec;

    struct Fixed {
        objective: f64,
    }

    impl Solver for Fixed {
        fn solve(
            &self,
            _problem: &ProblemInstance,
            _config: &[f64],
            _cancel: &CancelToken,
        ) -> Result<SolverOutput> {
            Ok(SolverOutput::new(self.objective))
        }
    }

    struct AlwaysFails;

    impl Solver for AlwaysFails {
        fn solve(
            &self,
            _problem: &ProblemInstance,
            _config: &[f64],
            _cancel: &CancelToken,
        ) -> Result<SolverOutput> {
            Err(PortfolioError::MethodExecutionFailure {
                arm: "bad".to_string(),
                reason: "synthetic".to_string(),
            })
        }
    }

    fn arm(id: &str) -> MethodArm {
        MethodArm::new(
            id,
            id,
            ConfigSpace::new(vec![ParamSpec::continuous("x", 0.0, 1.0)]),
        )
    }

    fn manager() -> PortfolioManager {
        let mgr = PortfolioManager::new(
            Registry::new(),
            OnlineSelector::ucb1(),
            PerformanceStore::in_memory(),
            ManagerConfig {
                round_deadline: Duration::from_millis(500),
                ..ManagerConfig::default()
            },
        );
        mgr.register_arm(arm("good"), Arc::new(Fixed { objective: 0.9 }))
            .unwrap();
        mgr.register_arm(arm("bad"), Arc::new(AlwaysFails)).unwrap();
        mgr
    }

    fn maximize(id: &str) -> ProblemInstance {
        ProblemInstance::new(id, "test", vec![1.0, 0.0], ObjectiveSense::Maximize)
    }

    #[test]
    fn budget_requires_some_bound() {
        assert!(matches!(
            SessionBudget::default().validate(),
            Err(PortfolioError::InvalidBudget(_))
        ));
        assert!(matches!(
            SessionBudget::rounds(0).validate(),
            Err(PortfolioError::InvalidBudget(_))
        ));
        assert!(SessionBudget::rounds(3).validate().is_ok());
        assert!(SessionBudget::deadline(Duration::from_secs(1)).validate().is_ok());
    }

    #[test]
    fn round_budget_runs_exactly_that_many_rounds() {
        let mgr = manager();
        let report = mgr
            .run_session(&maximize("p1"), &SessionBudget::rounds(4))
            .unwrap();
        assert_eq!(report.rounds, 4);
        // ensemble_size 2 over 2 arms: both run every round.
        assert_eq!(report.records, 8);
        assert_eq!(mgr.query(&RecordFilter::default()).len(), 8);
    }

    #[test]
    fn failures_floor_the_reward_and_best_comes_from_completions() {
        let mgr = manager();
        let report = mgr
            .run_session(&maximize("p1"), &SessionBudget::rounds(5))
            .unwrap();
        let best = report.best.unwrap();
        assert_eq!(best.arm_id, "good");
        assert!((best.objective - 0.9).abs() < 1e-12);

        let stats = mgr.statistics();
        let bad = stats.iter().find(|s| s.arm_id == "bad").unwrap();
        let good = stats.iter().find(|s| s.arm_id == "good").unwrap();
        assert_eq!(bad.mean_reward, 0.0);
        assert!(good.mean_reward > 0.8);
    }

    #[test]
    fn empty_portfolio_is_an_error() {
        let mgr = PortfolioManager::new(
            Registry::new(),
            OnlineSelector::ucb1(),
            PerformanceStore::in_memory(),
            ManagerConfig::default(),
        );
        assert!(matches!(
            mgr.run_session(&maximize("p1"), &SessionBudget::rounds(1)),
            Err(PortfolioError::EmptyPortfolio)
        ));
    }

    #[test]
    fn minimize_sense_inverts_rewards() {
        let mgr = PortfolioManager::new(
            Registry::new(),
            OnlineSelector::ucb1(),
            PerformanceStore::in_memory(),
            ManagerConfig {
                ensemble_size: 2,
                ..ManagerConfig::default()
            },
        );
        mgr.register_arm(arm("low"), Arc::new(Fixed { objective: 0.1 }))
            .unwrap();
        mgr.register_arm(arm("high"), Arc::new(Fixed { objective: 0.8 }))
            .unwrap();
        let problem = ProblemInstance::new("p", "test", vec![1.0], ObjectiveSense::Minimize);
        let report = mgr.run_session(&problem, &SessionBudget::rounds(3)).unwrap();
        assert_eq!(report.best.unwrap().arm_id, "low");

        let stats = mgr.statistics();
        let low = stats.iter().find(|s| s.arm_id == "low").unwrap();
        let high = stats.iter().find(|s| s.arm_id == "high").unwrap();
        assert!(low.mean_reward > high.mean_reward);
    }

    #[test]
    fn second_session_gets_transferred_priors() {
        let mgr = manager();
        mgr.run_session(&maximize("p1"), &SessionBudget::rounds(3))
            .unwrap();
        let report = mgr
            .run_session(&maximize("p2"), &SessionBudget::rounds(1))
            .unwrap();
        assert!(report.transferred_arms > 0, "no priors transferred");
    }

    #[test]
    fn deadline_budget_terminates() {
        let mgr = manager();
        let started = Instant::now();
        let report = mgr
            .run_session(
                &maximize("p1"),
                &SessionBudget::deadline(Duration::from_millis(200)),
            )
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(report.rounds >= 1);
    }

    #[test]
    fn submit_runs_in_the_background() {
        let mgr = manager();
        let handle = mgr.submit(maximize("p1"), SessionBudget::rounds(2));
        let report = handle.join().unwrap();
        assert_eq!(report.rounds, 2);
    }

    #[test]
    fn unknown_solver_binding_is_rejected() {
        let mgr = manager();
        assert!(matches!(
            mgr.bind_solver("nope", Arc::new(Fixed { objective: 0.0 })),
            Err(PortfolioError::UnknownArm(_))
        ));
    }
}
