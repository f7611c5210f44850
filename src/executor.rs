//! Concurrent ensemble execution of several arms on one problem.
//!
//! Each selected arm runs on its own thread under a shared deadline and a
//! cooperative [`CancelToken`]. When the deadline fires, the token is
//! cancelled and the executor drains a short grace window for cooperative
//! solvers to surface their best-so-far; anything still running after that is
//! detached and reported as `TimedOut`. A solver error or panic becomes a
//! `Failed` outcome for that arm only — the ensemble never aborts.
//!
//! Winner vote: best finite objective among `Completed` outcomes under the
//! problem's [`ObjectiveSense`], ties broken by earliest completion, then by
//! task order. Callers that need arm-registration-order tie-breaks submit
//! their tasks in registration order, as the portfolio manager does.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{PortfolioError, Result};
use crate::{ObjectiveSense, ProblemInstance, RunRecord, RunStatus};

/// Cooperative cancellation handle shared between the executor and solvers.
///
/// Solvers are expected to call [`CancelToken::checkpoint`] at convenient
/// points (once per outer iteration is plenty) and unwind when it errors.
#[derive(Debug, Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new(deadline: Option<Duration>) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: deadline.map(|d| Instant::now() + d),
        }
    }

    /// Request cancellation of every holder of this token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// True once cancelled or past the deadline.
    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fails with [`PortfolioError::TimedOut`] once the token is cancelled.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PortfolioError::TimedOut("cancelled".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Output of a successful solver run.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverOutput {
    /// Objective value achieved, in the problem's native sense.
    pub objective: f64,
    /// Optional solution payload for the caller; the engine never inspects it.
    pub solution: Option<Vec<f64>>,
}

impl SolverOutput {
    pub fn new(objective: f64) -> Self {
        Self {
            objective,
            solution: None,
        }
    }
}

/// The contract an arm's implementation fulfills.
///
/// Implementations should honor `cancel` cooperatively; returning `Ok` with a
/// best-so-far objective after cancellation is preferred over erroring.
pub trait Solver: Send + Sync {
    fn solve(
        &self,
        problem: &ProblemInstance,
        config: &[f64],
        cancel: &CancelToken,
    ) -> Result<SolverOutput>;
}

/// One arm scheduled into an ensemble round.
#[derive(Clone)]
pub struct ArmTask {
    pub arm_id: String,
    pub config: Vec<f64>,
    pub solver: Arc<dyn Solver>,
}

/// Terminal outcome of one arm in an ensemble round.
#[derive(Debug, Clone, PartialEq)]
pub struct ArmOutcome {
    pub arm_id: String,
    pub config: Vec<f64>,
    pub status: RunStatus,
    /// Present only for `Completed` outcomes.
    pub objective: Option<f64>,
    pub elapsed: Duration,
}

impl ArmOutcome {
    /// Convert to the store's record form.
    pub fn to_record(&self, problem_id: &str) -> RunRecord {
        match (self.status, self.objective) {
            (RunStatus::Completed, Some(objective)) => RunRecord::completed(
                problem_id,
                &self.arm_id,
                self.config.clone(),
                objective,
                self.elapsed,
            ),
            _ => RunRecord::terminal(
                problem_id,
                &self.arm_id,
                self.config.clone(),
                self.status,
                self.elapsed,
            ),
        }
    }
}

/// Result of one ensemble round: every arm's outcome plus the vote.
#[derive(Debug, Clone)]
pub struct EnsembleResult {
    /// Outcomes in task order.
    pub outcomes: Vec<ArmOutcome>,
    /// Winning arm id, absent when no arm completed.
    pub winner: Option<String>,
    /// Mean objective across completed outcomes, absent when none completed.
    pub aggregate: Option<f64>,
    /// Overall round status: `Completed` when at least one arm completed,
    /// `Failed` otherwise.
    pub status: RunStatus,
}

impl EnsembleResult {
    pub fn winner_outcome(&self) -> Option<&ArmOutcome> {
        let winner = self.winner.as_deref()?;
        self.outcomes.iter().find(|o| o.arm_id == winner)
    }
}

/// Runs arm ensembles under a shared deadline.
#[derive(Debug, Clone)]
pub struct EnsembleExecutor {
    deadline: Duration,
    /// Drain window after cancellation for cooperative solvers to report.
    grace: Duration,
}

impl EnsembleExecutor {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            grace: Duration::from_millis(50),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Run all `tasks` on `problem` concurrently and vote on a winner.
    pub fn run(&self, problem: &ProblemInstance, tasks: Vec<ArmTask>) -> EnsembleResult {
        if tasks.is_empty() {
            return EnsembleResult {
                outcomes: Vec::new(),
                winner: None,
                aggregate: None,
                status: RunStatus::Failed,
            };
        }

        let token = CancelToken::new(Some(self.deadline));
        let problem = Arc::new(problem.clone());
        let (tx, rx) = mpsc::channel::<(usize, Result<SolverOutput>, Duration, Instant)>();

        for (idx, task) in tasks.iter().enumerate() {
            let tx = tx.clone();
            let token = token.clone();
            let problem = Arc::clone(&problem);
            let solver = Arc::clone(&task.solver);
            let config = task.config.clone();
            let arm_id = task.arm_id.clone();
            thread::Builder::new()
                .name(format!("quiver-arm-{arm_id}"))
                .spawn(move || {
                    let start = Instant::now();
                    let result = solver.solve(&problem, &config, &token);
                    // The receiver may already have moved on; that is fine.
                    let _ = tx.send((idx, result, start.elapsed(), Instant::now()));
                })
                .ok();
        }
        drop(tx);

        let mut reported: Vec<Option<(Result<SolverOutput>, Duration, Instant)>> =
            (0..tasks.len()).map(|_| None).collect();
        let started = Instant::now();
        let mut pending = tasks.len();

        // Phase 1: collect until the deadline.
        while pending > 0 {
            let remaining = self.deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok((idx, result, elapsed, finished)) => {
                    reported[idx] = Some((result, elapsed, finished));
                    pending -= 1;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => break,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        // Phase 2: cancel stragglers and drain the grace window.
        if pending > 0 {
            token.cancel();
            let grace_end = Instant::now() + self.grace;
            while pending > 0 {
                let left = grace_end.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    break;
                }
                match rx.recv_timeout(left) {
                    Ok((idx, result, elapsed, finished)) => {
                        reported[idx] = Some((result, elapsed, finished));
                        pending -= 1;
                    }
                    Err(_) => break,
                }
            }
        }
        // Anything still running is detached; its send lands on a dead channel.

        let total = started.elapsed();
        // Completion instants feed the tie-break.
        let finished_at: Vec<Option<Instant>> = reported
            .iter()
            .map(|r| r.as_ref().map(|(_, _, at)| *at))
            .collect();
        let outcomes: Vec<ArmOutcome> = tasks
            .iter()
            .enumerate()
            .map(|(idx, task)| match reported[idx].take() {
                Some((Ok(output), elapsed, _)) if output.objective.is_finite() => ArmOutcome {
                    arm_id: task.arm_id.clone(),
                    config: task.config.clone(),
                    status: RunStatus::Completed,
                    objective: Some(output.objective),
                    elapsed,
                },
                Some((Ok(output), elapsed, _)) => {
                    warn!(arm = %task.arm_id, objective = output.objective, "non-finite objective treated as failure");
                    ArmOutcome {
                        arm_id: task.arm_id.clone(),
                        config: task.config.clone(),
                        status: RunStatus::Failed,
                        objective: None,
                        elapsed,
                    }
                }
                Some((Err(PortfolioError::TimedOut(_)), elapsed, _)) => ArmOutcome {
                    arm_id: task.arm_id.clone(),
                    config: task.config.clone(),
                    status: RunStatus::TimedOut,
                    objective: None,
                    elapsed,
                },
                Some((Err(err), elapsed, _)) => {
                    debug!(arm = %task.arm_id, %err, "arm failed");
                    ArmOutcome {
                        arm_id: task.arm_id.clone(),
                        config: task.config.clone(),
                        status: RunStatus::Failed,
                        objective: None,
                        elapsed,
                    }
                }
                None => {
                    warn!(arm = %task.arm_id, "arm missed the deadline and was detached");
                    ArmOutcome {
                        arm_id: task.arm_id.clone(),
                        config: task.config.clone(),
                        status: RunStatus::TimedOut,
                        objective: None,
                        elapsed: total,
                    }
                }
            })
            .collect();

        // Vote in task order: the challenger must displace the incumbent by
        // a strictly better objective or, on an exact tie, by finishing
        // earlier. A tie in both keeps the incumbent, so task order decides.
        let mut winner: Option<(usize, f64, Instant)> = None;
        for (idx, candidate) in outcomes.iter().enumerate() {
            let (RunStatus::Completed, Some(objective), Some(at)) =
                (candidate.status, candidate.objective, finished_at[idx])
            else {
                continue;
            };
            match winner {
                None => winner = Some((idx, objective, at)),
                Some((_, best, best_at)) => {
                    if displaces(problem.sense, (objective, at), (best, best_at)) {
                        winner = Some((idx, objective, at));
                    }
                }
            }
        }

        let completed: Vec<f64> = outcomes.iter().filter_map(|o| o.objective).collect();
        let aggregate = if completed.is_empty() {
            None
        } else {
            Some(completed.iter().sum::<f64>() / completed.len() as f64)
        };
        let status = if completed.is_empty() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        EnsembleResult {
            winner: winner.map(|(idx, _, _)| outcomes[idx].arm_id.clone()),
            outcomes,
            aggregate,
            status,
        }
    }
}

/// Whether a challenger outcome `(objective, finished_at)` beats the
/// incumbent: strictly better objective first, then earlier completion.
fn displaces(
    sense: ObjectiveSense,
    challenger: (f64, Instant),
    incumbent: (f64, Instant),
) -> bool {
    if challenger.0 == incumbent.0 {
        challenger.1 < incumbent.1
    } else {
        sense.better(challenger.0, incumbent.0)
    }
}
