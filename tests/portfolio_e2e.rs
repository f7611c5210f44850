//! End-to-end portfolio sessions: adapter in, reports and durable records out.

use std::sync::Arc;
use std::time::Duration;

use quiver::{
    read_jsonl, CancelToken, ConfigSpace, DomainAdapter, JsonlSink, ManagerConfig, MethodArm,
    ObjectiveSense, OnlineSelector, ParamSpec, PerformanceStore, PortfolioManager,
    ProblemInstance, RecordFilter, RecordSink, Registry, Result, RunRecord, RunStatus,
    SessionBudget, Solver, SolverOutput, ThompsonConfig,
};

// ---------------------------------------------------------------------------
// A toy domain: 1-D quadratic minimization. The "solver quality" of each arm
// is a fixed offset from the optimum, perturbed by its configuration.
// ---------------------------------------------------------------------------

struct QuadraticDomain;

/// Raw problem: minimize (x - target)^2 over x in [0, 1].
struct Quadratic {
    target: f64,
}

impl DomainAdapter for QuadraticDomain {
    type Problem = Quadratic;

    fn domain(&self) -> &str {
        "quadratic"
    }

    fn sense(&self) -> ObjectiveSense {
        ObjectiveSense::Minimize
    }

    fn features(&self, problem: &Self::Problem) -> Vec<f64> {
        vec![problem.target, 1.0]
    }
}

/// Evaluates the quadratic at `config[0]`, so arms whose surrogate learns the
/// target get better objectives over time.
struct EvalAt {
    target: f64,
}

impl Solver for EvalAt {
    fn solve(
        &self,
        _problem: &ProblemInstance,
        config: &[f64],
        _cancel: &CancelToken,
    ) -> Result<SolverOutput> {
        let x = config.first().copied().unwrap_or(0.5);
        Ok(SolverOutput::new((x - self.target) * (x - self.target)))
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
        Err(quiver::PortfolioError::MethodExecutionFailure {
            arm: "broken".to_string(),
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

fn manager_with_store(store: PerformanceStore) -> PortfolioManager {
    let mgr = PortfolioManager::new(
        Registry::new(),
        OnlineSelector::thompson(ThompsonConfig::default(), 5),
        store,
        ManagerConfig {
            ensemble_size: 2,
            round_deadline: Duration::from_millis(500),
            ..ManagerConfig::default()
        },
    );
    mgr.register_arm(arm("search"), Arc::new(EvalAt { target: 0.3 }))
        .unwrap();
    mgr.register_arm(arm("broken"), Arc::new(AlwaysFails)).unwrap();
    mgr
}

#[test]
fn full_session_records_learns_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runs.jsonl");
    let mgr =
        manager_with_store(PerformanceStore::with_sink(Box::new(JsonlSink::open(&path).unwrap())));

    let adapter = QuadraticDomain;
    let problem = adapter.instance("q1", &Quadratic { target: 0.3 });
    assert_eq!(problem.domain, "quadratic");
    assert_eq!(problem.sense, ObjectiveSense::Minimize);

    let report = mgr.run_session(&problem, &SessionBudget::rounds(8)).unwrap();
    assert_eq!(report.rounds, 8);
    assert!(!report.degraded);
    assert_eq!(report.best.as_ref().unwrap().arm_id, "search");

    // Failures were recorded, not dropped.
    let failed = mgr.query(&RecordFilter::arm("broken"));
    assert!(!failed.is_empty());
    assert!(failed.iter().all(|r| r.status == RunStatus::Failed && r.objective.is_none()));

    // The floor reward drags the failing arm's statistics down.
    let stats = mgr.statistics();
    let broken = stats.iter().find(|s| s.arm_id == "broken").unwrap();
    let search = stats.iter().find(|s| s.arm_id == "search").unwrap();
    assert!(search.mean_reward > broken.mean_reward);

    // Every in-memory record is durable in the JSONL sink.
    mgr.flush().unwrap();
    let durable = read_jsonl(&path).unwrap();
    assert_eq!(durable.len(), mgr.query(&RecordFilter::default()).len());
}

#[test]
fn later_problems_start_from_transferred_priors() {
    let mgr = manager_with_store(PerformanceStore::in_memory());
    let adapter = QuadraticDomain;

    let first = adapter.instance("q1", &Quadratic { target: 0.3 });
    mgr.run_session(&first, &SessionBudget::rounds(6)).unwrap();

    // A nearby problem: similar features, so its priors should transfer.
    let second = adapter.instance("q2", &Quadratic { target: 0.32 });
    let report = mgr.run_session(&second, &SessionBudget::rounds(2)).unwrap();
    assert!(
        report.transferred_arms >= 2,
        "expected priors for both arms, got {}",
        report.transferred_arms
    );
}

#[test]
fn store_outage_degrades_but_does_not_stop_the_session() {
    struct BrokenSink;
    impl RecordSink for BrokenSink {
        fn append(&mut self, _: &RunRecord) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let store = PerformanceStore::with_sink(Box::new(BrokenSink)).with_retry(quiver::RetryConfig {
        max_retries: 1,
        base_delay: Duration::from_millis(1),
    });
    let mgr = manager_with_store(store);
    let adapter = QuadraticDomain;
    let problem = adapter.instance("q1", &Quadratic { target: 0.3 });

    let report = mgr.run_session(&problem, &SessionBudget::rounds(3)).unwrap();
    assert!(report.degraded);
    assert_eq!(report.rounds, 3);
    // Learning continued on the in-memory log.
    assert_eq!(mgr.query(&RecordFilter::default()).len() as u64, report.records);
}

#[test]
fn concurrent_sessions_share_statistics() {
    let mgr = manager_with_store(PerformanceStore::in_memory());
    let adapter = QuadraticDomain;

    let mut h1 = mgr.submit(
        adapter.instance("q1", &Quadratic { target: 0.3 }),
        SessionBudget::rounds(4),
    );
    let h2 = mgr.submit(
        adapter.instance("q2", &Quadratic { target: 0.7 }),
        SessionBudget::rounds(4),
    );

    // Poll the first session, join the second.
    let r1 = loop {
        match h1.try_result() {
            Some(r) => break r.unwrap(),
            None => std::thread::sleep(std::time::Duration::from_millis(5)),
        }
    };
    let r2 = h2.join().unwrap();
    assert_eq!(r1.rounds, 4);
    assert_eq!(r2.rounds, 4);
    assert_ne!(r1.session_id, r2.session_id);

    // Both sessions fed the same selector: 4 rounds * 2 arms * 2 sessions of
    // real pulls, plus whatever pseudo-counts transfer seeded.
    let total_pulls: u64 = mgr.statistics().iter().map(|s| s.pulls).sum();
    assert!(total_pulls >= 16, "shared selector saw only {total_pulls} pulls");
}
