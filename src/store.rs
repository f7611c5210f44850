//! Append-only performance store.
//!
//! Every run outcome lands here exactly once; nothing is ever updated or
//! deleted. The in-memory log is the source of truth for queries and
//! nearest-neighbor lookups; an optional [`RecordSink`] mirrors appends to a
//! backing medium (durability is the sink's concern).
//!
//! Sink failures are retried with bounded exponential backoff. If retries
//! exhaust, the record is still kept in memory and
//! [`PortfolioError::StoreUnavailable`] surfaces so the caller can flag the
//! session degraded — an unavailable disk never loses the learning signal.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::warn;

use crate::error::{PortfolioError, Result};
use crate::features::DistanceMetric;
use crate::{ProblemInstance, RunRecord};

/// Identifier of a stored record (its append index).
pub type RunId = u64;

/// Append-only record sink: the persistence collaborator.
pub trait RecordSink: Send {
    fn append(&mut self, record: &RunRecord) -> std::io::Result<()>;
    fn flush(&mut self) -> std::io::Result<()>;
}

/// JSON-lines sink: one serialized [`RunRecord`] per line.
pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    /// Open (or create) a JSONL file in append mode.
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl RecordSink for JsonlSink {
    fn append(&mut self, record: &RunRecord) -> std::io::Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(self.writer, "{}", line)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Read all records back from a JSONL file (for warm starts and tests).
pub fn read_jsonl<P: AsRef<Path>>(path: P) -> std::io::Result<Vec<RunRecord>> {
    let data = std::fs::read_to_string(path)?;
    let mut out = Vec::new();
    for line in data.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let record: RunRecord = serde_json::from_str(line)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        out.push(record);
    }
    Ok(out)
}

/// Bounded-backoff retry policy for sink appends.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Attempts beyond the first.
    pub max_retries: u32,
    /// Delay before the first retry; doubles per attempt.
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(25),
        }
    }
}

/// Filter for [`PerformanceStore::query`]. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub problem_id: Option<String>,
    pub arm_id: Option<String>,
    pub domain: Option<String>,
    pub since: Option<SystemTime>,
}

impl RecordFilter {
    pub fn problem(id: &str) -> Self {
        Self {
            problem_id: Some(id.to_string()),
            ..Self::default()
        }
    }

    pub fn arm(id: &str) -> Self {
        Self {
            arm_id: Some(id.to_string()),
            ..Self::default()
        }
    }
}

/// Durable, append-only log of run outcomes, queryable by problem / arm /
/// domain / recency and by feature similarity.
pub struct PerformanceStore {
    records: Vec<RunRecord>,
    problems: BTreeMap<String, ProblemInstance>,
    metric: DistanceMetric,
    sink: Option<Box<dyn RecordSink>>,
    retry: RetryConfig,
}

impl Default for PerformanceStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl PerformanceStore {
    /// A store with no backing sink (in-memory only).
    pub fn in_memory() -> Self {
        Self {
            records: Vec::new(),
            problems: BTreeMap::new(),
            metric: DistanceMetric::default(),
            sink: None,
            retry: RetryConfig::default(),
        }
    }

    /// A store mirroring appends to the given sink.
    pub fn with_sink(sink: Box<dyn RecordSink>) -> Self {
        Self {
            sink: Some(sink),
            ..Self::in_memory()
        }
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Register a problem instance for similarity lookups. First write wins;
    /// instances are immutable.
    pub fn register_problem(&mut self, problem: ProblemInstance) {
        self.problems.entry(problem.id.clone()).or_insert(problem);
    }

    /// Look up a registered problem by id.
    pub fn problem(&self, id: &str) -> Option<&ProblemInstance> {
        self.problems.get(id)
    }

    /// Append a run record.
    ///
    /// The in-memory log always receives the record. If a sink is attached
    /// and stays unavailable past the retry budget, the assigned [`RunId`] is
    /// still valid but [`PortfolioError::StoreUnavailable`] is returned so
    /// the caller can mark the session degraded.
    pub fn record(&mut self, record: RunRecord) -> Result<RunId> {
        let id = self.records.len() as RunId;
        self.records.push(record);
        let record = &self.records[id as usize];

        let Some(sink) = self.sink.as_mut() else {
            return Ok(id);
        };

        let mut delay = self.retry.base_delay;
        let mut last_err = None;
        for attempt in 0..=self.retry.max_retries {
            match sink.append(record) {
                Ok(()) => return Ok(id),
                Err(e) => {
                    warn!(attempt, error = %e, "record sink append failed");
                    last_err = Some(e);
                    if attempt < self.retry.max_retries {
                        std::thread::sleep(delay);
                        delay *= 2;
                    }
                }
            }
        }
        Err(PortfolioError::StoreUnavailable(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    /// Records matching `filter`, in insertion order.
    ///
    /// The domain filter resolves through registered problems; records whose
    /// problem was never registered do not match a domain filter.
    pub fn query(&self, filter: &RecordFilter) -> Vec<RunRecord> {
        self.records
            .iter()
            .filter(|r| {
                if let Some(pid) = &filter.problem_id {
                    if &r.problem_id != pid {
                        return false;
                    }
                }
                if let Some(aid) = &filter.arm_id {
                    if &r.arm_id != aid {
                        return false;
                    }
                }
                if let Some(domain) = &filter.domain {
                    match self.problems.get(&r.problem_id) {
                        Some(p) if &p.domain == domain => {}
                        _ => return false,
                    }
                }
                if let Some(since) = filter.since {
                    if r.timestamp < since {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect()
    }

    /// The `k` registered problems most similar to `features`, best first.
    ///
    /// Ties break by problem id for determinism.
    pub fn nearest_neighbors(&self, features: &[f64], k: usize) -> Vec<(ProblemInstance, f64)> {
        let mut scored: Vec<(ProblemInstance, f64)> = self
            .problems
            .values()
            .map(|p| (p.clone(), self.metric.similarity(features, &p.features)))
            .collect();
        scored.sort_by(|(pa, sa), (pb, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| pa.id.cmp(&pb.id))
        });
        scored.truncate(k);
        scored
    }

    /// Flush the sink, if any.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(sink) = self.sink.as_mut() {
            sink.flush()
                .map_err(|e| PortfolioError::StoreUnavailable(e.to_string()))?;
        }
        Ok(())
    }

    /// Flush and detach the sink. The in-memory log remains queryable.
    pub fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.sink = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ObjectiveSense, RunStatus};

    fn record(problem: &str, arm: &str, objective: f64) -> RunRecord {
        RunRecord::completed(problem, arm, vec![0.5], objective, Duration::from_millis(10))
    }

    #[test]
    fn record_then_query_round_trips_fields() {
        let mut store = PerformanceStore::in_memory();
        let r = record("p1", "sa", 42.0);
        let id = store.record(r.clone()).unwrap();
        assert_eq!(id, 0);

        let got = store.query(&RecordFilter::problem("p1"));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], r);
    }

    #[test]
    fn query_preserves_insertion_order_and_filters() {
        let mut store = PerformanceStore::in_memory();
        store.record(record("p1", "sa", 1.0)).unwrap();
        store.record(record("p2", "ga", 2.0)).unwrap();
        store.record(record("p1", "ga", 3.0)).unwrap();

        let all = store.query(&RecordFilter::default());
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].objective, Some(1.0));
        assert_eq!(all[2].objective, Some(3.0));

        let p1 = store.query(&RecordFilter::problem("p1"));
        assert_eq!(p1.len(), 2);
        let ga = store.query(&RecordFilter::arm("ga"));
        assert_eq!(ga.len(), 2);
    }

    #[test]
    fn domain_filter_resolves_through_registered_problems() {
        let mut store = PerformanceStore::in_memory();
        store.register_problem(ProblemInstance::new(
            "p1",
            "qap",
            vec![1.0, 0.0],
            ObjectiveSense::Minimize,
        ));
        store.record(record("p1", "sa", 1.0)).unwrap();
        store.record(record("p_unregistered", "sa", 2.0)).unwrap();

        let qap = store.query(&RecordFilter {
            domain: Some("qap".to_string()),
            ..RecordFilter::default()
        });
        assert_eq!(qap.len(), 1);
        assert_eq!(qap[0].problem_id, "p1");
    }

    #[test]
    fn nearest_neighbors_ranks_by_similarity() {
        let mut store = PerformanceStore::in_memory();
        for (id, features) in [
            ("near", vec![1.0, 0.1]),
            ("far", vec![-1.0, 1.0]),
            ("mid", vec![0.7, 0.7]),
        ] {
            store.register_problem(ProblemInstance::new(
                id,
                "qap",
                features,
                ObjectiveSense::Minimize,
            ));
        }
        let nn = store.nearest_neighbors(&[1.0, 0.0], 2);
        assert_eq!(nn.len(), 2);
        assert_eq!(nn[0].0.id, "near");
        assert!(nn[0].1 > nn[1].1);
    }

    #[test]
    fn failing_sink_keeps_memory_and_reports_unavailable() {
        struct BrokenSink;
        impl RecordSink for BrokenSink {
            fn append(&mut self, _: &RunRecord) -> std::io::Result<()> {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut store = PerformanceStore::with_sink(Box::new(BrokenSink)).with_retry(RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
        });
        let err = store.record(record("p1", "sa", 1.0)).unwrap_err();
        assert!(matches!(err, PortfolioError::StoreUnavailable(_)));
        // The record survived in memory.
        assert_eq!(store.len(), 1);
        assert_eq!(store.query(&RecordFilter::problem("p1")).len(), 1);
    }

    #[test]
    fn jsonl_sink_round_trips_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");

        let mut store = PerformanceStore::with_sink(Box::new(JsonlSink::open(&path).unwrap()));
        let r1 = record("p1", "sa", 10.0);
        let r2 = RunRecord::terminal(
            "p1",
            "ga",
            vec![],
            RunStatus::TimedOut,
            Duration::from_secs(1),
        );
        store.record(r1.clone()).unwrap();
        store.record(r2.clone()).unwrap();
        store.close().unwrap();

        let back = read_jsonl(&path).unwrap();
        assert_eq!(back, vec![r1, r2]);
    }
}
