//! Test runs, their results, and the run list with rerun bookkeeping.

use crate::description::TestDescription;
use crate::errors::{Result, TestException};
use crate::types::{FailureType, STATUS_PREFIX};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// One execution of a test under a configuration tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRun {
    pub description: TestDescription,
    pub config_tag: String,
    pub rerun: bool,
}

impl TestRun {
    pub fn new(description: TestDescription, config_tag: impl Into<String>) -> Self {
        Self {
            description,
            config_tag: config_tag.into(),
            rerun: false,
        }
    }

    pub fn name(&self) -> &str {
        self.description.name()
    }

    /// Identity used for duplicate detection: test name plus tag.
    pub fn key(&self) -> RunKey {
        RunKey {
            name: self.description.name().to_string(),
            config_tag: self.config_tag.clone(),
        }
    }

    #[must_use]
    pub fn as_rerun(&self) -> Self {
        Self {
            rerun: true,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunKey {
    pub name: String,
    pub config_tag: String,
}

/// Outcome of one test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub passed: bool,
    pub failure_type: FailureType,
    #[serde(with = "millis")]
    pub elapsed: Duration,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

impl TestResult {
    pub fn pass(elapsed: Duration) -> Self {
        Self {
            passed: true,
            failure_type: FailureType::Passed,
            elapsed,
            message: None,
            log_file: None,
            timestamp: Utc::now(),
        }
    }

    /// A skipped test counts as passing for exit status purposes.
    pub fn skip(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            failure_type: FailureType::Skip,
            elapsed: Duration::ZERO,
            message: Some(message.into()),
            log_file: None,
            timestamp: Utc::now(),
        }
    }

    pub fn fail(failure_type: FailureType, message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            passed: false,
            failure_type,
            elapsed,
            message: Some(message.into()),
            log_file: None,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn is_skip(&self) -> bool {
        self.failure_type == FailureType::Skip
    }

    /// Process exit code for this outcome: 0 for pass or skip, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.passed { 0 } else { 1 }
    }

    /// Render the single status line (without trailing newline).
    pub fn to_status_line(&self) -> Result<String> {
        let json = serde_json::to_string(self)
            .map_err(|e| TestException::with_cause("failed to encode status line", e))?;
        Ok(format!("{STATUS_PREFIX}{json}"))
    }

    /// Parse a status line; `None` when the line is not one.
    pub fn from_status_line(line: &str) -> Option<Self> {
        let json = line.trim_end().strip_prefix(STATUS_PREFIX)?;
        serde_json::from_str(json).ok()
    }
}

/// Counters derived from recorded results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub started: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub rerun: usize,
}

/// Ordered primary runs, their results and a rerun queue.
#[derive(Debug, Default)]
pub struct TestList {
    runs: Vec<TestRun>,
    index: HashMap<RunKey, usize>,
    results: Vec<Vec<TestResult>>,
    rerun_queue: VecDeque<TestRun>,
    retries_enabled: bool,
    max_retries: usize,
    counters: RunCounters,
}

impl TestList {
    pub fn new(retries_enabled: bool, max_retries: usize) -> Self {
        Self {
            retries_enabled,
            max_retries,
            ..Self::default()
        }
    }

    /// Append a primary run. A run already in the list is an error.
    pub fn add(&mut self, run: TestRun) -> Result<()> {
        let key = run.key();
        if self.index.contains_key(&key) {
            return Err(TestException::new(format!(
                "duplicate test run: {} [{}]",
                key.name, key.config_tag
            )));
        }
        self.index.insert(key, self.runs.len());
        self.runs.push(run);
        self.results.push(Vec::new());
        Ok(())
    }

    pub fn runs(&self) -> &[TestRun] {
        &self.runs
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn mark_started(&mut self) {
        self.counters.started += 1;
    }

    pub fn counters(&self) -> RunCounters {
        self.counters
    }

    pub fn results(&self, run: &TestRun) -> &[TestResult] {
        self.index
            .get(&run.key())
            .map(|i| self.results[*i].as_slice())
            .unwrap_or(&[])
    }

    pub fn rerun_queue(&self) -> impl Iterator<Item = &TestRun> {
        self.rerun_queue.iter()
    }

    pub fn next_rerun(&mut self) -> Option<TestRun> {
        self.rerun_queue.pop_front()
    }

    /// Record a result for `run`, which must already be in the list.
    ///
    /// A result following an earlier failure is a rerun outcome: a pass turns
    /// the earlier failure into a pass; a further failure changes no
    /// counters. A rerun-eligible failure is queued while attempts remain.
    pub fn record(&mut self, run: &TestRun, result: TestResult) -> Result<()> {
        let Some(&idx) = self.index.get(&run.key()) else {
            return Err(TestException::new(format!(
                "result recorded for unknown test run {}",
                run.name()
            )));
        };
        let history = &self.results[idx];
        let rerun_outcome = history.last().is_some_and(|last| !last.passed);
        let attempts = history.len();

        if rerun_outcome {
            if result.passed {
                self.counters.passed += 1;
                self.counters.failed = self.counters.failed.saturating_sub(1);
                self.counters.rerun += 1;
                info!(test = run.name(), "rerun passed");
            }
        } else if result.is_skip() {
            self.counters.skipped += 1;
        } else if result.passed {
            self.counters.passed += 1;
        } else {
            self.counters.failed += 1;
        }

        if !result.passed
            && result.failure_type == FailureType::Rerun
            && self.retries_enabled
            && attempts < self.max_retries
        {
            debug!(test = run.name(), attempt = attempts + 1, "queued for rerun");
            self.rerun_queue.push_back(self.runs[idx].as_rerun());
        }

        self.results[idx].push(result);
        Ok(())
    }

    /// Final (latest) result per run, in list order.
    pub fn final_results(&self) -> impl Iterator<Item = (&TestRun, Option<&TestResult>)> {
        self.runs
            .iter()
            .zip(self.results.iter())
            .map(|(run, results)| (run, results.last()))
    }

    pub fn all_passed(&self) -> bool {
        self.final_results()
            .all(|(_, r)| r.is_some_and(|r| r.passed))
    }

    /// Write a JSON report of every run and its result history.
    pub fn write_report(&self, path: &Path) -> Result<()> {
        #[derive(Serialize)]
        struct Entry<'a> {
            test: &'a str,
            config_tag: &'a str,
            results: &'a [TestResult],
        }
        #[derive(Serialize)]
        struct Report<'a> {
            counters: RunCounters,
            runs: Vec<Entry<'a>>,
        }

        let report = Report {
            counters: self.counters,
            runs: self
                .runs
                .iter()
                .zip(self.results.iter())
                .map(|(run, results)| Entry {
                    test: run.name(),
                    config_tag: &run.config_tag,
                    results,
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| TestException::with_cause("failed to encode report", e))?;
        std::fs::write(path, json).map_err(|e| {
            TestException::with_cause(format!("failed to write report {}", path.display()), e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::properties::Properties;

    fn run(name: &str) -> TestRun {
        TestRun::new(TestDescription::new(name, Properties::new()), "default")
    }

    #[test]
    fn test_duplicate_primary_run_rejected() {
        let mut list = TestList::new(false, 0);
        list.add(run("a.td")).unwrap();
        assert!(list.add(run("a.td")).is_err());
        let mut other_tag = run("a.td");
        other_tag.config_tag = "secure".into();
        list.add(other_tag).unwrap();
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_rerun_scenario_turns_failure_into_pass() {
        let mut list = TestList::new(true, 1);
        let r = run("lookup/Register.td");
        list.add(r.clone()).unwrap();

        list.record(
            &r,
            TestResult::fail(FailureType::Rerun, "boom", Duration::from_millis(5000)),
        )
        .unwrap();
        assert_eq!(list.rerun_queue().count(), 1);
        assert_eq!(list.counters().failed, 1);

        let queued = list.next_rerun().unwrap();
        assert!(queued.rerun);
        list.record(&queued, TestResult::pass(Duration::from_millis(10)))
            .unwrap();

        let c = list.counters();
        assert_eq!(c.passed, 1);
        assert_eq!(c.failed, 0);
        assert_eq!(c.rerun, 1);
        assert!(list.next_rerun().is_none());
        assert!(list.all_passed());
        assert_eq!(list.results(&r).len(), 2);
    }

    #[test]
    fn test_rerun_limited_by_max_retries() {
        let mut list = TestList::new(true, 1);
        let r = run("x.td");
        list.add(r.clone()).unwrap();
        let fail = || TestResult::fail(FailureType::Rerun, "again", Duration::ZERO);
        list.record(&r, fail()).unwrap();
        let again = list.next_rerun().unwrap();
        list.record(&again, fail()).unwrap();
        assert!(list.next_rerun().is_none());
        assert_eq!(list.counters().failed, 1);
        assert!(!list.all_passed());
    }

    #[test]
    fn test_non_rerun_failures_and_disabled_retries_are_not_queued() {
        let mut list = TestList::new(false, 3);
        let a = run("a.td");
        list.add(a.clone()).unwrap();
        list.record(&a, TestResult::fail(FailureType::Rerun, "x", Duration::ZERO))
            .unwrap();
        assert!(list.next_rerun().is_none());

        let mut list = TestList::new(true, 3);
        list.add(a.clone()).unwrap();
        list.record(&a, TestResult::fail(FailureType::Env, "x", Duration::ZERO))
            .unwrap();
        assert!(list.next_rerun().is_none());
    }

    #[test]
    fn test_skip_counts_separately() {
        let mut list = TestList::new(true, 1);
        let a = run("a.td");
        list.add(a.clone()).unwrap();
        list.record(&a, TestResult::skip("not on this platform")).unwrap();
        assert_eq!(list.counters().skipped, 1);
        assert_eq!(list.counters().passed, 0);
        assert!(list.all_passed());
    }

    #[test]
    fn test_unknown_run_is_an_error() {
        let mut list = TestList::new(false, 0);
        assert!(list.record(&run("nope.td"), TestResult::pass(Duration::ZERO)).is_err());
    }

    #[test]
    fn test_status_line_round_trip() {
        let result = TestResult::fail(FailureType::Env, "no daemon", Duration::from_millis(1234));
        let line = result.to_status_line().unwrap();
        assert!(line.starts_with(STATUS_PREFIX));
        let parsed = TestResult::from_status_line(&format!("{line}\n")).unwrap();
        assert_eq!(parsed.failure_type, FailureType::Env);
        assert_eq!(parsed.elapsed, Duration::from_millis(1234));
        assert_eq!(parsed.exit_code(), 1);
        assert!(TestResult::from_status_line("ordinary log output").is_none());
    }

    #[test]
    fn test_write_report() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = TestList::new(false, 0);
        let a = run("a.td");
        list.add(a.clone()).unwrap();
        list.record(&a, TestResult::pass(Duration::from_millis(3))).unwrap();
        let path = dir.path().join("report.json");
        list.write_report(&path).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["counters"]["passed"], 1);
        assert_eq!(json["runs"][0]["test"], "a.td");
        assert_eq!(json["runs"][0]["results"][0]["failure_type"], "PASSED");
    }
}
