//! Per-test execution: construct, run, teardown, then one status line.
//!
//! Failures are classified by a chain of [`FailureAnalyzer`]s consulted in
//! registration order; the first verdict other than `Unknown` wins. A failed
//! construct defaults to `Env`, a failed run to `Test`, and any failing run
//! verdict is escalated to `Rerun`.

use crate::admin::{AdminManager, ServiceInfo};
use crate::config::parse_bool;
use crate::description::TestDescription;
use crate::errors::{Result, TestException, best_effort};
use crate::protocol::{self, AdminQuery, ServiceRef, SlaveRequest, request_slave};
use crate::results::{TestResult, TestRun};
use crate::suspend::SuspendGate;
use crate::types::FailureType;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Description property: the test is expected to fail.
pub const EXPECTS_FAILURE_KEY: &str = "testExpectsFailure";
/// Description property: do not execute the test.
pub const SKIP_KEY: &str = "testSkip";
/// Services started by `dth.ServiceStarter`: `prefix[@hostIndex]`, comma or
/// whitespace separated.
pub const TEST_SERVICES_KEY: &str = "testServices";
/// Message used by `dth.Fail`.
pub const FAIL_MESSAGE_KEY: &str = "testFailMessage";

/// Marker cause for a test that decided at run time not to execute.
#[derive(Debug, Error)]
#[error("skipped: {0}")]
pub struct TestSkipped(pub String);

/// Build the error a test returns to skip itself.
pub fn skip(reason: impl Into<String>) -> TestException {
    TestException::with_cause("test skipped", TestSkipped(reason.into()))
}

/// A test case run inside a test VM.
pub trait QaTest: Send {
    fn construct(&mut self, ctx: &mut TestContext<'_>) -> Result<()>;

    fn run(&mut self, ctx: &mut TestContext<'_>) -> Result<()>;

    /// Test-specific cleanup; admins are torn down by the driver afterwards.
    fn teardown(&mut self, _ctx: &mut TestContext<'_>) -> Result<()> {
        Ok(())
    }
}

type TestFactory = Box<dyn Fn() -> Box<dyn QaTest> + Send + Sync>;

/// Test classes by name.
#[derive(Default)]
pub struct TestRegistry {
    factories: BTreeMap<String, TestFactory>,
}

impl std::fmt::Debug for TestRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestRegistry")
            .field("classes", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding `dth.ServiceStarter`, `dth.Pass` and `dth.Fail`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("dth.ServiceStarter", || Box::new(ServiceStarter::default()));
        registry.register("dth.Pass", || Box::new(PassTest));
        registry.register("dth.Fail", || Box::new(FailTest));
        registry
    }

    pub fn register<F>(&mut self, class: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn QaTest> + Send + Sync + 'static,
    {
        self.factories.insert(class.into(), Box::new(factory));
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    pub fn create(&self, class: &str) -> Result<Box<dyn QaTest>> {
        self.factories
            .get(class)
            .map(|factory| factory())
            .ok_or_else(|| TestException::new(format!("no test class registered as '{class}'")))
    }
}

/// What a test sees while it runs.
pub struct TestContext<'a> {
    manager: &'a mut AdminManager,
    gate: &'a SuspendGate,
    run: &'a TestRun,
}

impl<'a> TestContext<'a> {
    pub fn new(manager: &'a mut AdminManager, gate: &'a SuspendGate, run: &'a TestRun) -> Self {
        Self { manager, gate, run }
    }

    pub fn run(&self) -> &TestRun {
        self.run
    }

    pub fn description(&self) -> &TestDescription {
        &self.run.description
    }

    pub fn config(&self) -> &crate::config::QaConfig {
        self.manager.config()
    }

    pub fn config_mut(&mut self) -> &mut crate::config::QaConfig {
        self.manager.config_mut()
    }

    pub fn manager(&mut self) -> &mut AdminManager {
        &mut *self.manager
    }

    /// Block while an external controller holds the test suspended.
    pub fn checkpoint(&self) {
        self.gate.wait_while_suspended();
    }

    /// Start a service on host `host_index` (0 is this VM).
    pub fn start_service_on(&mut self, host_index: usize, prefix: &str) -> Result<ServiceInfo> {
        if host_index == 0 {
            return self.manager.start_service(prefix);
        }
        request_slave(
            self.manager.config(),
            host_index,
            &SlaveRequest::StartService {
                prefix: prefix.to_string(),
            },
        )
    }

    pub fn stop_service_on(&mut self, host_index: usize, service: &ServiceRef) -> Result<()> {
        if host_index == 0 {
            return self.manager.stop_service(service);
        }
        request_slave(
            self.manager.config(),
            host_index,
            &SlaveRequest::StopService {
                service: service.clone(),
            },
        )
    }

    pub fn kill_vm_on(&mut self, host_index: usize, service: &ServiceRef) -> Result<()> {
        if host_index == 0 {
            return self.manager.kill_vm(service);
        }
        request_slave(
            self.manager.config(),
            host_index,
            &SlaveRequest::KillVm {
                service: service.clone(),
            },
        )
    }

    pub fn query_on(&mut self, host_index: usize, query: AdminQuery) -> Result<serde_json::Value> {
        if host_index == 0 {
            return self.manager.query(&query);
        }
        request_slave(self.manager.config(), host_index, &SlaveRequest::Query(query))
    }
}

/// Maps an error (or a clean run) to a classification.
pub trait FailureAnalyzer: Send + Sync {
    fn name(&self) -> &str;

    /// `error` is `None` when the phase completed normally. Return
    /// [`FailureType::Unknown`] to abstain.
    fn analyze(&self, error: Option<&TestException>, description: &TestDescription) -> FailureType;
}

/// Classifies tests that skipped themselves via [`skip`].
#[derive(Debug, Default)]
pub struct SkipAnalyzer;

impl FailureAnalyzer for SkipAnalyzer {
    fn name(&self) -> &str {
        "skip"
    }

    fn analyze(&self, error: Option<&TestException>, _description: &TestDescription) -> FailureType {
        match error {
            Some(e) if e.find_cause::<TestSkipped>().is_some() => FailureType::Skip,
            _ => FailureType::Unknown,
        }
    }
}

/// Inverts the outcome of tests marked `testExpectsFailure=true`.
#[derive(Debug, Default)]
pub struct ExpectedFailureAnalyzer;

impl FailureAnalyzer for ExpectedFailureAnalyzer {
    fn name(&self) -> &str {
        "expected-failure"
    }

    fn analyze(&self, error: Option<&TestException>, description: &TestDescription) -> FailureType {
        let expects_failure = description
            .property(EXPECTS_FAILURE_KEY)
            .and_then(parse_bool)
            .unwrap_or(false);
        match (expects_failure, error) {
            (false, _) => FailureType::Unknown,
            (true, Some(_)) => FailureType::Passed,
            (true, None) => FailureType::Test,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Construct,
    Run,
}

/// Drives one test through its lifecycle.
pub struct TestRunDriver {
    registry: TestRegistry,
    analyzers: Vec<Box<dyn FailureAnalyzer>>,
    gate: Arc<SuspendGate>,
}

impl TestRunDriver {
    /// A driver with the skip and expected-failure analyzers installed.
    pub fn new(registry: TestRegistry) -> Self {
        let mut driver = Self::bare(registry);
        driver.add_analyzer(Box::new(SkipAnalyzer));
        driver.add_analyzer(Box::new(ExpectedFailureAnalyzer));
        driver
    }

    /// A driver with no analyzers.
    pub fn bare(registry: TestRegistry) -> Self {
        Self {
            registry,
            analyzers: Vec::new(),
            gate: Arc::new(SuspendGate::new()),
        }
    }

    pub fn add_analyzer(&mut self, analyzer: Box<dyn FailureAnalyzer>) {
        debug!(analyzer = analyzer.name(), "failure analyzer registered");
        self.analyzers.push(analyzer);
    }

    /// Gate shared with the autot listener.
    pub fn gate(&self) -> Arc<SuspendGate> {
        Arc::clone(&self.gate)
    }

    /// First non-`Unknown` verdict in registration order.
    pub fn consult(&self, error: Option<&TestException>, description: &TestDescription) -> FailureType {
        self.analyzers
            .iter()
            .map(|a| a.analyze(error, description))
            .find(|verdict| *verdict != FailureType::Unknown)
            .unwrap_or(FailureType::Unknown)
    }

    /// Turn the outcome of a phase into a result.
    pub fn classify(
        &self,
        phase: Phase,
        error: Option<&TestException>,
        description: &TestDescription,
        elapsed: Duration,
    ) -> TestResult {
        let verdict = match (self.consult(error, description), phase, error) {
            (FailureType::Unknown, Phase::Construct, _) => FailureType::Env,
            (FailureType::Unknown, Phase::Run, Some(_)) => FailureType::Test,
            (FailureType::Unknown, Phase::Run, None) => FailureType::Passed,
            (verdict, _, _) => verdict,
        };
        let message = error.map(TestException::chain_message);
        match verdict {
            FailureType::Passed => TestResult::pass(elapsed),
            FailureType::Skip => {
                TestResult::skip(message.unwrap_or_else(|| "skipped by analyzer".to_string()))
            }
            failed => {
                let failure_type = if phase == Phase::Run {
                    FailureType::Rerun
                } else {
                    failed
                };
                let message = message.unwrap_or_else(|| {
                    "test completed but an analyzer classified it as failed".to_string()
                });
                TestResult::fail(failure_type, message, elapsed)
            }
        }
    }

    /// Run `run` against `manager`. Teardown always runs; the manager's admins
    /// are torn down afterwards and, on the master, every slave is told to
    /// tear down too.
    pub fn execute(&self, manager: &mut AdminManager, run: &TestRun) -> TestResult {
        let started = Instant::now();
        let description = &run.description;
        if description.property(SKIP_KEY).and_then(parse_bool).unwrap_or(false) {
            info!(test = run.name(), "test marked as skipped");
            return TestResult::skip(format!("{SKIP_KEY} is set"));
        }

        let mut test = match self.registry.create(description.test_class()) {
            Ok(test) => test,
            Err(e) => return self.classify(Phase::Construct, Some(&e), description, started.elapsed()),
        };

        let mut ctx = TestContext::new(manager, &self.gate, run);
        ctx.checkpoint();
        info!(test = run.name(), "construct");
        let result = match contain("construct", || test.construct(&mut ctx)) {
            Err(e) => {
                warn!(test = run.name(), error = %e.chain_message(), "construct failed");
                self.classify(Phase::Construct, Some(&e), description, started.elapsed())
            }
            Ok(()) => {
                ctx.checkpoint();
                info!(test = run.name(), "run");
                let outcome = contain("run", || test.run(&mut ctx));
                if let Err(e) = &outcome {
                    warn!(test = run.name(), error = %e.chain_message(), "run failed");
                }
                self.classify(Phase::Run, outcome.as_ref().err(), description, started.elapsed())
            }
        };

        ctx.checkpoint();
        info!(test = run.name(), "teardown");
        best_effort("test teardown", contain("teardown", || test.teardown(&mut ctx)));
        drop(ctx);
        teardown_hosts(manager);

        info!(
            test = run.name(),
            passed = result.passed,
            failure_type = result.failure_type.as_str(),
            elapsed_ms = u64::try_from(result.elapsed.as_millis()).unwrap_or(u64::MAX),
            "test finished"
        );
        result
    }
}

/// Run one test phase, turning a panic into a failure of that phase.
fn contain(phase: &str, body: impl FnOnce() -> Result<()>) -> Result<()> {
    panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|payload| {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "(non-string panic)".to_string());
        error!(phase, reason = %reason, "test panicked");
        Err(TestException::new(format!("test panicked in {phase}: {reason}")))
    })
}

fn teardown_hosts(manager: &mut AdminManager) {
    manager.teardown();
    let config = manager.config();
    if !config.is_master() {
        return;
    }
    match config.slave_endpoints() {
        Ok(slaves) if !slaves.is_empty() => {
            let report = protocol::broadcast(&slaves, &SlaveRequest::Teardown);
            debug!(attempted = report.attempted, failed = report.failed.len(), "slave teardown sent");
        }
        Ok(_) => {}
        Err(e) => error!(error = %e.chain_message(), "cannot determine slave hosts for teardown"),
    }
}

/// Write the single status line that ends a test VM.
pub fn write_status_line(result: &TestResult, out: &mut dyn Write) -> io::Result<()> {
    let line = result
        .to_status_line()
        .map_err(|e| io::Error::other(e.chain_message()))?;
    writeln!(out, "{line}")?;
    out.flush()
}

/// Starts the services named by `testServices` and checks they are reachable.
#[derive(Debug, Default)]
pub struct ServiceStarter {
    started: Vec<(usize, ServiceInfo)>,
}

fn parse_service_list(raw: &str) -> Result<Vec<(String, usize)>> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|item| match item.split_once('@') {
            Some((prefix, host)) => host
                .parse::<usize>()
                .map(|h| (prefix.to_string(), h))
                .map_err(|_| TestException::new(format!("bad host index in '{item}'"))),
            None => Ok((item.to_string(), 0)),
        })
        .collect()
}

impl QaTest for ServiceStarter {
    fn construct(&mut self, ctx: &mut TestContext<'_>) -> Result<()> {
        let raw = ctx.config().get_string(TEST_SERVICES_KEY, "")?;
        for (prefix, host) in parse_service_list(&raw)? {
            let info = ctx.start_service_on(host, &prefix)?;
            info!(service = %info.service, host = %info.host, "started");
            self.started.push((host, info));
        }
        Ok(())
    }

    fn run(&mut self, ctx: &mut TestContext<'_>) -> Result<()> {
        for (host, info) in &self.started {
            ctx.query_on(
                *host,
                AdminQuery::Proxy {
                    service: info.service.clone(),
                },
            )
            .map_err(|e| {
                TestException::with_cause(format!("{} is not reachable", info.service), e)
            })?;
        }
        Ok(())
    }
}

/// Always passes.
#[derive(Debug)]
pub struct PassTest;

impl QaTest for PassTest {
    fn construct(&mut self, _ctx: &mut TestContext<'_>) -> Result<()> {
        Ok(())
    }

    fn run(&mut self, _ctx: &mut TestContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Always fails in run.
#[derive(Debug)]
pub struct FailTest;

impl QaTest for FailTest {
    fn construct(&mut self, _ctx: &mut TestContext<'_>) -> Result<()> {
        Ok(())
    }

    fn run(&mut self, ctx: &mut TestContext<'_>) -> Result<()> {
        let message = ctx.config().get_string(FAIL_MESSAGE_KEY, "test failed as configured")?;
        Err(TestException::new(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::DeletionList;
    use crate::config::{HarnessSettings, QaConfig, parse_properties};
    use crate::context::RuntimeContext;
    use crate::pipe::OutputSink;
    use crate::process::ProcessOrchestrator;
    use crate::testing::RecordingPlatform;
    use crate::types::HostRole;

    fn manager(extra: &str) -> (AdminManager, Arc<RecordingPlatform>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let config = QaConfig::builder()
            .defaults(parse_properties(&format!(
                "dth.activation.type=external\n\
                 dth.activation.stopDelay=0\n\
                 dth.activation.attempts=0\n\
                 dth.serviceUnregisterWait=0\n\
                 sharedGroup.persistenceRoot={}\n\
                 reggie.type=activatable\n\
                 reggie.impl=Registrar\n{extra}",
                tmp.path().display()
            )))
            .role(HostRole::Master)
            .build()
            .unwrap();
        let platform = Arc::new(RecordingPlatform::new());
        platform.set_daemon_alive(true);
        let runtime = RuntimeContext::new(
            platform.clone(),
            ProcessOrchestrator::new(OutputSink::buffer().0, OutputSink::buffer().0),
            HarnessSettings::default(),
            Arc::new(DeletionList::at(tmp.path().join("list.txt"))),
        );
        (AdminManager::new(config, runtime), platform, tmp)
    }

    fn run_of(class: &str, props: &[(&str, &str)]) -> TestRun {
        let mut properties: crate::config::Properties = props
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        properties.insert("testClass".into(), class.into());
        TestRun::new(TestDescription::new("unit/driver", properties), "default")
    }

    struct Scripted {
        construct: Option<&'static str>,
        run: Option<&'static str>,
        skip_in_run: bool,
    }

    impl QaTest for Scripted {
        fn construct(&mut self, _ctx: &mut TestContext<'_>) -> Result<()> {
            self.construct.map_or(Ok(()), |m| Err(TestException::new(m)))
        }

        fn run(&mut self, _ctx: &mut TestContext<'_>) -> Result<()> {
            if self.skip_in_run {
                return Err(skip("needs two hosts"));
            }
            self.run.map_or(Ok(()), |m| Err(TestException::new(m)))
        }
    }

    /// Starts a registrar, then panics in the chosen phase.
    struct StartsThenPanics {
        in_construct: bool,
    }

    impl QaTest for StartsThenPanics {
        fn construct(&mut self, ctx: &mut TestContext<'_>) -> Result<()> {
            if self.in_construct {
                ctx.start_service_on(0, "reggie")?;
                panic!("lookup discovery returned nothing");
            }
            Ok(())
        }

        fn run(&mut self, ctx: &mut TestContext<'_>) -> Result<()> {
            ctx.start_service_on(0, "reggie")?;
            panic!("registrar proxy was {}", "null");
        }
    }

    fn driver() -> TestRunDriver {
        let mut registry = TestRegistry::with_builtins();
        registry.register("t.ConstructFails", || {
            Box::new(Scripted { construct: Some("no registrar"), run: None, skip_in_run: false })
        });
        registry.register("t.RunFails", || {
            Box::new(Scripted { construct: None, run: Some("assertion"), skip_in_run: false })
        });
        registry.register("t.Skips", || {
            Box::new(Scripted { construct: None, run: None, skip_in_run: true })
        });
        registry.register("t.PanicsInRun", || Box::new(StartsThenPanics { in_construct: false }));
        registry.register("t.PanicsInConstruct", || Box::new(StartsThenPanics { in_construct: true }));
        TestRunDriver::new(registry)
    }

    #[test]
    fn test_pass_and_fail_builtins() {
        let (mut manager, _platform, _tmp) = manager("");
        let driver = driver();
        let pass = driver.execute(&mut manager, &run_of("dth.Pass", &[]));
        assert!(pass.passed);
        assert_eq!(pass.failure_type, FailureType::Passed);

        let fail = driver.execute(&mut manager, &run_of("dth.Fail", &[]));
        assert!(!fail.passed);
        assert_eq!(fail.failure_type, FailureType::Rerun);
        assert_eq!(fail.message.as_deref(), Some("test failed as configured"));
        assert_eq!(fail.exit_code(), 1);
    }

    #[test]
    fn test_construct_failure_defaults_to_env() {
        let (mut manager, _platform, _tmp) = manager("");
        let result = driver().execute(&mut manager, &run_of("t.ConstructFails", &[]));
        assert_eq!(result.failure_type, FailureType::Env);
        assert_eq!(result.message.as_deref(), Some("no registrar"));
    }

    #[test]
    fn test_unknown_class_is_env_failure() {
        let (mut manager, _platform, _tmp) = manager("");
        let result = driver().execute(&mut manager, &run_of("t.Missing", &[]));
        assert_eq!(result.failure_type, FailureType::Env);
    }

    #[test]
    fn test_run_failure_is_escalated_to_rerun() {
        let (mut manager, _platform, _tmp) = manager("");
        let result = TestRunDriver::bare(driver().registry)
            .execute(&mut manager, &run_of("t.RunFails", &[]));
        assert_eq!(result.failure_type, FailureType::Rerun);
    }

    #[test]
    fn test_expected_failure_inverts_outcome() {
        let (mut manager, _platform, _tmp) = manager("");
        let driver = driver();
        let expected = [(EXPECTS_FAILURE_KEY, "true")];
        assert!(driver.execute(&mut manager, &run_of("t.RunFails", &expected)).passed);
        let unexpected = driver.execute(&mut manager, &run_of("dth.Pass", &expected));
        assert!(!unexpected.passed);
        assert_eq!(unexpected.failure_type, FailureType::Rerun);
    }

    #[test]
    fn test_skips_are_not_escalated() {
        let (mut manager, _platform, _tmp) = manager("");
        let driver = driver();
        let dynamic = driver.execute(&mut manager, &run_of("t.Skips", &[]));
        assert!(dynamic.passed);
        assert_eq!(dynamic.failure_type, FailureType::Skip);
        assert_eq!(dynamic.exit_code(), 0);

        let marked = driver.execute(&mut manager, &run_of("t.ConstructFails", &[(SKIP_KEY, "yes")]));
        assert_eq!(marked.failure_type, FailureType::Skip);
    }

    #[test]
    fn test_first_non_unknown_verdict_wins() {
        struct Fixed(FailureType);
        impl FailureAnalyzer for Fixed {
            fn name(&self) -> &str {
                "fixed"
            }
            fn analyze(&self, _: Option<&TestException>, _: &TestDescription) -> FailureType {
                self.0
            }
        }
        let mut driver = TestRunDriver::bare(TestRegistry::new());
        driver.add_analyzer(Box::new(Fixed(FailureType::Unknown)));
        driver.add_analyzer(Box::new(Fixed(FailureType::Indef)));
        driver.add_analyzer(Box::new(Fixed(FailureType::Env)));
        let description = TestDescription::new("x", Default::default());
        let err = TestException::new("boom");
        let construct = driver.classify(Phase::Construct, Some(&err), &description, Duration::ZERO);
        assert_eq!(construct.failure_type, FailureType::Indef);
        // Clean runs are re-checked; a failing verdict becomes a rerun.
        let run = driver.classify(Phase::Run, None, &description, Duration::ZERO);
        assert_eq!(run.failure_type, FailureType::Rerun);
    }

    #[test]
    fn test_service_starter_tears_everything_down() {
        let (mut manager, platform, _tmp) = manager("testServices=reggie, reggie\n");
        let result = driver().execute(&mut manager, &run_of("dth.ServiceStarter", &[]));
        assert!(result.passed, "{:?}", result.message);
        assert_eq!(platform.inner().service_count(), 0);
        assert_eq!(platform.inner().group_count(), 0);
        assert!(manager.running_admins().is_empty());
    }

    #[test]
    fn test_panicking_run_still_tears_down() {
        let (mut manager, platform, _tmp) = manager("");
        let result = driver().execute(&mut manager, &run_of("t.PanicsInRun", &[]));
        assert!(!result.passed);
        assert_eq!(result.failure_type, FailureType::Rerun);
        assert_eq!(
            result.message.as_deref(),
            Some("test panicked in run: registrar proxy was null")
        );
        assert_eq!(platform.inner().service_count(), 0);
        assert_eq!(platform.inner().group_count(), 0);
        assert!(manager.running_admins().is_empty());
    }

    #[test]
    fn test_panicking_construct_is_env_failure() {
        let (mut manager, platform, _tmp) = manager("");
        let result = driver().execute(&mut manager, &run_of("t.PanicsInConstruct", &[]));
        assert_eq!(result.failure_type, FailureType::Env);
        assert!(result.message.unwrap().contains("lookup discovery returned nothing"));
        assert_eq!(platform.inner().service_count(), 0);
        assert_eq!(platform.inner().group_count(), 0);
    }

    #[test]
    fn test_parse_service_list() {
        assert_eq!(
            parse_service_list("reggie, mahalo@2 fiddler").unwrap(),
            vec![("reggie".to_string(), 0), ("mahalo".to_string(), 2), ("fiddler".to_string(), 0)]
        );
        assert!(parse_service_list("reggie@x").is_err());
    }

    #[test]
    fn test_status_line_round_trips_through_writer() {
        let mut out = Vec::new();
        write_status_line(&TestResult::pass(Duration::from_millis(12)), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let parsed = TestResult::from_status_line(text.trim_end()).unwrap();
        assert!(parsed.passed);
    }
}
