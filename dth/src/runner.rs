//! The master harness run loop.
//!
//! Every primary run is executed in list order, then the rerun queue is
//! drained. Each run gets a fresh configuration, the slave test VMs are
//! started through the slave harnesses, and the master test VM is run to
//! completion in this process.

use crate::layers::ConfigLayers;
use anyhow::{Context, Result};
use dth_common::keepalive::{KeepAliveServer, keepalive_port};
use dth_common::protocol::harness::start_slave_vms;
use dth_common::results::RunCounters;
use dth_common::{
    DeletionList, FailureType, HarnessSettings, ProcessOrchestrator, TestList, TestResult, TestRun,
    launch_test_vm,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Everything one `dth run` invocation needs besides the test list.
#[derive(Debug)]
pub struct MasterHarness {
    layers: Arc<ConfigLayers>,
    settings: Arc<HarnessSettings>,
    orchestrator: ProcessOrchestrator,
    deletions: DeletionList,
    report: Option<PathBuf>,
}

impl MasterHarness {
    pub fn new(layers: ConfigLayers, settings: HarnessSettings, report: Option<PathBuf>) -> Self {
        Self {
            layers: Arc::new(layers),
            settings: Arc::new(settings),
            orchestrator: ProcessOrchestrator::default(),
            deletions: DeletionList::default(),
            report,
        }
    }

    /// Run every test in `list`. Returns the process exit code: 0 when every
    /// run finally passed, 1 otherwise.
    pub async fn run(&self, list: &mut TestList) -> Result<i32> {
        let failures = self.deletions.process();
        if failures > 0 {
            warn!(failures, "leftovers of an earlier run could not be deleted");
        }

        let base = self.layers.base_config(&self.settings)?;
        let keepalive = if base.hosts()?.len() > 1 {
            let port = keepalive_port(&base)?;
            let server = KeepAliveServer::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
                .await
                .with_context(|| format!("failed to open keep-alive port {port}"))?;
            Some(server)
        } else {
            None
        };

        let started = Instant::now();
        let primary: Vec<TestRun> = list.runs().to_vec();
        info!(tests = primary.len(), "starting test runs");
        for run in primary {
            self.execute(list, run).await?;
        }
        while let Some(run) = list.next_rerun() {
            self.execute(list, run).await?;
        }

        log_summary(list, started.elapsed().as_secs());
        if let Some(path) = &self.report {
            list.write_report(path)?;
            info!(report = %path.display(), "report written");
        }

        if let Some(server) = keepalive {
            server.shutdown().await;
        }
        let failures = self.deletions.process();
        if failures > 0 {
            warn!(failures, "some files could not be deleted");
        }
        Ok(if list.all_passed() { 0 } else { 1 })
    }

    async fn execute(&self, list: &mut TestList, run: TestRun) -> Result<()> {
        list.mark_started();
        let layers = Arc::clone(&self.layers);
        let settings = Arc::clone(&self.settings);
        let orchestrator = self.orchestrator.clone();
        let job = run.clone();
        let result = tokio::task::spawn_blocking(move || run_one(&layers, &settings, &orchestrator, &job))
            .await
            .context("test run task failed")?;

        if result.passed {
            info!(test = run.name(), tag = %run.config_tag, rerun = run.rerun, skipped = result.is_skip(), "passed");
        } else {
            warn!(
                test = run.name(),
                tag = %run.config_tag,
                rerun = run.rerun,
                failure = ?result.failure_type,
                message = result.message.as_deref().unwrap_or(""),
                "failed"
            );
        }
        list.record(&run, result)?;
        Ok(())
    }
}

/// Execute one run; every failure becomes a result.
fn run_one(
    layers: &ConfigLayers,
    settings: &HarnessSettings,
    orchestrator: &ProcessOrchestrator,
    run: &TestRun,
) -> TestResult {
    let started = Instant::now();
    let config = match layers.run_config(settings, run) {
        Ok(config) => config,
        Err(e) => return TestResult::fail(FailureType::Env, format!("{e:#}"), started.elapsed()),
    };

    match config.hosts() {
        Ok(hosts) if hosts.len() > 1 => {
            if let Err(e) = start_slave_vms(&config, run) {
                return TestResult::fail(FailureType::Env, e.chain_message(), started.elapsed());
            }
        }
        Ok(_) => {}
        Err(e) => return TestResult::fail(FailureType::Env, e.chain_message(), started.elapsed()),
    }

    match launch_test_vm(orchestrator, settings, &config, run) {
        Ok(result) => result,
        Err(e) => {
            error!(test = run.name(), error = %e.chain_message(), "test VM could not be run");
            TestResult::fail(FailureType::Env, e.chain_message(), started.elapsed())
        }
    }
}

fn log_summary(list: &TestList, elapsed_secs: u64) {
    let RunCounters {
        started,
        passed,
        failed,
        skipped,
        rerun,
    } = list.counters();
    for (run, result) in list.final_results() {
        let verdict = match result {
            Some(r) if r.is_skip() => "SKIP",
            Some(r) if r.passed => "PASS",
            Some(_) => "FAIL",
            None => "NOT RUN",
        };
        info!(test = run.name(), tag = %run.config_tag, verdict, "final result");
    }
    info!(started, passed, failed, skipped, rerun, elapsed_secs, "test run complete");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use dth_common::TestDescription;
    use dth_common::config::Properties;

    fn pass_run() -> TestRun {
        let mut props = Properties::new();
        props.insert("testClass".into(), "dth.Pass".into());
        TestRun::new(TestDescription::new("a/Pass.td", props), "default")
    }

    fn settings(vm_binary: &str) -> HarnessSettings {
        HarnessSettings {
            vm_binary: PathBuf::from(vm_binary),
            ..HarnessSettings::default()
        }
    }

    #[test]
    fn test_vm_without_status_line_is_env_failure() {
        let result = run_one(
            &ConfigLayers::default(),
            &settings("/bin/true"),
            &ProcessOrchestrator::default(),
            &pass_run(),
        );
        assert!(!result.passed);
        assert_eq!(result.failure_type, FailureType::Env);
    }

    #[test]
    fn test_missing_vm_binary_is_env_failure() {
        let result = run_one(
            &ConfigLayers::default(),
            &settings("/nonexistent/dth-vm"),
            &ProcessOrchestrator::default(),
            &pass_run(),
        );
        assert_eq!(result.failure_type, FailureType::Env);
        assert!(result.message.unwrap().contains("failed to start"));
    }

    #[test]
    fn test_unreachable_slave_harness_is_env_failure() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        let layers = ConfigLayers {
            command_line: [
                ("dth.hosts".to_string(), "localhost, 127.0.0.1".to_string()),
                ("dth.harnessRequestPort".to_string(), port.to_string()),
                ("dth.slaveConnectAttempts".to_string(), "1".to_string()),
            ]
            .into_iter()
            .collect(),
            ..ConfigLayers::default()
        };
        let result = run_one(&layers, &settings("/bin/true"), &ProcessOrchestrator::default(), &pass_run());
        assert_eq!(result.failure_type, FailureType::Env);
        assert!(result.message.unwrap().contains("did not start its VM"));
    }
}
