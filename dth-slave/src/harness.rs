//! Handling of harness requests from the master.

use dth_common::errors::Result;
use dth_common::process::{ManagedChild, spawn_test_vm};
use dth_common::protocol::harness::{HarnessRequest, VmStarted};
use dth_common::protocol::Reply;
use dth_common::types::local_host_name;
use dth_common::{ConfigSnapshot, HarnessSettings, HostRole, ProcessOrchestrator, QaConfig, TestRun, best_effort};
use std::sync::Mutex;
use tracing::{debug, info};

/// Starts slave test VMs on behalf of the master and keeps track of them.
#[derive(Debug)]
pub struct SlaveHarness {
    host: String,
    settings: HarnessSettings,
    orchestrator: ProcessOrchestrator,
    children: Mutex<Vec<ManagedChild>>,
}

impl SlaveHarness {
    pub fn new(settings: HarnessSettings, orchestrator: ProcessOrchestrator) -> Self {
        Self {
            host: local_host_name(),
            settings,
            orchestrator,
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn handle(&self, request: HarnessRequest) -> Reply {
        match request {
            HarnessRequest::StartTestVm { snapshot, run } => Reply::from_result(
                self.start_test_vm(*snapshot, &run)
                    .map_err(|e| e.chain_message()),
            ),
            HarnessRequest::Ping => Reply::ok(&self.host),
        }
    }

    fn start_test_vm(&self, snapshot: ConfigSnapshot, run: &TestRun) -> Result<VmStarted> {
        let mut config = QaConfig::from_snapshot(snapshot)?;
        config.set_role(HostRole::Slave);
        self.reap();

        let annotation = format!("{}: ", self.host);
        let child = spawn_test_vm(&self.orchestrator, &self.settings, &config, run, Some(&annotation))?;
        let pid = child.id();
        info!(test = run.name(), pid, "slave test VM started");
        self.children.lock().unwrap_or_else(|e| e.into_inner()).push(child);
        Ok(VmStarted {
            host: self.host.clone(),
            pid,
        })
    }

    /// Collect test VMs that have already exited.
    fn reap(&self) {
        let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        let (finished, running): (Vec<_>, Vec<_>) = children
            .drain(..)
            .partition(|child| matches!(child.try_wait(), Ok(Some(_))));
        *children = running;
        for child in finished {
            let pid = child.id();
            if let Ok(outcome) = child.wait() {
                debug!(pid, status = %outcome.status, "slave test VM exited");
            }
        }
    }

    pub fn running_children(&self) -> usize {
        self.reap();
        self.children.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Kill every test VM still running. Returns how many were killed.
    pub fn kill_children(&self) -> usize {
        let children: Vec<_> = self
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        let mut killed = 0;
        for child in children {
            let pid = child.id();
            if best_effort(&format!("kill test VM {pid}"), child.kill()) {
                killed += 1;
            }
            best_effort(&format!("reap test VM {pid}"), child.wait());
        }
        killed
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use dth_common::TestDescription;
    use dth_common::pipe::OutputSink;
    use std::path::PathBuf;
    use std::time::Duration;

    fn harness(vm_binary: &str) -> SlaveHarness {
        let (out, _) = OutputSink::buffer();
        let (err, _) = OutputSink::buffer();
        let settings = HarnessSettings {
            vm_binary: PathBuf::from(vm_binary),
            ..HarnessSettings::default()
        };
        SlaveHarness::new(settings, ProcessOrchestrator::new(out, err))
    }

    fn start_request() -> HarnessRequest {
        HarnessRequest::StartTestVm {
            snapshot: Box::new(QaConfig::default().snapshot()),
            run: Box::new(TestRun::new(TestDescription::new("lookup/Join.td", Default::default()), "default")),
        }
    }

    #[test]
    fn test_start_and_kill_test_vm() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let vm = tmp.path().join("blocking-vm");
        std::fs::write(&vm, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&vm, std::fs::Permissions::from_mode(0o755)).unwrap();

        let harness = harness(vm.to_str().unwrap());
        let started: VmStarted = harness.handle(start_request()).into_result().unwrap();
        assert!(started.pid > 0);
        assert_eq!(harness.running_children(), 1);
        assert_eq!(harness.kill_children(), 1);
        assert_eq!(harness.running_children(), 0);
    }

    #[test]
    fn test_exited_vms_are_reaped() {
        let harness = harness("/bin/true");
        let _: VmStarted = harness.handle(start_request()).into_result().unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(harness.running_children(), 0);
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let harness = harness("/nonexistent/dth-vm");
        let err = harness
            .handle(start_request())
            .into_result::<VmStarted>()
            .unwrap_err();
        assert!(err.to_string().contains("failed to start"));
    }

    #[test]
    fn test_ping_answers_host_name() {
        let harness = harness("/bin/true");
        let host: String = harness.handle(HarnessRequest::Ping).into_result().unwrap();
        assert_eq!(host, local_host_name());
    }
}
