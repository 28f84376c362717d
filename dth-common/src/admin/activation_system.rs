//! The activation daemon, at most one per runtime context.

use super::AdminState;
use super::platform::Platform;
use crate::cleanup::{DeletionList, remove_path};
use crate::config::{HarnessSettings, QaConfig};
use crate::errors::{Result, TestException, best_effort};
use crate::process::{ManagedChild, ProcessOrchestrator, VmCommand};
use crate::types::ACTIVATION_START_TIMEOUT;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const ACTIVATION_TYPE_KEY: &str = "dth.activation.type";
pub const ACTIVATION_PROGRAM_KEY: &str = "dth.activation.program";
pub const ACTIVATION_OPTIONS_KEY: &str = "dth.activation.options";
pub const ACTIVATION_PORT_KEY: &str = "dth.activation.port";
pub const ACTIVATION_TIMEOUT_KEY: &str = "dth.activation.timeout";
pub const ACTIVATION_STOP_DELAY_KEY: &str = "dth.activation.stopDelay";
pub const ACTIVATION_DIR_KEY: &str = "dth.activation.persistenceDir";

pub const DEFAULT_ACTIVATION_PORT: u16 = 1098;
pub const DEFAULT_STOP_DELAY_MS: i64 = 5000;

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const DELETE_ATTEMPTS: u32 = 10;
const DELETE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// How the daemon is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonKind {
    /// A dedicated daemon executable (`dth.activation.program`).
    Native,
    /// The harness's own VM binary in daemon mode.
    Vm,
    /// Started and owned outside the harness; only probed.
    External,
}

impl DaemonKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "native" => Some(Self::Native),
            "vm" => Some(Self::Vm),
            "external" => Some(Self::External),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct ActivationSystemAdmin {
    state: AdminState,
    endpoint: Option<String>,
    child: Option<ManagedChild>,
    persistence_dir: Option<PathBuf>,
}

impl Default for ActivationSystemAdmin {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivationSystemAdmin {
    pub fn new() -> Self {
        Self {
            state: AdminState::Unstarted,
            endpoint: None,
            child: None,
            persistence_dir: None,
        }
    }

    pub fn state(&self) -> AdminState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == AdminState::Running
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn persistence_dir(&self) -> Option<&Path> {
        self.persistence_dir.as_deref()
    }

    pub fn start(
        &mut self,
        config: &QaConfig,
        platform: &dyn Platform,
        orchestrator: &ProcessOrchestrator,
        settings: &HarnessSettings,
        deletions: &DeletionList,
    ) -> Result<()> {
        if self.state != AdminState::Unstarted {
            return Err(TestException::new(
                "the activation system has already been started in this runtime",
            ));
        }
        // From here on a failed start leaves the admin Stopped; it is not retried.
        self.state = AdminState::Stopped;

        let port = config.get_int(ACTIVATION_PORT_KEY, i32::from(DEFAULT_ACTIVATION_PORT))?;
        let endpoint = format!("localhost:{port}");
        let kind_raw = config.get_string(ACTIVATION_TYPE_KEY, "vm")?;
        let kind = DaemonKind::parse(&kind_raw).ok_or_else(|| {
            TestException::new(format!("unknown activation system type '{kind_raw}'"))
        })?;

        if kind != DaemonKind::External && platform.daemon_alive(&endpoint) {
            warn!(%endpoint, "stale activation daemon found; shutting it down");
            best_effort("stale daemon shutdown", platform.shutdown_daemon(&endpoint));
        }

        if kind != DaemonKind::External {
            let dir = match config.get_opt(ACTIVATION_DIR_KEY)? {
                Some(dir) => PathBuf::from(dir),
                None => std::env::temp_dir().join(format!("dth-actsys-{}", uuid::Uuid::new_v4())),
            };
            std::fs::create_dir_all(&dir).map_err(|e| {
                TestException::with_cause(
                    format!("cannot create activation log directory {}", dir.display()),
                    e,
                )
            })?;
            best_effort("register activation directory", deletions.register(&dir));

            let spawned = daemon_command(config, kind, port, &dir, settings).and_then(|command| {
                info!(command = %command.command_line(), "starting activation system");
                orchestrator.spawn(command)
            });
            match spawned {
                Ok(child) => {
                    self.child = Some(child);
                    self.persistence_dir = Some(dir);
                }
                Err(e) => {
                    remove_tree_with_retry(&dir);
                    return Err(e);
                }
            }
        }
        self.state = AdminState::Running;
        self.endpoint = Some(endpoint.clone());

        let limit_secs = config.get_long(
            ACTIVATION_TIMEOUT_KEY,
            i64::try_from(ACTIVATION_START_TIMEOUT.as_secs()).unwrap_or(60),
        )?;
        let limit = Duration::from_secs(u64::try_from(limit_secs).unwrap_or(0));
        if let Err(e) = self.wait_until_alive(platform, &endpoint, limit) {
            self.state = AdminState::Stopped;
            self.endpoint = None;
            self.kill_child();
            if let Some(dir) = self.persistence_dir.take() {
                remove_tree_with_retry(&dir);
            }
            return Err(e);
        }
        info!(%endpoint, "activation system is up");
        Ok(())
    }

    fn wait_until_alive(&self, platform: &dyn Platform, endpoint: &str, limit: Duration) -> Result<()> {
        let deadline = Instant::now() + limit;
        loop {
            if platform.daemon_alive(endpoint) {
                return Ok(());
            }
            if let Some(child) = &self.child
                && let Ok(Some(status)) = child.try_wait()
            {
                return Err(TestException::new(format!(
                    "activation system exited during startup ({status})"
                )));
            }
            if Instant::now() >= deadline {
                return Err(TestException::new(format!(
                    "activation system at {endpoint} did not become reachable within {}s",
                    limit.as_secs()
                )));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn kill_child(&mut self) {
        if let Some(child) = self.child.take() {
            best_effort("kill activation system", child.kill());
            best_effort("reap activation system", child.wait());
        }
    }

    /// Shut the daemon down. Safe before start and when already stopped.
    pub fn stop(&mut self, config: &QaConfig, platform: &dyn Platform) {
        if self.state != AdminState::Running {
            return;
        }
        self.state = AdminState::Stopped;

        let delay_ms = config
            .get_long(ACTIVATION_STOP_DELAY_KEY, DEFAULT_STOP_DELAY_MS)
            .unwrap_or(DEFAULT_STOP_DELAY_MS);
        if delay_ms > 0 {
            debug!(delay_ms, "waiting before activation system shutdown");
            thread::sleep(Duration::from_millis(u64::try_from(delay_ms).unwrap_or(0)));
        }
        if let Some(endpoint) = self.endpoint.take()
            && self.child.is_some()
        {
            best_effort("activation system shutdown", platform.shutdown_daemon(&endpoint));
        }
        self.kill_child();
        if let Some(dir) = self.persistence_dir.take() {
            remove_tree_with_retry(&dir);
        }
        info!("activation system stopped");
    }
}

fn daemon_command(
    config: &QaConfig,
    kind: DaemonKind,
    port: i32,
    dir: &Path,
    settings: &HarnessSettings,
) -> Result<VmCommand> {
    let options: Vec<String> = config
        .get_opt(ACTIVATION_OPTIONS_KEY)?
        .map(|o| o.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    let command = match kind {
        DaemonKind::Native => VmCommand::new(config.require_string(ACTIVATION_PROGRAM_KEY)?)
            .args(options),
        DaemonKind::Vm => {
            let program = config
                .get_opt(ACTIVATION_PROGRAM_KEY)?
                .map(PathBuf::from)
                .unwrap_or_else(|| settings.vm_binary.clone());
            VmCommand::new(program)
                .arg("activation-daemon")
                .args(["--port".to_string(), port.to_string()])
                .args(["--dir".to_string(), dir.display().to_string()])
                .args(options)
        }
        DaemonKind::External => {
            return Err(TestException::new("external activation systems are not spawned"));
        }
    };
    Ok(command.annotation("ActSys: "))
}

/// Remove `dir`, retrying while the OS still holds files open.
pub fn remove_tree_with_retry(dir: &Path) -> bool {
    for attempt in 1..=DELETE_ATTEMPTS {
        match remove_path(dir) {
            Ok(()) => return true,
            Err(e) if attempt == DELETE_ATTEMPTS => {
                warn!(dir = %dir.display(), error = %e, "giving up deleting directory");
            }
            Err(e) => {
                debug!(dir = %dir.display(), attempt, error = %e, "delete failed, retrying");
                thread::sleep(DELETE_RETRY_DELAY);
            }
        }
    }
    false
}
