//! Spawning and supervising child processes (test VMs, daemons).

use crate::config::{ConfigSnapshot, HarnessSettings, QaConfig};
use crate::errors::{Result, TestException};
use crate::pipe::{OutputSink, Pipe};
use crate::results::{TestResult, TestRun};
use crate::timeout::{Timeout, TimeoutAction};
use crate::types::FailureType;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Config key: seconds a test VM may run before it is killed.
pub const TEST_TIMEOUT_KEY: &str = "dth.testTimeout";
pub const DEFAULT_TEST_TIMEOUT_SECS: i64 = 3600;

const WAIT_POLL: Duration = Duration::from_millis(50);

/// Everything needed to start one child process.
#[derive(Debug, Clone, Default)]
pub struct VmCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Prefix for every forwarded output line.
    pub annotation: Option<String>,
    /// Written to the child's stdin right after spawn, then stdin is closed.
    pub stdin: Option<Vec<u8>>,
}

impl VmCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }

    pub fn stdin(mut self, payload: Vec<u8>) -> Self {
        self.stdin = Some(payload);
        self
    }

    /// Program and arguments as one display string.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Spawns children with their output pumped into this process's sinks.
#[derive(Debug, Clone)]
pub struct ProcessOrchestrator {
    stdout: OutputSink,
    stderr: OutputSink,
}

impl Default for ProcessOrchestrator {
    fn default() -> Self {
        Self::new(OutputSink::stdout(), OutputSink::stderr())
    }
}

impl ProcessOrchestrator {
    pub fn new(stdout: OutputSink, stderr: OutputSink) -> Self {
        Self { stdout, stderr }
    }

    /// Start `cmd`. The child's stderr is scanned for a status line.
    pub fn spawn(&self, cmd: VmCommand) -> Result<ManagedChild> {
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &cmd.workdir {
            command.current_dir(dir);
        }
        for (key, value) in &cmd.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            TestException::with_cause(format!("failed to start {}", cmd.command_line()), e)
        })?;
        let pid = child.id();
        info!(pid, command = %cmd.command_line(), "spawned child process");

        if let (Some(payload), Some(stdin)) = (cmd.stdin, child.stdin.take()) {
            write_stdin(pid, stdin, payload)?;
        }

        let stdout_pipe = match child.stdout.take() {
            Some(out) => Some(Pipe::spawn(
                format!("{pid}-out"),
                out,
                self.stdout.clone(),
                cmd.annotation.clone(),
                false,
            )?),
            None => None,
        };
        let stderr_pipe = match child.stderr.take() {
            Some(err) => Some(Pipe::spawn(
                format!("{pid}-err"),
                err,
                self.stderr.clone(),
                cmd.annotation.clone(),
                true,
            )?),
            None => None,
        };

        Ok(ManagedChild {
            pid,
            child: Arc::new(Mutex::new(child)),
            stdout_pipe,
            stderr_pipe,
        })
    }
}

fn write_stdin(pid: u32, mut stdin: impl Write + Send + 'static, payload: Vec<u8>) -> Result<()> {
    thread::Builder::new()
        .name(format!("dth-stdin-{pid}"))
        .spawn(move || {
            if let Err(e) = stdin.write_all(&payload).and_then(|()| stdin.flush()) {
                warn!(pid, error = %e, "failed to write bootstrap payload to child");
            }
        })?;
    Ok(())
}

/// Final state of a child process.
#[derive(Debug)]
pub struct ChildOutcome {
    pub status: ExitStatus,
    /// Status line captured from stderr, if the child wrote one.
    pub status_line: Option<String>,
}

/// A running child with its output pumps.
pub struct ManagedChild {
    pid: u32,
    child: Arc<Mutex<Child>>,
    stdout_pipe: Option<Pipe>,
    stderr_pipe: Option<Pipe>,
}

impl std::fmt::Debug for ManagedChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedChild").field("pid", &self.pid).finish()
    }
}

impl ManagedChild {
    pub fn id(&self) -> u32 {
        self.pid
    }

    /// Shared handle for [`TimeoutAction::KillChild`].
    pub fn handle(&self) -> Arc<Mutex<Child>> {
        Arc::clone(&self.child)
    }

    pub fn kill(&self) -> io::Result<()> {
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        match child.try_wait()? {
            Some(_) => Ok(()),
            None => child.kill(),
        }
    }

    pub fn try_wait(&self) -> io::Result<Option<ExitStatus>> {
        self.child
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .try_wait()
    }

    /// Wait for exit, then drain the output pumps.
    pub fn wait(mut self) -> Result<ChildOutcome> {
        let status = loop {
            if let Some(status) = self.try_wait()? {
                break status;
            }
            thread::sleep(WAIT_POLL);
        };
        if let Some(pipe) = self.stdout_pipe.take() {
            pipe.join();
        }
        let status_line = self.stderr_pipe.take().and_then(Pipe::join);
        debug!(pid = self.pid, %status, "child exited");
        Ok(ChildOutcome {
            status,
            status_line,
        })
    }
}

/// The payload a test VM reads from stdin before doing anything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmBootstrap {
    pub snapshot: ConfigSnapshot,
    pub run: TestRun,
}

impl VmBootstrap {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| TestException::with_cause("failed to encode test VM bootstrap", e))
    }

    /// Read the bootstrap object (until EOF).
    pub fn read_from(reader: impl Read) -> Result<Self> {
        serde_json::from_reader(reader)
            .map_err(|e| TestException::with_cause("failed to read test VM bootstrap", e))
    }
}

/// Start a test VM for `run` without waiting for it.
pub fn spawn_test_vm(
    orchestrator: &ProcessOrchestrator,
    settings: &HarnessSettings,
    config: &QaConfig,
    run: &TestRun,
    annotation: Option<&str>,
) -> Result<ManagedChild> {
    let bootstrap = VmBootstrap {
        snapshot: config.snapshot(),
        run: run.clone(),
    };
    let mut cmd = VmCommand::new(&settings.vm_binary).stdin(bootstrap.encode()?);
    if let Some(dir) = run.description.dir() {
        cmd = cmd.workdir(dir);
    }
    if let Some(annotation) = annotation {
        cmd = cmd.annotation(annotation);
    }
    orchestrator.spawn(cmd)
}

/// Run one test VM to completion under the configured test timeout.
pub fn launch_test_vm(
    orchestrator: &ProcessOrchestrator,
    settings: &HarnessSettings,
    config: &QaConfig,
    run: &TestRun,
) -> Result<TestResult> {
    let timeout_secs = config
        .get_long(TEST_TIMEOUT_KEY, DEFAULT_TEST_TIMEOUT_SECS)?
        .max(1);
    let limit = Duration::from_secs(u64::try_from(timeout_secs).unwrap_or(1));

    let started = Instant::now();
    info!(test = run.name(), tag = %run.config_tag, rerun = run.rerun, "launching test VM");
    let child = spawn_test_vm(orchestrator, settings, config, run, None)?;
    let timeout = Timeout::start(limit, TimeoutAction::KillChild(child.handle()));
    let outcome = child.wait()?;
    let timed_out = !timeout.cancel();

    Ok(classify_outcome(&outcome, timed_out, limit, started.elapsed()))
}

/// Turn a finished VM into a result.
pub fn classify_outcome(
    outcome: &ChildOutcome,
    timed_out: bool,
    limit: Duration,
    elapsed: Duration,
) -> TestResult {
    if timed_out {
        warn!(?limit, "test VM killed after timeout");
        return TestResult::fail(
            FailureType::Indef,
            format!("test timed out after {}s", limit.as_secs()),
            elapsed,
        );
    }
    match outcome.status_line.as_deref().and_then(TestResult::from_status_line) {
        Some(result) => result,
        None => TestResult::fail(
            FailureType::Env,
            format!("test VM exited ({}) without reporting a result", outcome.status),
            elapsed,
        ),
    }
}
