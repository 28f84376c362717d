//! Requests from the master harness to slave harnesses.

use super::{ConnectPolicy, request};
use crate::config::{ConfigSnapshot, QaConfig};
use crate::errors::{Result, TestException};
use crate::results::TestRun;
use crate::types::{HARNESS_REQUEST_PORT, HostEntry};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Config key: port slave harnesses listen on.
pub const HARNESS_PORT_KEY: &str = "dth.harnessRequestPort";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum HarnessRequest {
    /// Start the slave test VM for `run` with the master's configuration.
    StartTestVm {
        snapshot: Box<ConfigSnapshot>,
        run: Box<TestRun>,
    },
    Ping,
}

/// Reply to [`HarnessRequest::StartTestVm`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmStarted {
    pub host: String,
    pub pid: u32,
}

pub fn harness_port(config: &QaConfig) -> Result<u16> {
    let port = config.get_int(HARNESS_PORT_KEY, i32::from(HARNESS_REQUEST_PORT))?;
    Ok(u16::try_from(port).unwrap_or(HARNESS_REQUEST_PORT))
}

/// Harness endpoints of every slave host. Ports in the host list address the
/// slave test VM, so they are not used here.
pub fn harness_endpoints(config: &QaConfig) -> Result<Vec<String>> {
    let port = harness_port(config)?;
    Ok(config
        .hosts()?
        .iter()
        .skip(1)
        .map(|h| {
            HostEntry {
                host: h.host.clone(),
                port: None,
            }
            .endpoint(port)
        })
        .collect())
}

/// Ask every slave harness to start its test VM for `run`. Unlike
/// broadcasts, any failure aborts: the test cannot run without its slaves.
pub fn start_slave_vms(config: &QaConfig, run: &TestRun) -> Result<Vec<VmStarted>> {
    let policy = ConnectPolicy::from_config(config)?;
    let req = HarnessRequest::StartTestVm {
        snapshot: Box::new(config.snapshot()),
        run: Box::new(run.clone()),
    };
    harness_endpoints(config)?
        .iter()
        .map(|endpoint| {
            let started: VmStarted = request(endpoint, &req, &policy).map_err(|e| {
                TestException::with_cause(format!("slave harness {endpoint} did not start its VM"), e)
            })?;
            info!(host = %started.host, pid = started.pid, test = run.name(), "slave test VM started");
            Ok(started)
        })
        .collect()
}
