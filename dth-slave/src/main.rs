//! Distributed Test Harness - Slave Harness
//!
//! Runs on every slave host. It starts slave test VMs when the master asks
//! and holds a keep-alive connection to the master; when that connection
//! ends it kills its test VMs, cleans up and exits.

#![forbid(unsafe_code)]

mod harness;

use anyhow::{Context, Result};
use clap::Parser;
use dth_common::keepalive::{self, KeepAliveEnd};
use dth_common::protocol::harness::HarnessRequest;
use dth_common::protocol::{ConnectPolicy, RequestListener};
use dth_common::types::{HARNESS_REQUEST_PORT, HostEntry, KEEPALIVE_PORT};
use dth_common::{DeletionList, HarnessSettings, LogConfig, ProcessOrchestrator, init_logging};
use harness::SlaveHarness;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "dth-slave")]
#[command(author, version, about = "DTH slave harness - starts slave test VMs for the master")]
struct Cli {
    /// Master host, optionally with its keep-alive port (host[:port])
    #[arg(short, long, env = "DTH_MASTER")]
    master: String,

    /// Port to accept harness requests on
    #[arg(long, default_value_t = HARNESS_REQUEST_PORT)]
    port: u16,

    /// Seconds between keep-alive connection attempts
    #[arg(long, default_value = "1")]
    connect_interval: u64,

    /// Keep-alive connection attempts before giving up
    #[arg(long, default_value = "30")]
    connect_attempts: u32,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let logging_guards = init_logging(&log_config)?;

    let code = run(cli).await?;

    drop(logging_guards);
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let deletions = DeletionList::default();
    let failures = deletions.process();
    if failures > 0 {
        warn!(failures, "leftovers of an earlier run could not be deleted");
    }

    let (settings, errors) = HarnessSettings::from_env();
    for error in &errors {
        warn!(%error, "ignoring invalid harness setting");
    }

    let master = HostEntry::parse(&cli.master).context("master host must not be empty")?;
    let keepalive_endpoint = master.endpoint(KEEPALIVE_PORT);
    let policy = ConnectPolicy {
        interval: Duration::from_secs(cli.connect_interval),
        attempts: cli.connect_attempts.max(1),
    };

    let harness = Arc::new(SlaveHarness::new(settings, ProcessOrchestrator::default()));
    let handler = Arc::clone(&harness);
    let listener = RequestListener::bind(
        "harness-request",
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, cli.port)),
        move |request: HarnessRequest| Some(handler.handle(request)),
    )
    .with_context(|| format!("failed to listen for harness requests on port {}", cli.port))?;
    info!(port = cli.port, master = %keepalive_endpoint, "slave harness ready");

    let code = tokio::select! {
        end = keepalive::monitor(&keepalive_endpoint, &policy) => match end {
            Ok(KeepAliveEnd::Eof) => {
                info!("master closed the keep-alive connection");
                0
            }
            Ok(KeepAliveEnd::Error(reason)) => {
                warn!(%reason, "keep-alive connection failed");
                1
            }
            Err(e) => {
                error!(error = %e, "could not reach the master");
                1
            }
        },
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
            info!("interrupted");
            0
        }
    };

    let cleanup = tokio::task::spawn_blocking(move || {
        listener.shutdown();
        let killed = harness.kill_children();
        let failures = deletions.process();
        (killed, failures)
    });
    let (killed, failures) = cleanup.await.context("slave cleanup task failed")?;
    info!(killed, cleanup_failures = failures, code, "slave harness exiting");
    Ok(code)
}
