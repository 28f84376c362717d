//! Distributed Test Harness - Test VM
//!
//! Started by a harness with a [`VmBootstrap`] on stdin. On the master host it
//! drives one test and reports a status line on stderr; on a slave host it
//! serves admin requests from the master test VM until told to tear down.
//! The `activation-daemon` subcommand runs the activation daemon used by
//! shared groups.

#![forbid(unsafe_code)]

mod daemon;
mod run;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dth_common::{LogConfig, init_logging};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dth-vm")]
#[command(author, version, about = "DTH test VM - runs one test from a bootstrap on stdin")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the activation daemon until interrupted
    ActivationDaemon {
        /// Port to accept liveness probes on
        #[arg(long, default_value = "1098")]
        port: u16,

        /// Persistence directory; receives the daemon's pid file
        #[arg(long)]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stderr carries the status line, so the test VM logs to stdout
    let mut log_config = LogConfig::from_env("info").with_stdout();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let logging_guards = init_logging(&log_config)?;

    let code = match cli.command {
        Some(Commands::ActivationDaemon { port, dir }) => daemon::run(port, &dir).await?,
        None => tokio::task::spawn_blocking(run::run_from_stdin).await??,
    };

    drop(logging_guards);
    std::process::exit(code);
}
