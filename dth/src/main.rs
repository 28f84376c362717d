//! Distributed Test Harness - Master Harness
//!
//! Loads the configuration layers and test descriptions, runs every test in
//! its own test VM (with slave test VMs on the other hosts), reruns eligible
//! failures and reports the results.

#![forbid(unsafe_code)]

mod collect;
mod layers;
mod runner;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dth_common::protocol::harness::{HarnessRequest, harness_endpoints};
use dth_common::protocol::{ConnectPolicy, request};
use dth_common::{DeletionList, HarnessSettings, LogConfig, TestList, init_logging};
use layers::ConfigLayers;
use runner::MasterHarness;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "dth")]
#[command(author, version, about = "Distributed Test Harness - master harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Property files and assignments forming the configuration layers.
#[derive(clap::Args)]
struct ConfigArgs {
    /// Default property file (lowest precedence)
    #[arg(long, env = "DTH_CONFIG")]
    config: Option<PathBuf>,

    /// Configuration-set property file
    #[arg(long)]
    config_set: Option<PathBuf>,

    /// User property file
    #[arg(long)]
    user: Option<PathBuf>,

    /// Structured configuration entry file (TOML); may be repeated
    #[arg(long = "entries")]
    entries: Vec<PathBuf>,

    /// Property assignment (key=value); may be repeated
    #[arg(short = 'D', value_name = "KEY=VALUE")]
    define: Vec<String>,
}

impl ConfigArgs {
    fn load(&self) -> Result<ConfigLayers> {
        ConfigLayers::load(
            self.config.as_deref(),
            self.config_set.as_deref(),
            self.user.as_deref(),
            &self.define,
            self.entries.clone(),
        )
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests
    Run {
        /// Test description files, directories or glob patterns
        #[arg(required = true)]
        tests: Vec<String>,

        #[command(flatten)]
        config: ConfigArgs,

        /// Root that test names are made relative to
        #[arg(long)]
        test_root: Option<PathBuf>,

        /// Only run tests in these categories; may be repeated
        #[arg(long = "category")]
        categories: Vec<String>,

        /// Configuration tag recorded with every run
        #[arg(long, default_value = "default")]
        tag: String,

        /// Write a JSON report of every run here
        #[arg(long)]
        report: Option<PathBuf>,

        /// Maximum reruns of a test that failed while running
        #[arg(long, default_value = "1")]
        retries: usize,

        /// Never rerun failed tests
        #[arg(long)]
        no_retries: bool,
    },

    /// Check that every slave harness answers
    Ping {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Delete files left behind by an interrupted run
    Clean,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let logging_guards = init_logging(&log_config)?;

    let (settings, errors) = HarnessSettings::from_env();
    for error in &errors {
        warn!(%error, "ignoring invalid harness setting");
    }

    let code = match cli.command {
        Commands::Run {
            tests,
            config,
            test_root,
            categories,
            tag,
            report,
            retries,
            no_retries,
        } => {
            let layers = config.load()?;
            let paths = collect::expand_paths(&tests)?;
            let mut list = TestList::new(!no_retries && retries > 0, retries);
            let added = collect::build_test_list(&paths, test_root.as_deref(), &categories, &tag, &mut list)?;
            if added == 0 {
                warn!("no tests selected");
            }
            MasterHarness::new(layers, settings, report).run(&mut list).await?
        }
        Commands::Ping { config } => {
            let layers = config.load()?;
            let base = layers.base_config(&settings)?;
            let endpoints = harness_endpoints(&base)?;
            tokio::task::spawn_blocking(move || ping(&endpoints))
                .await
                .context("ping task failed")?
        }
        Commands::Clean => {
            let deletions = DeletionList::default();
            let failures = deletions.process();
            info!(list = %deletions.path().display(), failures, "deletion list processed");
            i32::from(failures > 0)
        }
    };

    drop(logging_guards);
    std::process::exit(code);
}

fn ping(endpoints: &[String]) -> i32 {
    let policy = ConnectPolicy::once();
    let mut unreachable = 0;
    for endpoint in endpoints {
        match request::<_, String>(endpoint, &HarnessRequest::Ping, &policy) {
            Ok(host) => info!(%endpoint, %host, "slave harness answered"),
            Err(e) => {
                error!(%endpoint, error = %e, "slave harness did not answer");
                unreachable += 1;
            }
        }
    }
    info!(slaves = endpoints.len(), unreachable, "ping complete");
    i32::from(unreachable > 0)
}
