//! Configuration layers shared by every run of one invocation.

use anyhow::{Context, Result};
use dth_common::config::{Properties, load_properties, parse_assignments, system_properties};
use dth_common::{HarnessSettings, QaConfig, TestRun};
use std::path::{Path, PathBuf};

/// Property files and assignments read once; each run gets its own
/// [`QaConfig`] built from them.
#[derive(Debug, Clone, Default)]
pub struct ConfigLayers {
    pub defaults: Properties,
    pub config_set: Properties,
    pub user: Properties,
    pub command_line: Properties,
    pub system: Properties,
    pub entry_files: Vec<PathBuf>,
}

fn load_optional(path: Option<&Path>) -> Result<Properties> {
    match path {
        Some(path) => load_properties(path)
            .with_context(|| format!("failed to read property file {}", path.display())),
        None => Ok(Properties::new()),
    }
}

impl ConfigLayers {
    pub fn load(
        defaults: Option<&Path>,
        config_set: Option<&Path>,
        user: Option<&Path>,
        assignments: &[String],
        entry_files: Vec<PathBuf>,
    ) -> Result<Self> {
        for file in &entry_files {
            if !file.is_file() {
                anyhow::bail!("configuration entry file {} not found", file.display());
            }
        }
        Ok(Self {
            defaults: load_optional(defaults)?,
            config_set: load_optional(config_set)?,
            user: load_optional(user)?,
            command_line: parse_assignments(assignments),
            system: system_properties(),
            entry_files,
        })
    }

    /// Configuration without a test, used for host-level settings.
    pub fn base_config(&self, settings: &HarnessSettings) -> Result<QaConfig> {
        Ok(self.builder(settings).build()?)
    }

    pub fn run_config(&self, settings: &HarnessSettings, run: &TestRun) -> Result<QaConfig> {
        let config = self
            .builder(settings)
            .description(run.description.clone())
            .config_tag(run.config_tag.clone())
            .build()
            .with_context(|| format!("failed to configure {}", run.name()))?;
        Ok(config)
    }

    fn builder(&self, settings: &HarnessSettings) -> dth_common::QaConfigBuilder {
        let mut builder = QaConfig::builder()
            .defaults(self.defaults.clone())
            .config_set(self.config_set.clone())
            .user(self.user.clone())
            .command_line(self.command_line.clone())
            .system_properties(self.system.clone())
            .entry_files(self.entry_files.clone())
            .harness_archive(settings.harness_archive.clone())
            .test_archive(settings.test_archive.clone());
        for root in &settings.search_path {
            builder = builder.search_root(root);
        }
        builder
    }
}
