//! Per-process runtime state shared by every admin.

use crate::admin::activation_system::ActivationSystemAdmin;
use crate::admin::platform::Platform;
use crate::cleanup::DeletionList;
use crate::config::{HarnessSettings, QaConfig};
use crate::errors::{Result, TestException};
use crate::process::ProcessOrchestrator;
use std::sync::Arc;

/// Holds the platform, the process orchestrator, the deletion list and the
/// activation daemon, of which there is at most one per context.
#[derive(Debug)]
pub struct RuntimeContext {
    platform: Arc<dyn Platform>,
    orchestrator: ProcessOrchestrator,
    settings: HarnessSettings,
    deletions: Arc<DeletionList>,
    activation: ActivationSystemAdmin,
}

impl RuntimeContext {
    pub fn new(
        platform: Arc<dyn Platform>,
        orchestrator: ProcessOrchestrator,
        settings: HarnessSettings,
        deletions: Arc<DeletionList>,
    ) -> Self {
        Self {
            platform,
            orchestrator,
            settings,
            deletions,
            activation: ActivationSystemAdmin::new(),
        }
    }

    pub fn platform(&self) -> &dyn Platform {
        self.platform.as_ref()
    }

    pub fn orchestrator(&self) -> &ProcessOrchestrator {
        &self.orchestrator
    }

    pub fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    pub fn deletions(&self) -> &DeletionList {
        &self.deletions
    }

    pub fn activation(&self) -> &ActivationSystemAdmin {
        &self.activation
    }

    /// Start the activation daemon unless it is already running.
    pub fn ensure_activation_system(&mut self, config: &QaConfig) -> Result<String> {
        if !self.activation.is_running() {
            self.start_activation_system(config)?;
        }
        self.activation
            .endpoint()
            .map(str::to_string)
            .ok_or_else(|| TestException::new("activation system has no endpoint"))
    }

    /// Start the activation daemon; a second start is an error.
    pub fn start_activation_system(&mut self, config: &QaConfig) -> Result<()> {
        self.activation.start(
            config,
            self.platform.as_ref(),
            &self.orchestrator,
            &self.settings,
            &self.deletions,
        )
    }

    /// Stop the activation daemon, if running.
    pub fn stop_activation_system(&mut self, config: &QaConfig) {
        self.activation.stop(config, self.platform.as_ref());
    }
}
