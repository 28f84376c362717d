//! A hosting group that several services can share.

use super::AdminState;
use super::activation_system::remove_tree_with_retry;
use super::options::build_options;
use super::platform::{
    GroupSpec, KILLER_IMPLEMENTATION, Platform, ServiceProxy, ServiceSpec, remarshal,
};
use crate::cleanup::remove_path;
use crate::config::QaConfig;
use crate::context::RuntimeContext;
use crate::errors::{PlatformError, Result, TestException, best_effort};
use crate::protocol::OverrideProvider;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const SHARED_GROUP_PREFIX: &str = "sharedGroup";
pub const DEFAULT_GROUP_IMPLEMENTATION: &str = "dth.GroupImpl";
pub const ACTIVATION_ATTEMPTS_KEY: &str = "dth.activation.attempts";
pub const DEFAULT_ACTIVATION_ATTEMPTS: i32 = 30;

const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct SharedGroupAdmin {
    prefix: String,
    index: usize,
    state: AdminState,
    group: Option<ServiceProxy>,
    proxy: Option<ServiceProxy>,
    killer: Option<ServiceProxy>,
    persistence_dir: Option<PathBuf>,
}

impl SharedGroupAdmin {
    pub fn new(index: usize) -> Self {
        Self::with_prefix(SHARED_GROUP_PREFIX, index)
    }

    pub fn with_prefix(prefix: impl Into<String>, index: usize) -> Self {
        Self {
            prefix: prefix.into(),
            index,
            state: AdminState::Unstarted,
            group: None,
            proxy: None,
            killer: None,
            persistence_dir: None,
        }
    }

    pub fn state(&self) -> AdminState {
        self.state
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// The group itself, used as the placement target for other services.
    pub fn group(&self) -> Option<&ServiceProxy> {
        self.group.as_ref()
    }

    /// The group's implementation service.
    pub fn proxy(&self) -> Option<&ServiceProxy> {
        self.proxy.as_ref()
    }

    pub fn persistence_dir(&self) -> Option<&Path> {
        self.persistence_dir.as_deref()
    }

    pub fn start(
        &mut self,
        config: &QaConfig,
        runtime: &mut RuntimeContext,
        overrides: &[OverrideProvider],
    ) -> Result<ServiceProxy> {
        if self.state != AdminState::Unstarted {
            return Err(TestException::new(format!(
                "shared group {}[{}] cannot be started twice",
                self.prefix, self.index
            )));
        }
        self.state = AdminState::Stopped;

        let endpoint = runtime.ensure_activation_system(config)?;
        let attempts = config.get_int(ACTIVATION_ATTEMPTS_KEY, DEFAULT_ACTIVATION_ATTEMPTS)?;
        wait_for_daemon(runtime.platform(), &endpoint, attempts)?;

        let dir = self.create_persistence_dir(config, runtime)?;
        let vm_options = config
            .get_service_param(&self.prefix, "vmOptions", self.index)?
            .map(|o| o.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        let spec = GroupSpec {
            persistence_dir: dir.clone(),
            vm_options,
            activation_endpoint: endpoint,
        };

        let platform = runtime.platform();
        let group = match platform.create_group(&spec) {
            Ok(group) => group,
            Err(e) => {
                best_effort("remove group directory", remove_path(&dir));
                return Err(activation_failure("group creation failed", e));
            }
        };

        match self.start_implementation(config, platform, &group, overrides) {
            Ok(proxy) => {
                info!(group = %group.id, service = %proxy.id, "shared group started");
                self.group = Some(group);
                self.proxy = Some(proxy.clone());
                self.state = AdminState::Running;
                Ok(proxy)
            }
            Err(e) => {
                best_effort("destroy half-started group", platform.destroy_group_vm(&group));
                best_effort("remove group directory", remove_path(&dir));
                self.persistence_dir = None;
                Err(e)
            }
        }
    }

    fn create_persistence_dir(&mut self, config: &QaConfig, runtime: &RuntimeContext) -> Result<PathBuf> {
        let root = config
            .get_service_param(&self.prefix, "persistenceRoot", self.index)?
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        let dir = root.join(format!("dth-group-{}", uuid::Uuid::new_v4()));
        remove_path(&dir)?;
        std::fs::create_dir_all(&dir).map_err(|e| {
            TestException::with_cause(
                format!("cannot create group persistence directory {}", dir.display()),
                e,
            )
        })?;
        best_effort("register group directory", runtime.deletions().register(&dir));
        debug!(dir = %dir.display(), "group persistence directory created");
        self.persistence_dir = Some(dir.clone());
        Ok(dir)
    }

    fn start_implementation(
        &self,
        config: &QaConfig,
        platform: &dyn Platform,
        group: &ServiceProxy,
        overrides: &[OverrideProvider],
    ) -> Result<ServiceProxy> {
        let implementation = config
            .get_service_param(&self.prefix, "impl", self.index)?
            .unwrap_or_else(|| DEFAULT_GROUP_IMPLEMENTATION.to_string());
        let spec = ServiceSpec {
            prefix: self.prefix.clone(),
            index: self.index,
            implementation,
            options: build_options(config, &self.prefix, self.index, overrides)?,
        };
        let proxy = platform
            .start_service_in_group(&spec, group)
            .map_err(|e| activation_failure("group implementation failed to start", e))?;
        Ok(platform.prepare_proxy(remarshal(&proxy)?)?)
    }

    /// Kill the group's VM through a killer service started on first use.
    /// The killer is cached and the group stays Running; `stop` cleans up.
    pub fn kill_vm(&mut self, platform: &dyn Platform) -> Result<()> {
        let Some(group) = self.group.as_ref().filter(|_| self.state == AdminState::Running) else {
            return Err(TestException::new(format!(
                "shared group {}[{}] is not running",
                self.prefix, self.index
            )));
        };
        let killer = match &self.killer {
            Some(killer) => killer.clone(),
            None => {
                let spec = ServiceSpec {
                    prefix: self.prefix.clone(),
                    index: self.index,
                    implementation: KILLER_IMPLEMENTATION.to_string(),
                    options: Vec::new(),
                };
                let killer = platform
                    .start_service_in_group(&spec, group)
                    .map_err(|e| activation_failure("killer service failed to start", e))?;
                self.killer = Some(killer.clone());
                killer
            }
        };
        platform
            .kill_vm(&killer)
            .map_err(|e| activation_failure("group VM kill failed", e))?;
        warn!(group = %group.id, "shared group VM killed");
        Ok(())
    }

    /// Destroy the group VM. Safe before start and when already stopped.
    pub fn stop(&mut self, platform: &dyn Platform) -> Result<()> {
        if self.state != AdminState::Running {
            return Ok(());
        }
        self.state = AdminState::Stopped;
        self.proxy = None;
        if let Some(killer) = self.killer.take() {
            best_effort("destroy killer service", platform.destroy_service(&killer, Duration::ZERO));
        }
        let result = match self.group.take() {
            Some(group) => platform
                .destroy_group_vm(&group)
                .map_err(|e| activation_failure("group VM destroy failed", e)),
            None => Ok(()),
        };
        self.remove_persistence_dir();
        info!(prefix = %self.prefix, index = self.index, "shared group stopped");
        result
    }

    fn remove_persistence_dir(&mut self) {
        if let Some(dir) = self.persistence_dir.take() {
            remove_tree_with_retry(&dir);
        }
    }
}

fn wait_for_daemon(platform: &dyn Platform, endpoint: &str, attempts: i32) -> Result<()> {
    if platform.daemon_alive(endpoint) {
        return Ok(());
    }
    for attempt in 1..=attempts.max(0) {
        thread::sleep(LIVENESS_INTERVAL);
        if platform.daemon_alive(endpoint) {
            debug!(attempt, "activation system became reachable");
            return Ok(());
        }
    }
    Err(TestException::new(format!(
        "activation system at {endpoint} is not reachable"
    )))
}

fn activation_failure(context: &str, err: PlatformError) -> TestException {
    TestException::with_cause(context, err)
}
