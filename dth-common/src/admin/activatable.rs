//! Services registered with the activation system.
//!
//! [`ServiceCore`] carries the lifecycle shared by activatable and
//! non-activatable services; the two differ only in how the platform is asked
//! to bring the service up.

use super::options::build_options;
use super::platform::{Platform, ServiceProxy, ServiceSpec, remarshal};
use super::shared_group::SharedGroupAdmin;
use super::{AdminState, GroupHandle, StartContext};
use crate::config::QaConfig;
use crate::errors::{PlatformError, Result, TestException, best_effort};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const UNREGISTER_WAIT_KEY: &str = "dth.serviceUnregisterWait";
pub const DEFAULT_UNREGISTER_WAIT_MS: i64 = 10_000;

pub(crate) type LaunchFn =
    fn(&dyn Platform, &ServiceSpec, &ServiceProxy) -> std::result::Result<ServiceProxy, PlatformError>;

#[derive(Debug)]
pub struct ServiceCore {
    prefix: String,
    index: usize,
    state: AdminState,
    proxy: Option<ServiceProxy>,
    group: Option<GroupHandle>,
}

impl ServiceCore {
    pub(crate) fn new(prefix: impl Into<String>, index: usize) -> Self {
        Self {
            prefix: prefix.into(),
            index,
            state: AdminState::Unstarted,
            proxy: None,
            group: None,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> AdminState {
        self.state
    }

    pub fn proxy(&self) -> Option<&ServiceProxy> {
        self.proxy.as_ref()
    }

    pub fn group(&self) -> Option<&GroupHandle> {
        self.group.as_ref()
    }

    pub(crate) fn group_mut(&mut self) -> Option<&mut GroupHandle> {
        self.group.as_mut()
    }

    pub(crate) fn start(&mut self, ctx: StartContext<'_>, launch: LaunchFn) -> Result<ServiceProxy> {
        if self.state != AdminState::Unstarted {
            return Err(TestException::new(format!(
                "{}[{}] has already been started",
                self.prefix, self.index
            )));
        }
        self.state = AdminState::Stopped;

        let options = build_options(ctx.config, &self.prefix, self.index, ctx.overrides)?;
        let implementation = ctx
            .config
            .get_service_param(&self.prefix, "impl", self.index)?
            .ok_or_else(|| {
                TestException::new(format!(
                    "no implementation configured for {}[{}]",
                    self.prefix, self.index
                ))
            })?;
        let spec = ServiceSpec {
            prefix: self.prefix.clone(),
            index: self.index,
            implementation,
            options,
        };

        let group = match ctx.shared_group {
            Some(proxy) => GroupHandle::Shared(proxy.clone()),
            None => {
                debug!(service = %self.prefix, index = self.index, "starting private group");
                let mut private = SharedGroupAdmin::new(self.index);
                private.start(ctx.config, ctx.runtime, ctx.overrides)?;
                GroupHandle::Owned(Box::new(private))
            }
        };

        let platform = ctx.runtime.platform();
        let started = group
            .proxy()
            .ok_or_else(|| TestException::new("group has no proxy"))
            .and_then(|g| {
                launch(platform, &spec, g).map_err(|e| {
                    TestException::with_cause(
                        format!("failed to start {}[{}]", self.prefix, self.index),
                        e,
                    )
                })
            })
            .and_then(|proxy| Ok(platform.prepare_proxy(remarshal(&proxy)?)?));

        match started {
            Ok(proxy) => {
                info!(service = %self.prefix, index = self.index, proxy = %proxy.id, "service started");
                self.proxy = Some(proxy.clone());
                self.group = Some(group);
                self.state = AdminState::Running;
                Ok(proxy)
            }
            Err(e) => {
                if let GroupHandle::Owned(mut private) = group {
                    best_effort("stop private group", private.stop(platform));
                }
                Err(e)
            }
        }
    }

    pub(crate) fn stop(&mut self, config: &QaConfig, platform: &dyn Platform) -> Result<()> {
        if self.state != AdminState::Running {
            return Ok(());
        }
        self.state = AdminState::Stopped;

        let wait_ms = config
            .get_long(UNREGISTER_WAIT_KEY, DEFAULT_UNREGISTER_WAIT_MS)
            .unwrap_or(DEFAULT_UNREGISTER_WAIT_MS);
        let wait = Duration::from_millis(u64::try_from(wait_ms).unwrap_or(0));
        let result = match self.proxy.take() {
            Some(proxy) => match platform.destroy_service(&proxy, wait) {
                Ok(()) => Ok(()),
                Err(PlatformError::NotFound(id)) => {
                    debug!(service = %id, "service already gone");
                    Ok(())
                }
                Err(e) => Err(TestException::with_cause(
                    format!("failed to destroy {}[{}]", self.prefix, self.index),
                    e,
                )),
            },
            None => Ok(()),
        };

        if let Some(GroupHandle::Owned(mut private)) = self.group.take() {
            best_effort("stop private group", private.stop(platform));
        }
        if let Err(e) = &result {
            warn!(service = %self.prefix, index = self.index, error = %e, "service stop failed");
        }
        result
    }
}

fn create_activatable(
    platform: &dyn Platform,
    spec: &ServiceSpec,
    group: &ServiceProxy,
) -> std::result::Result<ServiceProxy, PlatformError> {
    platform.create_activatable(spec, group)
}

/// A service registered with the activation system and hosted in a group.
#[derive(Debug)]
pub struct ActivatableAdmin {
    core: ServiceCore,
}

impl ActivatableAdmin {
    pub fn new(prefix: impl Into<String>, index: usize) -> Self {
        Self {
            core: ServiceCore::new(prefix, index),
        }
    }

    pub fn core(&self) -> &ServiceCore {
        &self.core
    }

    pub(crate) fn core_mut(&mut self) -> &mut ServiceCore {
        &mut self.core
    }

    pub fn start(&mut self, ctx: StartContext<'_>) -> Result<ServiceProxy> {
        self.core.start(ctx, create_activatable)
    }

    pub fn stop(&mut self, config: &QaConfig, platform: &dyn Platform) -> Result<()> {
        self.core.stop(config, platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::DeletionList;
    use crate::config::{HarnessSettings, parse_properties};
    use crate::context::RuntimeContext;
    use crate::pipe::OutputSink;
    use crate::process::ProcessOrchestrator;
    use crate::testing::RecordingPlatform;
    use std::sync::Arc;

    fn fixture() -> (QaConfig, RuntimeContext, Arc<RecordingPlatform>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let config = QaConfig::builder()
            .defaults(parse_properties(&format!(
                "dth.activation.type=external\n\
                 dth.activation.stopDelay=0\n\
                 dth.serviceUnregisterWait=0\n\
                 sharedGroup.persistenceRoot={}\n\
                 reggie.impl=Registrar\n",
                tmp.path().display()
            )))
            .build()
            .unwrap();
        let platform = Arc::new(RecordingPlatform::new());
        platform.set_daemon_alive(true);
        let runtime = RuntimeContext::new(
            platform.clone(),
            ProcessOrchestrator::new(OutputSink::buffer().0, OutputSink::buffer().0),
            HarnessSettings::default(),
            Arc::new(DeletionList::at(tmp.path().join("list.txt"))),
        );
        (config, runtime, platform, tmp)
    }

    #[test]
    fn test_stop_before_start_and_double_stop_are_noops() {
        let (config, mut runtime, platform, _tmp) = fixture();
        let mut admin = ActivatableAdmin::new("reggie", 0);
        admin.stop(&config, runtime.platform()).unwrap();
        assert_eq!(admin.core().state(), AdminState::Unstarted);

        let ctx = StartContext {
            config: &config,
            runtime: &mut runtime,
            shared_group: None,
            overrides: &[],
        };
        admin.start(ctx).unwrap();
        assert!(matches!(admin.core().group(), Some(GroupHandle::Owned(_))));
        admin.stop(&config, runtime.platform()).unwrap();
        admin.stop(&config, runtime.platform()).unwrap();
        assert_eq!(admin.core().state(), AdminState::Stopped);
        assert_eq!(
            platform.calls().iter().filter(|c| *c == "destroy_service").count(),
            1
        );
    }

    #[test]
    fn test_restart_after_stop_is_rejected() {
        let (config, mut runtime, _platform, _tmp) = fixture();
        let mut admin = ActivatableAdmin::new("reggie", 0);
        let ctx = StartContext {
            config: &config,
            runtime: &mut runtime,
            shared_group: None,
            overrides: &[],
        };
        admin.start(ctx).unwrap();
        admin.stop(&config, runtime.platform()).unwrap();
        let ctx = StartContext {
            config: &config,
            runtime: &mut runtime,
            shared_group: None,
            overrides: &[],
        };
        assert!(admin.start(ctx).is_err());
    }

    #[test]
    fn test_missing_implementation_is_an_error() {
        let (config, mut runtime, platform, _tmp) = fixture();
        let mut admin = ActivatableAdmin::new("mahalo", 0);
        let ctx = StartContext {
            config: &config,
            runtime: &mut runtime,
            shared_group: None,
            overrides: &[],
        };
        let err = admin.start(ctx).unwrap_err();
        assert!(err.message().contains("no implementation configured"));
        assert_eq!(platform.inner().group_count(), 0);
    }

    #[test]
    fn test_launch_failure_stops_private_group() {
        let (config, mut runtime, platform, _tmp) = fixture();
        platform.fail_on("create_activatable");
        let mut admin = ActivatableAdmin::new("reggie", 0);
        let ctx = StartContext {
            config: &config,
            runtime: &mut runtime,
            shared_group: None,
            overrides: &[],
        };
        assert!(admin.start(ctx).is_err());
        assert_eq!(admin.core().state(), AdminState::Stopped);
        assert_eq!(platform.inner().group_count(), 0);
    }
}
