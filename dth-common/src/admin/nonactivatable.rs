//! Services started directly inside a group, without activation records.

use super::StartContext;
use super::activatable::ServiceCore;
use super::platform::{Platform, ServiceProxy, ServiceSpec};
use crate::config::QaConfig;
use crate::errors::{PlatformError, Result};

fn start_in_group(
    platform: &dyn Platform,
    spec: &ServiceSpec,
    group: &ServiceProxy,
) -> std::result::Result<ServiceProxy, PlatformError> {
    platform.start_service_in_group(spec, group)
}

#[derive(Debug)]
pub struct NonActivatableAdmin {
    core: ServiceCore,
}

impl NonActivatableAdmin {
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
        self.core.start(ctx, start_in_group)
    }

    pub fn stop(&mut self, config: &QaConfig, platform: &dyn Platform) -> Result<()> {
        self.core.stop(config, platform)
    }
}
