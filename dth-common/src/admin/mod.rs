//! Service admins and the per-VM admin manager.
//!
//! An admin owns the lifecycle of one managed entity: an activatable or
//! non-activatable service, a shared group, or the activation daemon. Every
//! admin moves `Unstarted → Running → Stopped` and is never reused after it
//! stops. `stop` is safe before `start` and idempotent.
//!
//! The [`AdminManager`] creates admins from configuration, tracks instance
//! indices per prefix and answers [`SlaveRequest`]s received over the wire.

pub mod activatable;
pub mod activation_system;
pub mod nonactivatable;
pub mod options;
pub mod platform;
pub mod shared_group;

pub use activatable::{ActivatableAdmin, ServiceCore};
pub use activation_system::ActivationSystemAdmin;
pub use nonactivatable::NonActivatableAdmin;
pub use platform::{
    GroupSpec, KILLER_IMPLEMENTATION, LocalPlatform, Platform, ProxyKind, ServiceProxy,
    ServiceSpec,
};
pub use shared_group::SharedGroupAdmin;

use crate::config::QaConfig;
use crate::context::RuntimeContext;
use crate::errors::{Result, TestException, best_effort};
use crate::protocol::{AdminQuery, OverrideProvider, Reply, ServiceRef, SlaveRequest};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Config key: host every service in one group per VM instead of one
/// private group per service.
pub const SHARED_GROUPS_KEY: &str = "dth.sharedGroups";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminState {
    Unstarted,
    Running,
    Stopped,
}

/// The `type` service parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    Activatable,
    NonActivatable,
    Group,
    ActivationSystem,
}

impl ServiceType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "activatable" => Some(Self::Activatable),
            "nonactivatable" => Some(Self::NonActivatable),
            "group" | "sharedgroup" => Some(Self::Group),
            "activationsystem" => Some(Self::ActivationSystem),
            _ => None,
        }
    }
}

/// Where a service's group comes from.
#[derive(Debug)]
pub enum GroupHandle {
    /// The manager's shared group; not stopped with the service.
    Shared(ServiceProxy),
    /// A private group stopped whenever the owning admin stops.
    Owned(Box<SharedGroupAdmin>),
}

impl GroupHandle {
    /// Placement target for services hosted in this group.
    pub fn proxy(&self) -> Option<&ServiceProxy> {
        match self {
            Self::Shared(proxy) => Some(proxy),
            Self::Owned(admin) => admin.group(),
        }
    }
}

/// Borrowed state an admin needs while starting.
pub struct StartContext<'a> {
    pub config: &'a QaConfig,
    pub runtime: &'a mut RuntimeContext,
    pub shared_group: Option<&'a ServiceProxy>,
    pub overrides: &'a [OverrideProvider],
}

#[derive(Debug)]
pub enum ServiceAdmin {
    Activatable(ActivatableAdmin),
    NonActivatable(NonActivatableAdmin),
    SharedGroup(SharedGroupAdmin),
    /// Delegates to the runtime context's singleton daemon.
    ActivationSystem,
}

impl ServiceAdmin {
    pub fn state(&self, runtime: &RuntimeContext) -> AdminState {
        match self {
            Self::Activatable(a) => a.core().state(),
            Self::NonActivatable(a) => a.core().state(),
            Self::SharedGroup(g) => g.state(),
            Self::ActivationSystem => runtime.activation().state(),
        }
    }

    pub fn proxy(&self) -> Option<&ServiceProxy> {
        match self {
            Self::Activatable(a) => a.core().proxy(),
            Self::NonActivatable(a) => a.core().proxy(),
            Self::SharedGroup(g) => g.proxy(),
            Self::ActivationSystem => None,
        }
    }

    pub fn stop(&mut self, config: &QaConfig, runtime: &mut RuntimeContext) -> Result<()> {
        match self {
            Self::Activatable(a) => a.stop(config, runtime.platform()),
            Self::NonActivatable(a) => a.stop(config, runtime.platform()),
            Self::SharedGroup(g) => g.stop(runtime.platform()),
            Self::ActivationSystem => {
                runtime.stop_activation_system(config);
                Ok(())
            }
        }
    }

    fn private_group_mut(&mut self) -> Option<&mut SharedGroupAdmin> {
        let core = match self {
            Self::Activatable(a) => a.core_mut(),
            Self::NonActivatable(a) => a.core_mut(),
            Self::SharedGroup(g) => return Some(g),
            Self::ActivationSystem => return None,
        };
        match core.group_mut() {
            Some(GroupHandle::Owned(group)) => Some(group.as_mut()),
            _ => None,
        }
    }
}

/// What a caller gets back for a started service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service: ServiceRef,
    pub proxy: ServiceProxy,
    pub host: String,
}

#[derive(Debug)]
struct ManagedAdmin {
    info: ServiceInfo,
    admin: ServiceAdmin,
}

/// Owns every admin started in this VM.
#[derive(Debug)]
pub struct AdminManager {
    config: QaConfig,
    runtime: RuntimeContext,
    admins: Vec<ManagedAdmin>,
    next_index: HashMap<String, usize>,
    shared_group: Option<SharedGroupAdmin>,
    overrides: Vec<OverrideProvider>,
}

impl AdminManager {
    pub fn new(config: QaConfig, runtime: RuntimeContext) -> Self {
        Self {
            config,
            runtime,
            admins: Vec::new(),
            next_index: HashMap::new(),
            shared_group: None,
            overrides: Vec::new(),
        }
    }

    pub fn config(&self) -> &QaConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut QaConfig {
        &mut self.config
    }

    pub fn runtime(&self) -> &RuntimeContext {
        &self.runtime
    }

    pub fn override_providers(&self) -> &[OverrideProvider] {
        &self.overrides
    }

    pub fn register_override_provider(&mut self, provider: OverrideProvider) {
        debug!(prefix = ?provider.prefix, entries = provider.overrides.len(), "override provider registered");
        self.overrides.push(provider);
    }

    /// Start the next instance of the service configured under `prefix`.
    pub fn start_service(&mut self, prefix: &str) -> Result<ServiceInfo> {
        let index = self.next_index.get(prefix).copied().unwrap_or(0);
        let raw_type = self
            .config
            .get_service_param(prefix, "type", index)?
            .ok_or_else(|| TestException::new(format!("no service type configured for '{prefix}'")))?;
        let service_type = ServiceType::parse(&raw_type).ok_or_else(|| {
            TestException::new(format!("unknown service type '{raw_type}' for '{prefix}'"))
        })?;
        let service = ServiceRef {
            prefix: prefix.to_string(),
            index,
        };
        info!(%service, ?service_type, "starting service");

        let (admin, proxy) = match service_type {
            ServiceType::Activatable | ServiceType::NonActivatable => {
                self.ensure_shared_group()?;
                let ctx = StartContext {
                    config: &self.config,
                    runtime: &mut self.runtime,
                    shared_group: self.shared_group.as_ref().and_then(SharedGroupAdmin::group),
                    overrides: &self.overrides,
                };
                if service_type == ServiceType::Activatable {
                    let mut admin = ActivatableAdmin::new(prefix, index);
                    let proxy = admin.start(ctx)?;
                    (ServiceAdmin::Activatable(admin), proxy)
                } else {
                    let mut admin = NonActivatableAdmin::new(prefix, index);
                    let proxy = admin.start(ctx)?;
                    (ServiceAdmin::NonActivatable(admin), proxy)
                }
            }
            ServiceType::Group => {
                let mut admin = SharedGroupAdmin::with_prefix(prefix, index);
                let proxy = admin.start(&self.config, &mut self.runtime, &self.overrides)?;
                (ServiceAdmin::SharedGroup(admin), proxy)
            }
            ServiceType::ActivationSystem => {
                let endpoint = self.runtime.ensure_activation_system(&self.config)?;
                let proxy = ServiceProxy {
                    id: format!("activation-system@{endpoint}"),
                    kind: ProxyKind::Service,
                    host: self.config.local_host().to_string(),
                    attributes: BTreeMap::from([("endpoint".to_string(), endpoint)]),
                };
                (ServiceAdmin::ActivationSystem, proxy)
            }
        };

        self.next_index.insert(prefix.to_string(), index + 1);
        let info = ServiceInfo {
            service,
            host: proxy.host.clone(),
            proxy,
        };
        self.admins.push(ManagedAdmin {
            info: info.clone(),
            admin,
        });
        Ok(info)
    }

    fn ensure_shared_group(&mut self) -> Result<()> {
        if self.shared_group.is_some() || !self.config.get_boolean(SHARED_GROUPS_KEY, false)? {
            return Ok(());
        }
        let mut group = SharedGroupAdmin::new(0);
        group.start(&self.config, &mut self.runtime, &self.overrides)?;
        self.shared_group = Some(group);
        Ok(())
    }

    fn position(&self, service: &ServiceRef) -> Result<usize> {
        self.admins
            .iter()
            .position(|m| &m.info.service == service)
            .ok_or_else(|| TestException::new(format!("no admin for {service}")))
    }

    pub fn stop_service(&mut self, service: &ServiceRef) -> Result<()> {
        let pos = self.position(service)?;
        let mut managed = self.admins.remove(pos);
        info!(%service, "stopping service");
        managed.admin.stop(&self.config, &mut self.runtime)
    }

    /// Kill the group VM hosting `service`.
    pub fn kill_vm(&mut self, service: &ServiceRef) -> Result<()> {
        let pos = self.position(service)?;
        let platform = self.runtime.platform();
        if let Some(group) = self.admins[pos].admin.private_group_mut() {
            return group.kill_vm(platform);
        }
        match (&self.admins[pos].admin, self.shared_group.as_mut()) {
            (ServiceAdmin::Activatable(_) | ServiceAdmin::NonActivatable(_), Some(shared)) => {
                shared.kill_vm(platform)
            }
            _ => Err(TestException::new(format!("{service} is not hosted in a group VM"))),
        }
    }

    /// Stop every admin in reverse start order, then the shared group, then
    /// the activation system. Returns the number of failed steps.
    pub fn teardown(&mut self) -> usize {
        let mut failures = 0;
        while let Some(mut managed) = self.admins.pop() {
            let label = format!("stop {}", managed.info.service);
            if !best_effort(&label, managed.admin.stop(&self.config, &mut self.runtime)) {
                failures += 1;
            }
        }
        if let Some(mut group) = self.shared_group.take()
            && !best_effort("stop shared group", group.stop(self.runtime.platform()))
        {
            failures += 1;
        }
        self.runtime.stop_activation_system(&self.config);
        if failures > 0 {
            warn!(failures, "teardown finished with failures");
        } else {
            info!("teardown complete");
        }
        failures
    }

    pub fn running_admins(&self) -> Vec<ServiceInfo> {
        self.admins
            .iter()
            .filter(|m| m.admin.state(&self.runtime) == AdminState::Running)
            .map(|m| m.info.clone())
            .collect()
    }

    pub fn query(&self, query: &AdminQuery) -> Result<serde_json::Value> {
        let value = match query {
            AdminQuery::Proxy { service } => {
                let managed = &self.admins[self.position(service)?];
                let proxy = managed
                    .admin
                    .proxy()
                    .unwrap_or(&managed.info.proxy);
                serde_json::to_value(proxy)
            }
            AdminQuery::Host => serde_json::to_value(self.config.local_host()),
            AdminQuery::RunningAdmins => serde_json::to_value(self.running_admins()),
        };
        value.map_err(|e| TestException::with_cause("failed to encode query answer", e))
    }

    /// Execute a request received from the master test VM.
    pub fn handle_slave_request(&mut self, request: SlaveRequest) -> Reply {
        debug!(request = request.name(), "handling slave request");
        let result = match request {
            SlaveRequest::StartService { prefix } => self.start_service(&prefix).map(|info| Reply::ok(&info)),
            SlaveRequest::StopService { service } => self.stop_service(&service).map(|()| Reply::unit()),
            SlaveRequest::KillVm { service } => self.kill_vm(&service).map(|()| Reply::unit()),
            SlaveRequest::RegisterOverrideProvider { provider } => {
                self.register_override_provider(provider);
                Ok(Reply::unit())
            }
            SlaveRequest::SetDynamicParameter { key, value } => {
                self.config.set_local_dynamic_parameter(&key, &value);
                Ok(Reply::unit())
            }
            SlaveRequest::Teardown => {
                self.teardown();
                Ok(Reply::unit())
            }
            SlaveRequest::Ping => Ok(Reply::ok(&self.config.local_host())),
            SlaveRequest::Query(query) => self.query(&query).map(Reply::Ok),
        };
        result.unwrap_or_else(|e| Reply::Err(e.chain_message()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::DeletionList;
    use crate::config::{HarnessSettings, parse_properties};
    use crate::pipe::OutputSink;
    use crate::process::ProcessOrchestrator;
    use crate::testing::RecordingPlatform;
    use std::sync::Arc;

    const BASE: &str = "dth.activation.type=external\n\
                        dth.activation.stopDelay=0\n\
                        dth.activation.attempts=0\n\
                        dth.serviceUnregisterWait=0\n\
                        reggie.type=activatable\n\
                        reggie.impl=Registrar\n\
                        mahalo.type=nonactivatable\n\
                        mahalo.impl=TxnManager\n\
                        grp.type=group\n";

    fn manager(extra: &str) -> (AdminManager, Arc<RecordingPlatform>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let config = QaConfig::builder()
            .defaults(parse_properties(&format!(
                "{BASE}sharedGroup.persistenceRoot={}\ngrp.persistenceRoot={}\n{extra}",
                tmp.path().display(),
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
        (AdminManager::new(config, runtime), platform, tmp)
    }

    #[test]
    fn test_indices_increment_per_prefix() {
        let (mut manager, _platform, _tmp) = manager("");
        let first = manager.start_service("reggie").unwrap();
        let second = manager.start_service("reggie").unwrap();
        let other = manager.start_service("mahalo").unwrap();
        assert_eq!(first.service.index, 0);
        assert_eq!(second.service.index, 1);
        assert_eq!(other.service.index, 0);
        assert_eq!(first.proxy.attributes["implementation"], "Registrar");
        assert_eq!(manager.running_admins().len(), 3);
        assert_eq!(manager.teardown(), 0);
    }

    #[test]
    fn test_failed_start_does_not_consume_index() {
        let (mut manager, platform, _tmp) = manager("");
        platform.fail_on("create_activatable");
        assert!(manager.start_service("reggie").is_err());
        platform.clear_failures();
        assert_eq!(manager.start_service("reggie").unwrap().service.index, 0);
    }

    #[test]
    fn test_unknown_prefix_and_type_are_errors() {
        let (mut manager, _platform, _tmp) = manager("odd.type=webapp\n");
        assert!(manager.start_service("nothing").unwrap_err().message().contains("no service type"));
        assert!(manager.start_service("odd").unwrap_err().message().contains("unknown service type"));
    }

    #[test]
    fn test_private_group_follows_service() {
        let (mut manager, platform, _tmp) = manager("");
        let info = manager.start_service("reggie").unwrap();
        assert_eq!(platform.inner().group_count(), 1);
        manager.stop_service(&info.service).unwrap();
        assert_eq!(platform.inner().group_count(), 0);
        assert!(manager.stop_service(&info.service).is_err());
    }

    #[test]
    fn test_shared_mode_uses_one_group() {
        let (mut manager, platform, _tmp) = manager("dth.sharedGroups=true\n");
        let a = manager.start_service("reggie").unwrap();
        manager.start_service("mahalo").unwrap();
        // The shared group plus its implementation service and two services.
        assert_eq!(platform.inner().group_count(), 1);
        assert_eq!(platform.inner().service_count(), 3);

        manager.stop_service(&a.service).unwrap();
        assert_eq!(platform.inner().group_count(), 1);
        manager.teardown();
        assert_eq!(platform.inner().group_count(), 0);
        assert!(!manager.runtime().activation().is_running());
    }

    #[test]
    fn test_teardown_runs_in_reverse_order() {
        let (mut manager, platform, _tmp) = manager("");
        manager.start_service("reggie").unwrap();
        manager.start_service("grp").unwrap();
        manager.start_service("mahalo").unwrap();
        platform.clear_calls();
        assert_eq!(manager.teardown(), 0);
        let calls = platform.calls();
        let destroys: Vec<&str> = calls
            .iter()
            .filter(|c| c.starts_with("destroy_"))
            .map(String::as_str)
            .collect();
        // mahalo (service, private group), grp (group), reggie (service, private group)
        assert_eq!(
            destroys,
            [
                "destroy_service",
                "destroy_group_vm",
                "destroy_group_vm",
                "destroy_service",
                "destroy_group_vm"
            ]
        );
        assert_eq!(manager.teardown(), 0);
    }

    #[test]
    fn test_private_group_stopped_even_when_destroy_fails() {
        let (mut manager, platform, _tmp) = manager("");
        manager.start_service("reggie").unwrap();
        platform.fail_on("destroy_service");
        assert_eq!(manager.teardown(), 1);
        assert_eq!(platform.inner().group_count(), 0);
    }

    #[test]
    fn test_kill_vm_on_private_group_is_repeatable() {
        let (mut manager, platform, _tmp) = manager("");
        let info = manager.start_service("reggie").unwrap();
        manager.kill_vm(&info.service).unwrap();
        manager.kill_vm(&info.service).unwrap();
        assert_eq!(
            platform.calls().iter().filter(|c| c.as_str() == "kill_vm").count(),
            2
        );
        // The group is reactivated on demand; stopping the service removes it.
        assert_eq!(platform.inner().group_count(), 1);
        manager.stop_service(&info.service).unwrap();
        assert_eq!(platform.inner().group_count(), 0);
        assert_eq!(platform.inner().service_count(), 0);
    }

    #[test]
    fn test_handle_slave_requests() {
        let (mut manager, _platform, _tmp) = manager("");
        let reply = manager.handle_slave_request(SlaveRequest::StartService {
            prefix: "reggie".into(),
        });
        let info: ServiceInfo = reply.into_result().unwrap();
        assert_eq!(info.service.prefix, "reggie");

        let reply = manager.handle_slave_request(SlaveRequest::Query(AdminQuery::Proxy {
            service: info.service.clone(),
        }));
        let proxy: ServiceProxy = reply.into_result().unwrap();
        assert_eq!(proxy, info.proxy);

        manager.handle_slave_request(SlaveRequest::SetDynamicParameter {
            key: "dth.flag".into(),
            value: "on".into(),
        });
        assert!(manager.config().get_boolean("dth.flag", false).unwrap());

        let reply = manager.handle_slave_request(SlaveRequest::StopService {
            service: ServiceRef {
                prefix: "absent".into(),
                index: 0,
            },
        });
        assert!(matches!(reply, Reply::Err(ref m) if m.contains("no admin for absent[0]")));

        let reply = manager.handle_slave_request(SlaveRequest::Query(AdminQuery::RunningAdmins));
        let running: Vec<ServiceInfo> = reply.into_result().unwrap();
        assert_eq!(running, vec![info]);

        manager.handle_slave_request(SlaveRequest::Teardown);
        assert!(manager.running_admins().is_empty());
    }

    #[test]
    fn test_override_providers_reach_options() {
        let (mut manager, _platform, _tmp) = manager("");
        manager.register_override_provider(OverrideProvider {
            prefix: Some("reggie".into()),
            overrides: vec![("registrar.port".into(), "4160".into())],
        });
        let info = manager.start_service("reggie").unwrap();
        assert_eq!(info.proxy.attributes["option.registrar.port"], "4160");
        manager.teardown();
    }

    #[test]
    fn test_service_type_parse() {
        assert_eq!(ServiceType::parse("Activatable"), Some(ServiceType::Activatable));
        assert_eq!(ServiceType::parse("GROUP"), Some(ServiceType::Group));
        assert_eq!(ServiceType::parse("activationSystem"), Some(ServiceType::ActivationSystem));
        assert_eq!(ServiceType::parse("bean"), None);
    }
}
