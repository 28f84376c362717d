//! The middleware platform collaborator.
//!
//! Admins never talk to the middleware directly; they go through a
//! [`Platform`], which creates and destroys services and groups and answers
//! liveness probes for the activation daemon.

use crate::errors::PlatformError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Opaque, serializable reference to a running service or group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceProxy {
    pub id: String,
    pub kind: ProxyKind,
    pub host: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    Service,
    Group,
    Killer,
}

/// What to start, as assembled by an admin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub prefix: String,
    pub index: usize,
    /// Implementation name understood by the platform.
    pub implementation: String,
    /// Ordered `name=value` start options.
    pub options: Vec<(String, String)>,
}

/// A group (hosting process) to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub persistence_dir: PathBuf,
    pub vm_options: Vec<String>,
    pub activation_endpoint: String,
}

pub trait Platform: Send + Sync + std::fmt::Debug {
    /// Register and start an activatable service inside `group`.
    fn create_activatable(
        &self,
        spec: &ServiceSpec,
        group: &ServiceProxy,
    ) -> Result<ServiceProxy, PlatformError>;

    /// Start a plain (non-activatable) service in `group`. A killer
    /// implementation is registered so that it survives the kills it makes.
    fn start_service_in_group(
        &self,
        spec: &ServiceSpec,
        group: &ServiceProxy,
    ) -> Result<ServiceProxy, PlatformError>;

    fn create_group(&self, spec: &GroupSpec) -> Result<ServiceProxy, PlatformError>;

    /// Destroy a service, waiting up to `unregister_wait` for it to leave.
    fn destroy_service(
        &self,
        proxy: &ServiceProxy,
        unregister_wait: Duration,
    ) -> Result<(), PlatformError>;

    fn destroy_group_vm(&self, group: &ServiceProxy) -> Result<(), PlatformError>;

    /// Ask a killer service to terminate its hosting VM. The group stays
    /// registered and its VM is reactivated on the next call into it.
    fn kill_vm(&self, killer: &ServiceProxy) -> Result<(), PlatformError>;

    fn daemon_alive(&self, endpoint: &str) -> bool {
        crate::types::resolve_endpoint(endpoint)
            .and_then(|addr| TcpStream::connect_timeout(&addr, PROBE_TIMEOUT))
            .is_ok()
    }

    fn shutdown_daemon(&self, endpoint: &str) -> Result<(), PlatformError>;

    /// Final preparation of a proxy before handing it to test code.
    fn prepare_proxy(&self, proxy: ServiceProxy) -> Result<ServiceProxy, PlatformError> {
        Ok(proxy)
    }
}

/// Round-trip a proxy through its serialized form so it no longer shares any
/// state with the platform that produced it.
pub fn remarshal(proxy: &ServiceProxy) -> Result<ServiceProxy, PlatformError> {
    serde_json::to_value(proxy)
        .and_then(serde_json::from_value)
        .map_err(|e| PlatformError::Other(format!("proxy re-marshal failed: {e}")))
}

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    services: HashMap<String, ServiceProxy>,
    groups: HashMap<String, ServiceProxy>,
    /// service id -> group id
    placement: HashMap<String, String>,
    /// Services registered with the activation system; they outlive a VM kill.
    activatable: HashSet<String>,
    /// group id -> number of times its VM was killed
    kills: HashMap<String, u32>,
}

impl Registry {
    /// Remove a group and everything placed in it.
    fn drop_group(&mut self, group_id: &str) -> bool {
        if self.groups.remove(group_id).is_none() {
            return false;
        }
        let hosted: Vec<String> = self
            .placement
            .iter()
            .filter(|(_, g)| g.as_str() == group_id)
            .map(|(s, _)| s.clone())
            .collect();
        for service in hosted {
            self.placement.remove(&service);
            self.services.remove(&service);
            self.activatable.remove(&service);
        }
        self.kills.remove(group_id);
        true
    }

    /// Kill a group's VM. Activatable registrations survive and the group
    /// is reactivated on the next call; transient services are lost.
    fn kill_group_vm(&mut self, group_id: &str) {
        let transient: Vec<String> = self
            .placement
            .iter()
            .filter(|(s, g)| g.as_str() == group_id && !self.activatable.contains(*s))
            .map(|(s, _)| s.clone())
            .collect();
        for service in transient {
            self.placement.remove(&service);
            self.services.remove(&service);
        }
        *self.kills.entry(group_id.to_string()).or_default() += 1;
    }

    fn mint(&mut self, kind: ProxyKind, host: &str) -> ServiceProxy {
        self.next_id += 1;
        ServiceProxy {
            id: format!("{kind:?}-{}", self.next_id).to_lowercase(),
            kind,
            host: host.to_string(),
            attributes: BTreeMap::new(),
        }
    }
}

/// In-process platform that keeps services and groups in a registry.
///
/// The activation daemon is probed over TCP; shutting it down is left to the
/// owner of the daemon process.
#[derive(Debug)]
pub struct LocalPlatform {
    host: String,
    registry: Mutex<Registry>,
}

impl Default for LocalPlatform {
    fn default() -> Self {
        Self::new(crate::types::local_host_name())
    }
}

impl LocalPlatform {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            registry: Mutex::new(Registry::default()),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn service_count(&self) -> usize {
        self.registry().services.len()
    }

    pub fn group_count(&self) -> usize {
        self.registry().groups.len()
    }

    /// How many times the VM of `group` has been killed.
    pub fn vm_kills(&self, group: &ServiceProxy) -> u32 {
        self.registry().kills.get(&group.id).copied().unwrap_or(0)
    }

    fn place(
        &self,
        spec: &ServiceSpec,
        group: &ServiceProxy,
        kind: ProxyKind,
        activatable: bool,
    ) -> Result<ServiceProxy, PlatformError> {
        let mut reg = self.registry();
        if !reg.groups.contains_key(&group.id) {
            return Err(PlatformError::Activation(format!(
                "group {} is not active",
                group.id
            )));
        }
        let mut proxy = reg.mint(kind, &self.host);
        proxy
            .attributes
            .insert("implementation".into(), spec.implementation.clone());
        proxy
            .attributes
            .insert("service".into(), format!("{}[{}]", spec.prefix, spec.index));
        for (name, value) in &spec.options {
            proxy.attributes.insert(format!("option.{name}"), value.clone());
        }
        reg.placement.insert(proxy.id.clone(), group.id.clone());
        if activatable {
            reg.activatable.insert(proxy.id.clone());
        }
        reg.services.insert(proxy.id.clone(), proxy.clone());
        debug!(service = %proxy.id, group = %group.id, "service placed");
        Ok(proxy)
    }
}

impl Platform for LocalPlatform {
    fn create_activatable(
        &self,
        spec: &ServiceSpec,
        group: &ServiceProxy,
    ) -> Result<ServiceProxy, PlatformError> {
        self.place(spec, group, ProxyKind::Service, true)
    }

    fn start_service_in_group(
        &self,
        spec: &ServiceSpec,
        group: &ServiceProxy,
    ) -> Result<ServiceProxy, PlatformError> {
        if spec.implementation == KILLER_IMPLEMENTATION {
            self.place(spec, group, ProxyKind::Killer, true)
        } else {
            self.place(spec, group, ProxyKind::Service, false)
        }
    }

    fn create_group(&self, spec: &GroupSpec) -> Result<ServiceProxy, PlatformError> {
        let mut reg = self.registry();
        let mut group = reg.mint(ProxyKind::Group, &self.host);
        group.attributes.insert(
            "persistence_dir".into(),
            spec.persistence_dir.display().to_string(),
        );
        reg.groups.insert(group.id.clone(), group.clone());
        info!(group = %group.id, "group created");
        Ok(group)
    }

    fn destroy_service(
        &self,
        proxy: &ServiceProxy,
        _unregister_wait: Duration,
    ) -> Result<(), PlatformError> {
        let mut reg = self.registry();
        reg.placement.remove(&proxy.id);
        reg.services
            .remove(&proxy.id)
            .map(|_| ())
            .ok_or_else(|| PlatformError::NotFound(proxy.id.clone()))
    }

    fn destroy_group_vm(&self, group: &ServiceProxy) -> Result<(), PlatformError> {
        if self.registry().drop_group(&group.id) {
            Ok(())
        } else {
            Err(PlatformError::Activation(format!(
                "group {} is not active",
                group.id
            )))
        }
    }

    fn kill_vm(&self, killer: &ServiceProxy) -> Result<(), PlatformError> {
        let mut reg = self.registry();
        let group = reg
            .placement
            .get(&killer.id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(killer.id.clone()))?;
        reg.kill_group_vm(&group);
        info!(group = %group, "group VM killed");
        Ok(())
    }

    fn shutdown_daemon(&self, endpoint: &str) -> Result<(), PlatformError> {
        debug!(endpoint, "daemon shutdown requested");
        Ok(())
    }
}

/// Implementation name of the helper service that kills its group VM.
pub const KILLER_IMPLEMENTATION: &str = "dth.VmKiller";
