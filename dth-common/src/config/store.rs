//! Layered configuration store.
//!
//! Values are looked up across nine layers, lowest precedence first:
//!
//! | # | Layer              | Source                                   |
//! |---|--------------------|------------------------------------------|
//! | 1 | `Defaults`         | harness default property file            |
//! | 2 | `ConfigSet`        | configuration-set property file          |
//! | 3 | `User`             | user property file                       |
//! | 4 | `TestDescription`  | the running test's `.td` file            |
//! | 5 | `TestEntries`      | structured entries (`component.name`)    |
//! | 6 | `CommandLine`      | `key=value` arguments                    |
//! | 7 | `SystemProperties` | `DTH_PROP_*` environment                 |
//! | 8 | `Dynamic`          | values set while the test runs           |
//! | 9 | `Overrides`        | explicit overrides                       |
//!
//! Each layer that defines a key may refer to the value accumulated from the
//! lower layers with `${key}`, e.g. `vm.options=${vm.options} -Xmx512m`.

use super::entries::{ConfigurationEntries, TomlEntries, split_entry_key};
use super::properties::Properties;
use super::resolver::{ConfigResolver, PropertyLookup};
use crate::description::TestDescription;
use crate::errors::{ConfigError, Result, TestException};
use crate::types::{HostEntry, HostRole, SLAVE_REQUEST_PORT, local_host_name, parse_host_list};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Config key holding the ordered host list; entry 0 is the master.
pub const HOSTS_KEY: &str = "dth.hosts";
/// Config key for the slave test VM request port.
pub const SLAVE_REQUEST_PORT_KEY: &str = "dth.slaveRequestPort";
/// Token bound to the local host name.
pub const GETHOST_TOKEN: &str = "<gethost>";

/// Version stamped on serialized snapshots.
pub const SNAPSHOT_VERSION: u32 = 1;

/// One precedence layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigLayer {
    Defaults,
    ConfigSet,
    User,
    TestDescription,
    TestEntries,
    CommandLine,
    SystemProperties,
    Dynamic,
    Overrides,
}

impl ConfigLayer {
    /// Lowest to highest precedence.
    pub const ORDER: [ConfigLayer; 9] = [
        ConfigLayer::Defaults,
        ConfigLayer::ConfigSet,
        ConfigLayer::User,
        ConfigLayer::TestDescription,
        ConfigLayer::TestEntries,
        ConfigLayer::CommandLine,
        ConfigLayer::SystemProperties,
        ConfigLayer::Dynamic,
        ConfigLayer::Overrides,
    ];
}

/// The configuration for one test run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QaConfig {
    defaults: Properties,
    config_set: Properties,
    user: Properties,
    command_line: Properties,
    system: Properties,
    dynamic: Properties,
    overrides: Properties,
    description: Option<TestDescription>,
    entry_files: Vec<PathBuf>,
    resolver: ConfigResolver,
    forced_role: Option<HostRole>,
    config_tag: Option<String>,

    #[serde(skip)]
    entries: Option<Arc<dyn ConfigurationEntries>>,
    #[serde(skip)]
    local_host: String,
}

/// Serialized form of a [`QaConfig`] used on every process hop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub version: u32,
    pub config: QaConfig,
}

impl QaConfig {
    pub fn builder() -> QaConfigBuilder {
        QaConfigBuilder::default()
    }

    /// Raw (unresolved) value defined by a single layer.
    pub fn raw_value(&self, layer: ConfigLayer, key: &str) -> Option<String> {
        let props = match layer {
            ConfigLayer::Defaults => &self.defaults,
            ConfigLayer::ConfigSet => &self.config_set,
            ConfigLayer::User => &self.user,
            ConfigLayer::TestDescription => {
                return self
                    .description
                    .as_ref()
                    .and_then(|d| d.property(key))
                    .map(str::to_string);
            }
            ConfigLayer::TestEntries => {
                let (component, name) = split_entry_key(key)?;
                return self.entries.as_ref()?.entry(component, name);
            }
            ConfigLayer::CommandLine => &self.command_line,
            ConfigLayer::SystemProperties => &self.system,
            ConfigLayer::Dynamic => &self.dynamic,
            ConfigLayer::Overrides => &self.overrides,
        };
        props.get(key).cloned()
    }

    /// Highest layer that defines `key`, if any.
    pub fn source_of(&self, key: &str) -> Option<ConfigLayer> {
        ConfigLayer::ORDER
            .iter()
            .rev()
            .copied()
            .find(|layer| self.raw_value(*layer, key).is_some())
    }

    /// Resolve `key` across all layers.
    pub fn lookup(&self, key: &str) -> Result<Option<String>, ConfigError> {
        self.lookup_at(key, 0)
    }

    fn lookup_at(&self, key: &str, depth: usize) -> Result<Option<String>, ConfigError> {
        let mut accumulated: Option<String> = None;
        for layer in ConfigLayer::ORDER {
            if let Some(raw) = self.raw_value(layer, key) {
                let previous = accumulated.as_deref().unwrap_or("");
                accumulated = Some(self.resolver.resolve_reference(&raw, key, previous));
            }
        }
        match accumulated {
            Some(value) if !value.is_empty() => {
                self.resolver.resolve(&value, self, depth).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Fully resolve an arbitrary string against this configuration.
    pub fn resolve(&self, raw: &str) -> Result<String, ConfigError> {
        self.resolver.resolve(raw, self, 0)
    }

    pub fn get_opt(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lookup(key)?)
    }

    pub fn get_string(&self, key: &str, default: &str) -> Result<String> {
        Ok(self.lookup(key)?.unwrap_or_else(|| default.to_string()))
    }

    /// Like [`get_string`](Self::get_string) but a missing value is an error.
    pub fn require_string(&self, key: &str) -> Result<String> {
        self.lookup(key)?
            .ok_or_else(|| TestException::new(format!("required configuration value '{key}' is not defined")))
    }

    pub fn get_int(&self, key: &str, default: i32) -> Result<i32> {
        self.get_parsed(key, default)
    }

    pub fn get_long(&self, key: &str, default: i64) -> Result<i64> {
        self.get_parsed(key, default)
    }

    pub fn get_float(&self, key: &str, default: f32) -> Result<f32> {
        self.get_parsed(key, default)
    }

    pub fn get_double(&self, key: &str, default: f64) -> Result<f64> {
        self.get_parsed(key, default)
    }

    pub fn get_boolean(&self, key: &str, default: bool) -> Result<bool> {
        Ok(match self.lookup(key)? {
            Some(v) => parse_bool(&v).unwrap_or(default),
            None => default,
        })
    }

    fn get_parsed<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T> {
        Ok(match self.lookup(key)? {
            Some(v) => v.trim().parse().unwrap_or_else(|_| {
                debug!(key, value = %v, "unparsable numeric value; using default");
                default
            }),
            None => default,
        })
    }

    /// Candidate keys for a service parameter, in search order.
    ///
    /// `service_type` is the already-resolved `prefix.type` value.
    pub fn service_param_keys(
        prefix: &str,
        prop: &str,
        index: usize,
        service_type: Option<&str>,
    ) -> Vec<String> {
        let mut keys = Vec::new();
        if let Some(ty) = service_type {
            keys.extend(indexed_keys(&format!("{prefix}.{ty}.{prop}"), index));
        }
        keys.extend(indexed_keys(&format!("{prefix}.{prop}"), index));
        keys
    }

    /// Three-tier, index-descending service parameter search.
    pub fn get_service_param(&self, prefix: &str, prop: &str, index: usize) -> Result<Option<String>> {
        let service_type = self.first_defined(indexed_keys(&format!("{prefix}.type"), index))?;
        if prop == "type" {
            return Ok(service_type);
        }
        let keys = Self::service_param_keys(prefix, prop, index, service_type.as_deref());
        self.first_defined(keys)
    }

    fn first_defined(&self, keys: Vec<String>) -> Result<Option<String>> {
        for key in keys {
            if let Some(value) = self.lookup(&key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Set a dynamic parameter and, on the master, broadcast it to every slave.
    ///
    /// Slaves apply the change asynchronously; callers that need every host to
    /// observe the value must synchronize separately.
    pub fn set_dynamic_parameter(&mut self, key: &str, value: &str) -> Result<()> {
        self.set_local_dynamic_parameter(key, value);
        if self.is_master() {
            let slaves = self.slave_endpoints()?;
            if !slaves.is_empty() {
                let request = crate::protocol::SlaveRequest::SetDynamicParameter {
                    key: key.to_string(),
                    value: value.to_string(),
                };
                crate::protocol::broadcast(&slaves, &request);
            }
        }
        Ok(())
    }

    /// Set a dynamic parameter on this host only.
    pub fn set_local_dynamic_parameter(&mut self, key: &str, value: &str) {
        debug!(key, value, "dynamic parameter set");
        self.dynamic.insert(key.to_string(), value.to_string());
    }

    pub fn set_override(&mut self, key: &str, value: &str) {
        self.overrides.insert(key.to_string(), value.to_string());
    }

    pub fn clear_override(&mut self, key: &str) {
        self.overrides.remove(key);
    }

    pub fn description(&self) -> Option<&TestDescription> {
        self.description.as_ref()
    }

    pub fn set_test_description(&mut self, description: TestDescription) {
        self.resolver
            .set_test_dirs(description.dir().map(|d| vec![d.to_path_buf()]).unwrap_or_default());
        self.description = Some(description);
    }

    pub fn config_tag(&self) -> Option<&str> {
        self.config_tag.as_deref()
    }

    pub fn set_config_tag(&mut self, tag: Option<String>) {
        self.config_tag = tag;
    }

    pub fn resolver(&self) -> &ConfigResolver {
        &self.resolver
    }

    pub fn resolver_mut(&mut self) -> &mut ConfigResolver {
        &mut self.resolver
    }

    /// Install an entry store directly (bypassing the file list).
    pub fn set_entries(&mut self, entries: Arc<dyn ConfigurationEntries>) {
        self.entries = Some(entries);
    }

    pub fn entry_files(&self) -> &[PathBuf] {
        &self.entry_files
    }

    /// Ordered host list; index 0 is the master. An empty list means a
    /// single-host run.
    pub fn hosts(&self) -> Result<Vec<HostEntry>> {
        Ok(self
            .lookup(HOSTS_KEY)?
            .map(|raw| parse_host_list(&raw))
            .unwrap_or_default())
    }

    /// Request endpoints of every slave (`hosts[1..]`).
    pub fn slave_endpoints(&self) -> Result<Vec<String>> {
        let port = u16::try_from(self.get_int(SLAVE_REQUEST_PORT_KEY, i32::from(SLAVE_REQUEST_PORT))?)
            .unwrap_or(SLAVE_REQUEST_PORT);
        Ok(self
            .hosts()?
            .iter()
            .skip(1)
            .map(|h| h.endpoint(port))
            .collect())
    }

    pub fn with_role(mut self, role: HostRole) -> Self {
        self.forced_role = Some(role);
        self
    }

    pub fn set_role(&mut self, role: HostRole) {
        self.forced_role = Some(role);
    }

    pub fn role(&self) -> HostRole {
        if let Some(role) = self.forced_role {
            return role;
        }
        match self.hosts() {
            Ok(hosts) => match hosts.first() {
                Some(master) if !master.is_local(&self.local_host) => HostRole::Slave,
                _ => HostRole::Master,
            },
            Err(_) => HostRole::Master,
        }
    }

    pub fn is_master(&self) -> bool {
        self.role() == HostRole::Master
    }

    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    /// Serialize for a process hop.
    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            version: SNAPSHOT_VERSION,
            config: self.clone(),
        }
    }

    /// Rebuild from a snapshot received on stdin or over the wire.
    pub fn from_snapshot(snapshot: ConfigSnapshot) -> Result<Self> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(TestException::new(format!(
                "configuration snapshot version {} is not supported (expected {SNAPSHOT_VERSION})",
                snapshot.version
            )));
        }
        let mut config = snapshot.config;
        config.rebuild_transients()?;
        Ok(config)
    }

    /// Re-create everything that does not survive serialization.
    pub fn rebuild_transients(&mut self) -> Result<()> {
        self.local_host = local_host_name();
        self.resolver.register_token(GETHOST_TOKEN, self.local_host.clone());
        if !self.entry_files.is_empty() {
            let entries = TomlEntries::load(&self.entry_files)
                .map_err(|e| TestException::with_cause("failed to load configuration entries", e))?;
            self.entries = Some(Arc::new(entries));
        }
        Ok(())
    }
}

impl PropertyLookup for QaConfig {
    fn lookup_property(&self, key: &str, depth: usize) -> Result<Option<String>, ConfigError> {
        self.lookup_at(key, depth)
    }
}

fn indexed_keys(base: &str, index: usize) -> Vec<String> {
    let mut keys: Vec<String> = (0..=index).rev().map(|i| format!("{base}.{i}")).collect();
    keys.push(base.to_string());
    keys
}

/// Accepts `true/false`, `yes/no`, `on/off`, `1/0` (case-insensitive).
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Builder for [`QaConfig`].
#[derive(Debug, Default)]
pub struct QaConfigBuilder {
    config: QaConfig,
}

impl QaConfigBuilder {
    pub fn defaults(mut self, props: Properties) -> Self {
        self.config.defaults = props;
        self
    }

    pub fn config_set(mut self, props: Properties) -> Self {
        self.config.config_set = props;
        self
    }

    pub fn user(mut self, props: Properties) -> Self {
        self.config.user = props;
        self
    }

    pub fn command_line(mut self, props: Properties) -> Self {
        self.config.command_line = props;
        self
    }

    pub fn system_properties(mut self, props: Properties) -> Self {
        self.config.system = props;
        self
    }

    pub fn overrides(mut self, props: Properties) -> Self {
        self.config.overrides = props;
        self
    }

    pub fn description(mut self, description: TestDescription) -> Self {
        self.config.set_test_description(description);
        self
    }

    pub fn entry_files(mut self, files: Vec<PathBuf>) -> Self {
        self.config.entry_files = files;
        self
    }

    pub fn search_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.resolver.add_search_root(root);
        self
    }

    pub fn harness_archive(mut self, archive: Option<PathBuf>) -> Self {
        self.config.resolver.set_harness_archive(archive);
        self
    }

    pub fn test_archive(mut self, archive: Option<PathBuf>) -> Self {
        self.config.resolver.set_test_archive(archive);
        self
    }

    pub fn token(mut self, token: &str, value: &str) -> Self {
        self.config.resolver.register_token(token, value);
        self
    }

    pub fn role(mut self, role: HostRole) -> Self {
        self.config.forced_role = Some(role);
        self
    }

    pub fn config_tag(mut self, tag: impl Into<String>) -> Self {
        self.config.config_tag = Some(tag.into());
        self
    }

    pub fn build(mut self) -> Result<QaConfig> {
        self.config.rebuild_transients()?;
        Ok(self.config)
    }
}
