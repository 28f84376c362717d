//! Requests from the master test VM to slave test VMs.

use super::{ConnectPolicy, request};
use crate::config::QaConfig;
use crate::errors::{Result, TestException};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Identifies one admin on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceRef {
    pub prefix: String,
    pub index: usize,
}

impl std::fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.prefix, self.index)
    }
}

/// Adds configuration-entry overrides to services started under a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideProvider {
    /// Only services with this prefix are affected; `None` matches all.
    pub prefix: Option<String>,
    /// `(component.name, value)` pairs.
    pub overrides: Vec<(String, String)>,
}

impl OverrideProvider {
    pub fn applies_to(&self, prefix: &str) -> bool {
        self.prefix.as_deref().is_none_or(|p| p == prefix)
    }
}

/// Typed administrative queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum AdminQuery {
    /// Proxy of a running service.
    Proxy { service: ServiceRef },
    /// Host name of the answering slave.
    Host,
    /// Every running admin, in start order.
    RunningAdmins,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum SlaveRequest {
    /// Start the next instance of the service configured under `prefix`.
    StartService { prefix: String },
    StopService { service: ServiceRef },
    /// Kill the group VM hosting the given service.
    KillVm { service: ServiceRef },
    RegisterOverrideProvider { provider: OverrideProvider },
    SetDynamicParameter { key: String, value: String },
    /// Stop everything; the slave test VM exits afterwards.
    Teardown,
    Ping,
    Query(AdminQuery),
}

impl SlaveRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartService { .. } => "start_service",
            Self::StopService { .. } => "stop_service",
            Self::KillVm { .. } => "kill_vm",
            Self::RegisterOverrideProvider { .. } => "register_override_provider",
            Self::SetDynamicParameter { .. } => "set_dynamic_parameter",
            Self::Teardown => "teardown",
            Self::Ping => "ping",
            Self::Query(_) => "query",
        }
    }
}

/// Send `req` to slave `slave_index` (1-based position in the host list) and
/// decode its reply.
pub fn request_slave<T: DeserializeOwned>(
    config: &QaConfig,
    slave_index: usize,
    req: &SlaveRequest,
) -> Result<T> {
    let endpoints = config.slave_endpoints()?;
    let endpoint = slave_index
        .checked_sub(1)
        .and_then(|i| endpoints.get(i))
        .ok_or_else(|| {
            TestException::new(format!(
                "no slave at host index {slave_index} ({} slaves configured)",
                endpoints.len()
            ))
        })?;
    let policy = ConnectPolicy::from_config(config)?;
    request(endpoint, req, &policy).map_err(|e| {
        TestException::with_cause(format!("{} request to {endpoint} failed", req.name()), e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape_is_tagged() {
        let json = serde_json::to_value(SlaveRequest::SetDynamicParameter {
            key: "k".into(),
            value: "v".into(),
        })
        .unwrap();
        assert_eq!(json["request"], "set_dynamic_parameter");
        assert_eq!(json["key"], "k");

        let query = serde_json::to_value(SlaveRequest::Query(AdminQuery::Host)).unwrap();
        assert_eq!(query["request"], "query");
        assert_eq!(query["query"], "host");
    }

    #[test]
    fn test_override_provider_prefix_filter() {
        let scoped = OverrideProvider {
            prefix: Some("reggie".into()),
            overrides: vec![],
        };
        assert!(scoped.applies_to("reggie"));
        assert!(!scoped.applies_to("mahalo"));
        let global = OverrideProvider {
            prefix: None,
            overrides: vec![],
        };
        assert!(global.applies_to("anything"));
    }

    #[test]
    fn test_request_slave_rejects_bad_index() {
        let config = QaConfig::builder()
            .defaults([("dth.hosts".to_string(), "localhost".to_string())].into_iter().collect())
            .build()
            .unwrap();
        assert!(request_slave::<()>(&config, 0, &SlaveRequest::Ping).is_err());
        assert!(request_slave::<()>(&config, 1, &SlaveRequest::Ping).is_err());
    }
}
