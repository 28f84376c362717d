//! Distributed Test Harness - shared core
//!
//! Configuration, service admins, the request protocol and process
//! orchestration used by the master harness (`dth`), the slave harness
//! (`dth-slave`) and the test VM (`dth-vm`).

pub mod admin;
pub mod cleanup;
pub mod config;
pub mod context;
pub mod description;
pub mod driver;
pub mod errors;
pub mod keepalive;
pub mod logging;
pub mod pipe;
pub mod process;
pub mod protocol;
pub mod results;
pub mod suspend;
pub mod testing;
pub mod timeout;
pub mod types;

pub use admin::{AdminManager, AdminState, LocalPlatform, Platform, ServiceAdmin, ServiceInfo, ServiceProxy};
pub use cleanup::DeletionList;
pub use config::{ConfigSnapshot, HarnessSettings, QaConfig, QaConfigBuilder};
pub use context::RuntimeContext;
pub use description::TestDescription;
pub use driver::{FailureAnalyzer, QaTest, TestContext, TestRegistry, TestRunDriver};
pub use errors::{ConfigError, PlatformError, ProtocolError, Result, TestException, best_effort};
pub use logging::{LogConfig, LoggingGuards, init_logging};
pub use process::{ProcessOrchestrator, VmBootstrap, VmCommand, launch_test_vm};
pub use results::{TestList, TestResult, TestRun};
pub use suspend::SuspendGate;
pub use types::{FailureType, HostRole};
