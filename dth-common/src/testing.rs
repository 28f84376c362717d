//! Recording platform helper for tests.
//!
//! [`RecordingPlatform`] wraps a [`LocalPlatform`], records every mutating
//! call by operation name and can be told to fail selected operations. The
//! daemon liveness probe is a toggle instead of a TCP connect so admin tests
//! never need a real activation daemon.
//!
//! [`init_test_logging`] installs a test-writer subscriber once per process;
//! integration tests call it from a `#[ctor::ctor]` hook.

use crate::admin::platform::{GroupSpec, LocalPlatform, Platform, ServiceProxy, ServiceSpec};
use crate::errors::PlatformError;
use std::collections::HashSet;
use std::sync::{Mutex, Once};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static TEST_LOGGING: Once = Once::new();

/// Route `tracing` output through the test harness's captured writer.
/// `DTH_TEST_LOG` sets the filter (default `debug`). Safe to call repeatedly.
pub fn init_test_logging() {
    TEST_LOGGING.call_once(|| {
        let filter = std::env::var("DTH_TEST_LOG").unwrap_or_else(|_| "debug".to_string());
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_new(&filter).unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("debug")
            }))
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug, Default)]
pub struct RecordingPlatform {
    inner: LocalPlatform,
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    daemon_alive: AtomicBool,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// The wrapped registry, for counting live services and groups.
    pub fn inner(&self) -> &LocalPlatform {
        &self.inner
    }

    pub fn set_daemon_alive(&self, alive: bool) {
        self.daemon_alive.store(alive, Ordering::SeqCst);
    }

    /// Make every later call to `operation` fail until cleared.
    pub fn fail_on(&self, operation: &str) {
        lock(&self.failing).insert(operation.to_string());
    }

    pub fn clear_failures(&self) {
        lock(&self.failing).clear();
    }

    /// Operation names in call order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn record(&self, operation: &str) -> Result<(), PlatformError> {
        lock(&self.calls).push(operation.to_string());
        if lock(&self.failing).contains(operation) {
            return Err(PlatformError::Activation(format!("injected failure in {operation}")));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Platform for RecordingPlatform {
    fn create_activatable(
        &self,
        spec: &ServiceSpec,
        group: &ServiceProxy,
    ) -> Result<ServiceProxy, PlatformError> {
        self.record("create_activatable")?;
        self.inner.create_activatable(spec, group)
    }

    fn start_service_in_group(
        &self,
        spec: &ServiceSpec,
        group: &ServiceProxy,
    ) -> Result<ServiceProxy, PlatformError> {
        self.record("start_service_in_group")?;
        self.inner.start_service_in_group(spec, group)
    }

    fn create_group(&self, spec: &GroupSpec) -> Result<ServiceProxy, PlatformError> {
        self.record("create_group")?;
        self.inner.create_group(spec)
    }

    fn destroy_service(
        &self,
        proxy: &ServiceProxy,
        unregister_wait: Duration,
    ) -> Result<(), PlatformError> {
        self.record("destroy_service")?;
        self.inner.destroy_service(proxy, unregister_wait)
    }

    fn destroy_group_vm(&self, group: &ServiceProxy) -> Result<(), PlatformError> {
        self.record("destroy_group_vm")?;
        self.inner.destroy_group_vm(group)
    }

    fn kill_vm(&self, killer: &ServiceProxy) -> Result<(), PlatformError> {
        self.record("kill_vm")?;
        self.inner.kill_vm(killer)
    }

    fn daemon_alive(&self, _endpoint: &str) -> bool {
        self.daemon_alive.load(Ordering::SeqCst)
    }

    fn shutdown_daemon(&self, endpoint: &str) -> Result<(), PlatformError> {
        self.record("shutdown_daemon")?;
        self.inner.shutdown_daemon(endpoint)
    }
}
