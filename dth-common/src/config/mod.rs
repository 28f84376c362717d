//! Configuration for a test run.
//!
//! - Flat property files and command-line assignments
//! - Structured `component.name` entries (TOML)
//! - The nine-layer [`QaConfig`] store with `$` substitution
//! - `DTH_*` environment settings

pub mod entries;
pub mod env;
pub mod properties;
pub mod resolver;
pub mod store;

pub use entries::{ConfigurationEntries, EntriesError, TomlEntries};
pub use env::{EnvError, EnvParser, HarnessSettings, system_properties};
pub use properties::{Properties, load_properties, parse_assignments, parse_properties};
pub use resolver::{ConfigResolver, MAX_RESOLUTION_DEPTH, PropertyLookup};
pub use store::{ConfigLayer, ConfigSnapshot, QaConfig, QaConfigBuilder, parse_bool};

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}
