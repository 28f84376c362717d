//! Environment variable parsing for harness settings.
//!
//! Every process in a run (harness, slave harness, test VM) reads the same
//! `DTH_*` variables, so a child inherits its parent's view of the install.
//! Variables under `DTH_PROP_` become the system-properties layer of
//! [`QaConfig`](super::QaConfig): `DTH_PROP_dth__testTimeout=60` defines
//! `dth.testTimeout=60`.

use super::properties::Properties;
use std::env;
use std::path::PathBuf;
use thiserror::Error;

/// Prefix of every harness environment variable.
pub const ENV_PREFIX: &str = "DTH_";
/// Prefix of variables copied into the system-properties layer.
pub const SYSTEM_PROPERTY_PREFIX: &str = "DTH_PROP_";

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("Path not found for {var}: {path}")]
    PathNotFound { var: String, path: PathBuf },
}

/// Collects errors during parsing so all issues can be reported at once.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self {
            prefix: ENV_PREFIX,
            errors: Vec::new(),
        }
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    pub fn get_string(&mut self, name: &str, default: &str) -> String {
        env::var(self.var_name(name)).unwrap_or_else(|_| default.to_string())
    }

    /// Accepts: 1, true, yes, on / 0, false, no, off, "".
    pub fn get_bool(&mut self, name: &str, default: bool) -> bool {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name,
                        expected: "boolean (true/false/1/0/yes/no)".to_string(),
                        value,
                    });
                    default
                }
            },
            Err(_) => default,
        }
    }

    /// Optional path. If `must_exist` is true, records an error if the path
    /// doesn't exist.
    pub fn get_optional_path(&mut self, name: &str, must_exist: bool) -> Option<PathBuf> {
        let var_name = self.var_name(name);
        let path = PathBuf::from(env::var(&var_name).ok().filter(|v| !v.is_empty())?);
        if must_exist && !path.exists() {
            self.errors.push(EnvError::PathNotFound {
                var: var_name,
                path: path.clone(),
            });
        }
        Some(path)
    }

    /// Platform path list (`:` separated on Unix, `;` on Windows).
    pub fn get_path_list(&mut self, name: &str) -> Vec<PathBuf> {
        match env::var_os(self.var_name(name)) {
            Some(value) => env::split_paths(&value)
                .filter(|p| !p.as_os_str().is_empty())
                .collect(),
            None => Vec::new(),
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a `DTH_PROP_` variable suffix to a property key (`__` becomes `.`).
pub fn property_key(suffix: &str) -> String {
    suffix.replace("__", ".")
}

/// Collect the system-properties layer from the environment.
pub fn system_properties() -> Properties {
    env::vars()
        .filter_map(|(name, value)| {
            let suffix = name.strip_prefix(SYSTEM_PROPERTY_PREFIX)?;
            (!suffix.is_empty()).then(|| (property_key(suffix), value))
        })
        .collect()
}

/// Install locations and runtime knobs shared by every harness process.
#[derive(Debug, Clone, Default)]
pub struct HarnessSettings {
    /// Roots searched by `<file:>` / `<url:>` locators (`DTH_SEARCH_PATH`).
    pub search_path: Vec<PathBuf>,
    /// Harness resource archive (`DTH_HARNESS_ARCHIVE`).
    pub harness_archive: Option<PathBuf>,
    /// Test resource archive (`DTH_TEST_ARCHIVE`).
    pub test_archive: Option<PathBuf>,
    /// Directory for per-run log files (`DTH_LOG_DIR`).
    pub log_dir: Option<PathBuf>,
    /// Test VM executable (`DTH_VM_BINARY`); defaults to `dth-vm` on `PATH`.
    pub vm_binary: PathBuf,
    /// Slave harness executable (`DTH_SLAVE_BINARY`).
    pub slave_binary: PathBuf,
    /// Keep the VM's private working directories after a run (`DTH_KEEP_WORK`).
    pub keep_work: bool,
}

impl HarnessSettings {
    /// Read all settings, returning the collected errors alongside.
    pub fn from_env() -> (Self, Vec<EnvError>) {
        let mut parser = EnvParser::new();
        let settings = Self {
            search_path: parser.get_path_list("SEARCH_PATH"),
            harness_archive: parser.get_optional_path("HARNESS_ARCHIVE", true),
            test_archive: parser.get_optional_path("TEST_ARCHIVE", true),
            log_dir: parser.get_optional_path("LOG_DIR", false),
            vm_binary: PathBuf::from(parser.get_string("VM_BINARY", "dth-vm")),
            slave_binary: PathBuf::from(parser.get_string("SLAVE_BINARY", "dth-slave")),
            keep_work: parser.get_bool("KEEP_WORK", false),
        };
        (settings, parser.take_errors())
    }
}
