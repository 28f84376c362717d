//! Structured test-configuration entries addressed by `component.name`.
//!
//! Entries come from TOML files whose tables name components:
//!
//! ```toml
//! [net.jini.discovery]
//! unicastPort = 4160
//!
//! ["org.example.registrar"]
//! initialMemberGroups = "qa.group"
//! ```
//!
//! The parsed store is not serialized across process hops; it is rebuilt from
//! the file list after every hop.

use std::path::{Path, PathBuf};
use thiserror::Error;
use toml::{Table, Value};

#[derive(Debug, Error)]
pub enum EntriesError {
    #[error("failed to read configuration entries {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration entries {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Lookup interface for structured entries.
pub trait ConfigurationEntries: Send + Sync + std::fmt::Debug {
    fn entry(&self, component: &str, name: &str) -> Option<String>;
}

/// Split `component.name` at the last dot.
pub fn split_entry_key(key: &str) -> Option<(&str, &str)> {
    let (component, name) = key.rsplit_once('.')?;
    (!component.is_empty() && !name.is_empty()).then_some((component, name))
}

/// TOML-backed entry store. Later files shadow earlier ones.
#[derive(Debug, Default, Clone)]
pub struct TomlEntries {
    layers: Vec<Table>,
}

impl TomlEntries {
    pub fn load(paths: &[PathBuf]) -> Result<Self, EntriesError> {
        let mut layers = Vec::with_capacity(paths.len());
        for path in paths {
            layers.push(Self::load_one(path)?);
        }
        Ok(Self { layers })
    }

    fn load_one(path: &Path) -> Result<Table, EntriesError> {
        let text = std::fs::read_to_string(path).map_err(|source| EntriesError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        text.parse::<Table>().map_err(|source| EntriesError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_str_layers(texts: &[&str]) -> Result<Self, toml::de::Error> {
        let layers = texts
            .iter()
            .map(|t| t.parse::<Table>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { layers })
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

fn component_table<'a>(root: &'a Table, component: &str) -> Option<&'a Table> {
    if let Some(Value::Table(t)) = root.get(component) {
        return Some(t);
    }
    let mut current = root;
    for part in component.split('.') {
        match current.get(part) {
            Some(Value::Table(t)) => current = t,
            _ => return None,
        }
    }
    Some(current)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(render).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

impl ConfigurationEntries for TomlEntries {
    fn entry(&self, component: &str, name: &str) -> Option<String> {
        self.layers.iter().rev().find_map(|layer| {
            let table = component_table(layer, component)?;
            match table.get(name)? {
                Value::Table(_) => None,
                value => Some(render(value)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_entry_key() {
        assert_eq!(split_entry_key("a.b.c"), Some(("a.b", "c")));
        assert_eq!(split_entry_key("plain"), None);
        assert_eq!(split_entry_key(".x"), None);
        assert_eq!(split_entry_key("x."), None);
    }

    #[test]
    fn test_nested_and_quoted_components() {
        let entries = TomlEntries::from_str_layers(&[r#"
            [net.jini.discovery]
            unicastPort = 4160
            groups = ["a", "b"]

            ["org.example.registrar"]
            initialMemberGroups = "qa.group"
        "#])
        .unwrap();
        assert_eq!(
            entries.entry("net.jini.discovery", "unicastPort").as_deref(),
            Some("4160")
        );
        assert_eq!(
            entries.entry("net.jini.discovery", "groups").as_deref(),
            Some("a,b")
        );
        assert_eq!(
            entries
                .entry("org.example.registrar", "initialMemberGroups")
                .as_deref(),
            Some("qa.group")
        );
        assert_eq!(entries.entry("net.jini", "discovery"), None);
        assert_eq!(entries.entry("missing", "x"), None);
    }

    #[test]
    fn test_later_layers_shadow_earlier() {
        let entries = TomlEntries::from_str_layers(&[
            "[svc]\nport = 1\nhost = \"a\"",
            "[svc]\nport = 2",
        ])
        .unwrap();
        assert_eq!(entries.entry("svc", "port").as_deref(), Some("2"));
        assert_eq!(entries.entry("svc", "host").as_deref(), Some("a"));
    }

    #[test]
    fn test_load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[unterminated").unwrap();
        let err = TomlEntries::load(&[path.clone()]).unwrap_err();
        assert!(matches!(err, EntriesError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }
}
