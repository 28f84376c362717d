//! Test descriptions parsed from `.td` property files.

use crate::config::properties::{Properties, load_properties};
use crate::errors::{Result, TestException};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Property naming the test implementation registered in the test VM.
pub const TEST_CLASS_KEY: &str = "testClass";
/// Comma/space separated categories.
pub const TEST_CATEGORIES_KEY: &str = "testCategories";
/// Further descriptor files merged underneath this one.
pub const INCLUDE_KEY: &str = "include";

/// One test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDescription {
    name: String,
    test_class: String,
    categories: Vec<String>,
    properties: Properties,
    /// Directory holding the descriptor; used for test-relative file lookup.
    dir: Option<PathBuf>,
}

impl TestDescription {
    /// Build a description directly (used by tests and embedded runners).
    pub fn new(name: impl Into<String>, properties: Properties) -> Self {
        let test_class = properties.get(TEST_CLASS_KEY).cloned().unwrap_or_default();
        let categories = properties
            .get(TEST_CATEGORIES_KEY)
            .map(|c| split_list(c))
            .unwrap_or_default();
        Self {
            name: name.into(),
            test_class,
            categories,
            properties,
            dir: None,
        }
    }

    /// Parse `path`, naming the test relative to `test_root` when possible.
    pub fn load(path: &Path, test_root: Option<&Path>) -> Result<Self> {
        let mut visited = HashSet::new();
        let properties = load_with_includes(path, &mut visited)?;
        let name = test_root
            .and_then(|root| path.strip_prefix(root).ok())
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        let mut desc = Self::new(name, properties);
        if desc.test_class.is_empty() {
            return Err(TestException::new(format!(
                "test description {} does not define {TEST_CLASS_KEY}",
                path.display()
            )));
        }
        desc.dir = path.parent().map(Path::to_path_buf);
        Ok(desc)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn test_class(&self) -> &str {
        &self.test_class
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    #[must_use]
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn in_category(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c.eq_ignore_ascii_case(category))
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn load_with_includes(path: &Path, visited: &mut HashSet<PathBuf>) -> Result<Properties> {
    let canonical = std::fs::canonicalize(path).map_err(|e| {
        TestException::with_cause(format!("cannot read test description {}", path.display()), e)
    })?;
    if !visited.insert(canonical.clone()) {
        return Err(TestException::new(format!(
            "include cycle through {}",
            path.display()
        )));
    }
    let own = load_properties(&canonical).map_err(|e| {
        TestException::with_cause(format!("cannot read test description {}", path.display()), e)
    })?;

    let mut merged = Properties::new();
    if let Some(includes) = own.get(INCLUDE_KEY) {
        let base = canonical.parent().unwrap_or(Path::new("."));
        for include in split_list(includes) {
            let included = load_with_includes(&base.join(include), visited)?;
            merged.extend(included);
        }
    }
    merged.extend(own.into_iter().filter(|(k, _)| k != INCLUDE_KEY));
    visited.remove(&canonical);
    Ok(merged)
}
