//! Building the run list from test description paths.

use anyhow::{Context, Result, bail};
use dth_common::{TestDescription, TestList, TestRun};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DESCRIPTION_EXTENSION: &str = "td";

/// Expand files, directories (searched recursively for `*.td`) and glob
/// patterns into descriptor paths, in argument order, sorted within each
/// argument.
pub fn expand_paths(args: &[String]) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for arg in args {
        let path = Path::new(arg);
        if path.is_file() {
            paths.push(path.to_path_buf());
            continue;
        }
        let pattern = if path.is_dir() {
            format!("{}/**/*.{DESCRIPTION_EXTENSION}", arg.trim_end_matches('/'))
        } else {
            arg.clone()
        };
        let mut matched: Vec<PathBuf> = glob::glob(&pattern)
            .with_context(|| format!("invalid test pattern {arg}"))?
            .filter_map(|entry| entry.ok())
            .filter(|p| p.is_file())
            .collect();
        if matched.is_empty() {
            bail!("no test descriptions found for {arg}");
        }
        matched.sort();
        paths.append(&mut matched);
    }
    Ok(paths)
}

/// Load every description and add one run per description to a new list.
/// With `categories` non-empty only tests in at least one of them are kept.
pub fn build_test_list(
    paths: &[PathBuf],
    test_root: Option<&Path>,
    categories: &[String],
    config_tag: &str,
    list: &mut TestList,
) -> Result<usize> {
    let mut added = 0;
    for path in paths {
        let description = TestDescription::load(path, test_root)?;
        if !categories.is_empty() && !categories.iter().any(|c| description.in_category(c)) {
            debug!(test = description.name(), "not in a selected category");
            continue;
        }
        list.add(TestRun::new(description, config_tag))?;
        added += 1;
    }
    Ok(added)
}
