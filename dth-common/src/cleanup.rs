//! Paths scheduled for deletion at the end of a run.
//!
//! The list is a plain file with one absolute path per line so that a run
//! killed before cleanup is finished off by the next process that starts.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

pub const DELETE_LIST_FILE: &str = "dth-delete-list.txt";

#[derive(Debug)]
pub struct DeletionList {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Default for DeletionList {
    fn default() -> Self {
        Self::at(std::env::temp_dir().join(DELETE_LIST_FILE))
    }
}

impl DeletionList {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `target` to the list.
    pub fn register(&self, target: &Path) -> io::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let absolute = std::path::absolute(target)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", absolute.display())?;
        debug!(path = %absolute.display(), "registered for deletion");
        Ok(())
    }

    pub fn entries(&self) -> io::Result<Vec<PathBuf>> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(PathBuf::from)
                .collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Delete every listed path, then the list itself. Returns the number of
    /// paths that could not be removed.
    pub fn process(&self) -> usize {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let entries = match self.entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(list = %self.path.display(), error = %e, "cannot read deletion list");
                return 0;
            }
        };
        let mut failures = 0;
        for entry in &entries {
            if let Err(e) = remove_path(entry) {
                warn!(path = %entry.display(), error = %e, "failed to delete");
                failures += 1;
            }
        }
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(list = %self.path.display(), error = %e, "failed to remove deletion list");
        }
        failures
    }
}

/// Remove a file or directory tree; a missing path is not an error.
pub fn remove_path(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_register_and_process() {
        let dir = tempfile::tempdir().unwrap();
        let list = DeletionList::at(dir.path().join("list.txt"));

        let tree = dir.path().join("group-persist");
        fs::create_dir_all(tree.join("logs")).unwrap();
        fs::write(tree.join("logs").join("x.log"), "x").unwrap();
        let file = dir.path().join("single.tmp");
        fs::write(&file, "y").unwrap();

        list.register(&tree).unwrap();
        list.register(&file).unwrap();
        list.register(&dir.path().join("never-created")).unwrap();
        assert_eq!(list.entries().unwrap().len(), 3);

        assert_eq!(list.process(), 0);
        assert!(!tree.exists());
        assert!(!file.exists());
        assert!(!list.path().exists());
    }

    #[test]
    fn test_process_without_list_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let list = DeletionList::at(dir.path().join("absent.txt"));
        assert_eq!(list.process(), 0);
    }

    #[test]
    #[serial]
    fn test_default_location_is_in_temp_dir() {
        let list = DeletionList::default();
        assert_eq!(list.path(), std::env::temp_dir().join(DELETE_LIST_FILE));
    }
}
