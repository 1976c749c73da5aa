//! Modification tracking for the files a grammar was read from.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, Clone)]
struct TrackedFile {
    path: PathBuf,
    modified: Option<SystemTime>,
}

/// Snapshot of the modification times of every file a grammar was built from.
///
/// A grammar is dirty as soon as one of those files was modified, deleted or
/// (re)created since the snapshot was taken.
#[derive(Debug, Clone, Default)]
pub struct FilesChangedTracker {
    files: Vec<TrackedFile>,
}

impl FilesChangedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tracker over the given files, recording their current state.
    pub fn from_files<I, P>(files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut tracker = Self::new();
        for file in files {
            tracker.track(file);
        }
        tracker
    }

    pub fn track(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        if self.files.iter().any(|file| file.path == path) {
            return;
        }
        self.files.push(TrackedFile {
            path: path.to_path_buf(),
            modified: modified_time(path),
        });
    }

    pub fn is_dirty(&self) -> bool {
        self.files
            .iter()
            .any(|file| modified_time(&file.path) != file.modified)
    }

    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|file| file.path.as_path())
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
