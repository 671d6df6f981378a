use std::{
    collections::BTreeSet,
    path::Path,
    sync::{Arc, RwLock},
};

use globset::{Glob, GlobSetBuilder};
use tracing::warn;

use crate::util::lock::{rw_read, rw_write};

/// Paths and glob patterns read by file-touching jobs.
///
/// Append-only for the lifetime of a build or dev session; only a full
/// rebuild clears it.
#[derive(Debug, Clone, Default)]
pub struct WatchedPatterns {
    inner: Arc<RwLock<BTreeSet<String>>>,
}

impl WatchedPatterns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pattern: impl Into<String>) {
        let pattern = pattern.into();
        if rw_read(&self.inner, "watched_patterns", "contains").contains(&pattern) {
            return;
        }
        rw_write(&self.inner, "watched_patterns", "insert").insert(pattern);
    }

    pub fn snapshot(&self) -> Vec<String> {
        rw_read(&self.inner, "watched_patterns", "snapshot")
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.inner, "watched_patterns", "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        rw_write(&self.inner, "watched_patterns", "clear").clear();
    }

    /// Whether `relative` (a path relative to the project root) is covered by
    /// any watched path or glob.
    pub fn matches(&self, relative: &Path) -> bool {
        let patterns = self.snapshot();
        if patterns.is_empty() {
            return false;
        }

        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            let normalized = pattern.trim_start_matches("./");
            match Glob::new(normalized) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(err) => {
                    warn!(
                        target = "application::jobs::watch",
                        pattern = %pattern,
                        error = %err,
                        "Ignoring watched pattern that is not a valid glob"
                    );
                }
            }
        }

        match builder.build() {
            Ok(set) => set.is_match(relative),
            Err(err) => {
                warn!(
                    target = "application::jobs::watch",
                    error = %err,
                    "Failed to compile watched patterns"
                );
                false
            }
        }
    }
}
