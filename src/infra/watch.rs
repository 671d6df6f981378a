//! Source watcher for the dev server.
//!
//! A change invalidates the dev pool when it touches a path a backend job
//! read (the watched-patterns set) or anything under the runtime module's
//! directory. Writes into ignored directories, such as the HTTP response
//! cache, never do.

use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::{
    application::{dev::DevPool, jobs::WatchedPatterns},
    infra::error::InfraError,
};

#[derive(Debug, Clone)]
pub struct WatchScope {
    root: PathBuf,
    runtime_dir: PathBuf,
    ignored: Vec<PathBuf>,
    patterns: WatchedPatterns,
}

impl WatchScope {
    /// Relative paths are resolved against `root`.
    pub fn new(root: impl Into<PathBuf>, runtime_dir: impl AsRef<Path>, patterns: WatchedPatterns) -> Self {
        let root = root.into();
        let runtime_dir = root.join(runtime_dir);
        Self {
            root,
            runtime_dir,
            ignored: Vec::new(),
            patterns,
        }
    }

    pub fn ignore(mut self, dir: impl AsRef<Path>) -> Self {
        self.ignored.push(self.root.join(dir));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn should_invalidate(&self, path: &Path) -> bool {
        if self.ignored.iter().any(|dir| path.starts_with(dir)) {
            return false;
        }
        if path.starts_with(&self.runtime_dir) {
            return true;
        }
        match path.strip_prefix(&self.root) {
            Ok(relative) => self.patterns.matches(relative),
            Err(_) => self.patterns.matches(path),
        }
    }
}

/// Keeps the OS watcher alive; dropping it stops watching.
pub struct SourceWatcher {
    _watcher: RecommendedWatcher,
}

pub fn watch(scope: WatchScope, pool: DevPool) -> Result<SourceWatcher, InfraError> {
    let root = scope.root().to_path_buf();
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        let event = match result {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    target = "frostline::watch",
                    error = %err,
                    "File watcher reported an error"
                );
                return;
            }
        };
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return;
        }
        if let Some(path) = event.paths.iter().find(|path| scope.should_invalidate(path)) {
            info!(
                target = "frostline::watch",
                path = %path.display(),
                "Source changed; recycling render threads"
            );
            pool.invalidate();
        } else {
            debug!(
                target = "frostline::watch",
                paths = ?event.paths,
                "Ignoring unrelated change"
            );
        }
    })
    .map_err(|err| InfraError::watcher(err.to_string()))?;

    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|err| InfraError::watcher(format!("failed to watch {}: {err}", root.display())))?;

    Ok(SourceWatcher { _watcher: watcher })
}
