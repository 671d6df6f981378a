use std::{sync::Arc, time::Instant};

use dashmap::DashMap;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct StartSpinner {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct StopSpinner {
    pub id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default = "default_success")]
    pub success: bool,
}

fn default_success() -> bool {
    true
}

#[derive(Debug)]
struct ActiveSpinner {
    text: String,
    started_at: Instant,
}

/// Progress indicators started by runtimes, reported through tracing.
///
/// Shared by every worker so a spinner started on one render thread can be
/// stopped from another.
#[derive(Debug, Clone, Default)]
pub struct SpinnerRegistry {
    active: Arc<DashMap<String, ActiveSpinner>>,
}

impl SpinnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, job: &StartSpinner) -> String {
        let id = Uuid::new_v4().to_string();
        info!(
            target = "application::jobs::spinner",
            spinner_id = %id,
            "{}",
            job.text
        );
        self.active.insert(
            id.clone(),
            ActiveSpinner {
                text: job.text.clone(),
                started_at: Instant::now(),
            },
        );
        id
    }

    /// Stopping an unknown spinner is logged and otherwise ignored.
    pub fn stop(&self, job: &StopSpinner) {
        let Some((_, spinner)) = self.active.remove(&job.id) else {
            warn!(
                target = "application::jobs::spinner",
                spinner_id = %job.id,
                "Stop requested for unknown spinner"
            );
            return;
        };

        let text = job.text.as_deref().unwrap_or(&spinner.text);
        let elapsed_ms = spinner.started_at.elapsed().as_millis() as u64;
        if job.success {
            info!(
                target = "application::jobs::spinner",
                spinner_id = %job.id,
                result = "success",
                elapsed_ms,
                "{text}"
            );
        } else {
            warn!(
                target = "application::jobs::spinner",
                spinner_id = %job.id,
                result = "failure",
                elapsed_ms,
                "{text}"
            );
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_and_stop_track_active_spinners() {
        let registry = SpinnerRegistry::new();
        let id = registry.start(&StartSpinner {
            text: "Fetching".into(),
        });
        assert_eq!(registry.active_count(), 1);

        registry.stop(&StopSpinner {
            id,
            text: None,
            success: true,
        });
        assert_eq!(registry.active_count(), 0);

        registry.stop(&StopSpinner {
            id: "missing".into(),
            text: None,
            success: false,
        });
    }
}
