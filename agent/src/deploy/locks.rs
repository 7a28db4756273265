//! Per-project mutual exclusion for deploy, stop and cleanup

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Set of projects with an operation in flight
#[derive(Debug, Clone, Default)]
pub struct ProjectLocks {
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Marks a project busy until dropped
#[derive(Debug)]
pub struct ProjectGuard {
    project_id: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `project_id` busy. Returns `None` when another operation already
    /// holds it.
    pub fn try_acquire(&self, project_id: &str) -> Option<ProjectGuard> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(project_id.to_string()) {
            return None;
        }
        Some(ProjectGuard {
            project_id: project_id.to_string(),
            in_flight: self.in_flight.clone(),
        })
    }

    pub fn is_locked(&self, project_id: &str) -> bool {
        let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.contains(project_id)
    }
}

impl Drop for ProjectGuard {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&self.project_id);
    }
}
