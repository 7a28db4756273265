//! Registry of background log streams, at most one per project

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::runtime::StreamHandle;

/// Owns the background log stream of every project.
///
/// Replacing a project's stream cancels the previous handle before the new
/// one is stored, under the same lock.
#[derive(Debug, Default)]
pub struct LogStreamRegistry {
    handles: Mutex<HashMap<String, StreamHandle>>,
}

impl LogStreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `handle` for `project_id`, cancelling any prior handle first.
    /// Returns whether a prior handle was replaced.
    pub fn replace(&self, project_id: &str, handle: StreamHandle) -> bool {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        let replaced = match handles.remove(project_id) {
            Some(mut old) => {
                old.cancel();
                debug!("Cancelled previous log stream for {}", project_id);
                true
            }
            None => false,
        };
        handles.insert(project_id.to_string(), handle);
        replaced
    }

    /// Cancel and forget the stream of `project_id`. Returns whether one
    /// was active.
    pub fn cancel(&self, project_id: &str) -> bool {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        match handles.remove(project_id) {
            Some(mut handle) => {
                handle.cancel();
                debug!("Cancelled log stream for {}", project_id);
                true
            }
            None => false,
        }
    }

    /// Cancel every stream. Returns how many were active.
    pub fn cancel_all(&self) -> usize {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        let count = handles.len();
        for (_, mut handle) in handles.drain() {
            handle.cancel();
        }
        count
    }

    pub fn contains(&self, project_id: &str) -> bool {
        let handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.contains_key(project_id)
    }

    pub fn len(&self) -> usize {
        let handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
