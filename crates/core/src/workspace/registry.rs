use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::WorkspaceSettings;

use super::{Workspace, WorkspaceStatus};

/// One registered workspace plus the lock serialising operations on it.
#[derive(Debug)]
pub struct WorkspaceEntry {
    workspace: Mutex<Workspace>,
    settings: WorkspaceSettings,
    op_lock: Mutex<()>,
}

impl WorkspaceEntry {
    pub fn new(workspace: Workspace, settings: WorkspaceSettings) -> Self {
        Self {
            workspace: Mutex::new(workspace),
            settings,
            op_lock: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Workspace {
        lock(&self.workspace).clone()
    }

    pub fn settings(&self) -> &WorkspaceSettings {
        &self.settings
    }

    pub fn set_status(&self, status: WorkspaceStatus) {
        lock(&self.workspace).status = status;
    }

    /// Held for the duration of archive, restore, setup and cleanup.
    pub fn begin_operation(&self) -> MutexGuard<'_, ()> {
        lock(&self.op_lock)
    }
}

/// Explicit store of live workspaces, shared by reference.
#[derive(Debug, Default)]
pub struct WorkspaceRegistry {
    entries: Mutex<HashMap<String, Arc<WorkspaceEntry>>>,
}

impl WorkspaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<WorkspaceEntry>> {
        lock(&self.entries).get(id).cloned()
    }

    pub fn list(&self) -> Vec<Workspace> {
        let mut all: Vec<Workspace> = lock(&self.entries)
            .values()
            .map(|entry| entry.snapshot())
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    pub fn remove(&self, id: &str) -> Option<Arc<WorkspaceEntry>> {
        lock(&self.entries).remove(id)
    }

    /// Registry map guard, for check-then-insert sequences.
    pub(crate) fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<WorkspaceEntry>>> {
        lock(&self.entries)
    }
}

// A panic while holding one of these locks leaves the data consistent, so
// poisoning is ignored.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
