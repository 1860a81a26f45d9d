//! Per-project build number allocation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::CiResult;
use crate::models::project::ProjectId;
use crate::services::locks::KeyedLocks;
use crate::store::Repository;

/// Issues strictly increasing build numbers per project.
///
/// The high-water mark lives in memory and is seeded from the repository
/// on first use, so a number stays retired even after its build is
/// deleted. Gaps are allowed.
pub struct BuildCounter {
    repo: Arc<dyn Repository>,
    locks: KeyedLocks<ProjectId>,
    issued: Mutex<HashMap<ProjectId, u64>>,
}

impl BuildCounter {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            locks: KeyedLocks::new(),
            issued: Mutex::new(HashMap::new()),
        }
    }

    pub async fn next(&self, project_id: ProjectId) -> CiResult<u64> {
        let _guard = self.locks.lock(&project_id).await;
        let stored = self.repo.last_build_number(project_id).await?;

        let mut issued = self.issued.lock().unwrap_or_else(|e| e.into_inner());
        let last = issued.get(&project_id).copied().unwrap_or(0).max(stored);
        let next = last + 1;
        issued.insert(project_id, next);
        Ok(next)
    }

    /// Release bookkeeping for a deleted project.
    pub fn forget(&self, project_id: ProjectId) {
        self.issued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&project_id);
        self.locks.forget(&project_id);
    }
}
