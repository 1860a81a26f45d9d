//! Project rollup counters derived from build lifecycle transitions.

use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;

use crate::error::{CiError, CiResult};
use crate::models::build::{BuildStatus, CiBuild};
use crate::models::project::{CiProject, ProjectId};
use crate::services::locks::KeyedLocks;
use crate::store::Repository;

/// Serializes every read-modify-write of a project record.
///
/// Project edits from the API take the same lock (see [`Self::lock`]) so
/// they cannot overwrite counters with a stale copy.
pub struct ProjectAggregator {
    repo: Arc<dyn Repository>,
    locks: KeyedLocks<ProjectId>,
}

impl ProjectAggregator {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            locks: KeyedLocks::new(),
        }
    }

    pub async fn lock(&self, project_id: ProjectId) -> OwnedMutexGuard<()> {
        self.locks.lock(&project_id).await
    }

    /// A build was created: count it and mark the project as pending.
    ///
    /// A cancel can reach the build between storage and this call. Its
    /// terminal record already claimed the build number, so the latest
    /// status is left alone.
    pub async fn record_created(&self, build: &CiBuild) -> CiResult<()> {
        self.modify(build.project_id, |project| {
            project.total_builds += 1;
            let is_newer = project
                .last_build_number
                .map_or(true, |latest| build.build_number > latest);
            if is_newer {
                project.last_build_number = Some(build.build_number);
                project.last_build_at = Some(build.created_at);
                project.last_build_status = Some(BuildStatus::Pending);
            }
        })
        .await
    }

    /// A build reached a terminal state.
    pub async fn record_terminal(&self, build: &CiBuild) -> CiResult<()> {
        debug_assert!(build.status.is_terminal());
        self.modify(build.project_id, |project| {
            match build.status {
                BuildStatus::Success => project.successful_builds += 1,
                BuildStatus::Failed => project.failed_builds += 1,
                _ => {}
            }
            let is_latest = project
                .last_build_number
                .map_or(true, |latest| build.build_number >= latest);
            if is_latest {
                project.last_build_number = Some(build.build_number);
                project.last_build_at = Some(build.completed_at.unwrap_or(build.updated_at));
                project.last_build_status = Some(build.status);
            }
        })
        .await
    }

    pub fn forget(&self, project_id: ProjectId) {
        self.locks.forget(&project_id);
    }

    async fn modify(
        &self,
        project_id: ProjectId,
        apply: impl FnOnce(&mut CiProject),
    ) -> CiResult<()> {
        let _guard = self.locks.lock(&project_id).await;
        let mut project = match self.repo.get_project(project_id).await {
            Ok(project) => project,
            Err(CiError::NotFound { .. }) => {
                tracing::debug!(%project_id, "Project gone, skipping rollup update");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        apply(&mut project);
        match self.repo.update_project(project).await {
            Ok(_) => Ok(()),
            Err(CiError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::build::{Provenance, TriggerSource};
    use crate::models::project::NewCiProject;
    use crate::store::MemoryRepository;
    use chrono::Utc;

    async fn setup() -> (Arc<MemoryRepository>, ProjectAggregator, ProjectId) {
        let repo = Arc::new(MemoryRepository::new());
        let project = NewCiProject {
            name: "rollup".into(),
            description: None,
            repository: "https://github.com/acme/rollup".into(),
            branch: None,
            build_command: "make".into(),
            deploy_command: None,
        }
        .into_project(Utc::now());
        let id = project.id;
        repo.create_project(project).await.unwrap();
        let aggregator = ProjectAggregator::new(repo.clone());
        (repo, aggregator, id)
    }

    fn build(project_id: ProjectId, number: u64, status: BuildStatus) -> CiBuild {
        let mut build = CiBuild::new_pending(
            project_id,
            number,
            Provenance {
                commit: None,
                commit_message: None,
                branch: "main".into(),
                author: None,
                author_email: None,
                triggered_by: TriggerSource::Manual,
            },
            Utc::now(),
        );
        build.status = status;
        if status.is_terminal() {
            build.started_at = Some(build.created_at);
            build.completed_at = Some(Utc::now());
        }
        build
    }

    #[tokio::test]
    async fn creation_counts_and_marks_pending() {
        let (repo, aggregator, id) = setup().await;
        aggregator
            .record_created(&build(id, 1, BuildStatus::Pending))
            .await
            .unwrap();

        let project = repo.get_project(id).await.unwrap();
        assert_eq!(project.total_builds, 1);
        assert_eq!(project.last_build_status, Some(BuildStatus::Pending));
        assert!(project.last_build_at.is_some());
    }

    #[tokio::test]
    async fn cancelled_builds_increment_neither_counter() {
        let (repo, aggregator, id) = setup().await;
        aggregator.record_created(&build(id, 1, BuildStatus::Pending)).await.unwrap();
        aggregator
            .record_terminal(&build(id, 1, BuildStatus::Cancelled))
            .await
            .unwrap();

        let project = repo.get_project(id).await.unwrap();
        assert_eq!(project.successful_builds, 0);
        assert_eq!(project.failed_builds, 0);
        assert_eq!(project.last_build_status, Some(BuildStatus::Cancelled));
    }

    #[tokio::test]
    async fn older_build_does_not_overwrite_latest_status() {
        let (repo, aggregator, id) = setup().await;
        aggregator.record_created(&build(id, 1, BuildStatus::Pending)).await.unwrap();
        aggregator.record_created(&build(id, 2, BuildStatus::Pending)).await.unwrap();
        aggregator
            .record_terminal(&build(id, 1, BuildStatus::Failed))
            .await
            .unwrap();

        let project = repo.get_project(id).await.unwrap();
        assert_eq!(project.failed_builds, 1);
        assert_eq!(project.last_build_status, Some(BuildStatus::Pending));
    }

    #[tokio::test]
    async fn creation_recorded_after_cancel_keeps_cancelled_status() {
        let (repo, aggregator, id) = setup().await;
        aggregator
            .record_terminal(&build(id, 1, BuildStatus::Cancelled))
            .await
            .unwrap();
        aggregator
            .record_created(&build(id, 1, BuildStatus::Pending))
            .await
            .unwrap();

        let project = repo.get_project(id).await.unwrap();
        assert_eq!(project.total_builds, 1);
        assert_eq!(project.last_build_number, Some(1));
        assert_eq!(project.last_build_status, Some(BuildStatus::Cancelled));

        aggregator
            .record_created(&build(id, 2, BuildStatus::Pending))
            .await
            .unwrap();
        let project = repo.get_project(id).await.unwrap();
        assert_eq!(project.last_build_status, Some(BuildStatus::Pending));
    }

    #[tokio::test]
    async fn concurrent_terminal_transitions_do_not_lose_increments() {
        let (repo, aggregator, id) = setup().await;
        let aggregator = Arc::new(aggregator);

        let mut handles = Vec::new();
        for n in 1..=40u64 {
            let aggregator = aggregator.clone();
            handles.push(tokio::spawn(async move {
                aggregator.record_created(&build(id, n, BuildStatus::Pending)).await.unwrap();
                let status = if n % 4 == 0 {
                    BuildStatus::Failed
                } else {
                    BuildStatus::Success
                };
                aggregator.record_terminal(&build(id, n, status)).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let project = repo.get_project(id).await.unwrap();
        assert_eq!(project.total_builds, 40);
        assert_eq!(project.successful_builds, 30);
        assert_eq!(project.failed_builds, 10);
    }

    #[tokio::test]
    async fn missing_project_is_ignored() {
        let (_repo, aggregator, _id) = setup().await;
        let orphan = build(uuid::Uuid::new_v4(), 1, BuildStatus::Success);
        assert!(aggregator.record_terminal(&orphan).await.is_ok());
    }
}
