//! KPI rollups for the CI dashboard.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::CiResult;
use crate::models::build::{BuildStatus, CiBuild};
use crate::models::project::{CiProject, ProjectId};
use crate::store::{BuildFilter, Pagination, Repository};

/// Build counts by status.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BuildsByStatus {
    pub pending: usize,
    pub running: usize,
    pub success: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Per-project statistics, computed from the stored builds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectStats {
    pub project_id: ProjectId,
    pub project_name: String,
    pub total_builds: usize,
    pub by_status: BuildsByStatus,
    /// Share of all builds that succeeded, in percent to two decimals.
    pub success_rate: f64,
    /// Mean duration of completed builds in whole seconds, 0 when none.
    pub avg_build_duration_secs: i64,
    pub last_build_at: Option<DateTime<Utc>>,
    pub last_build_status: Option<BuildStatus>,
}

pub async fn query_project_stats(
    repo: &dyn Repository,
    project_id: ProjectId,
) -> CiResult<ProjectStats> {
    let project = repo.get_project(project_id).await?;
    let builds = repo
        .list_builds(
            &BuildFilter {
                project_id: Some(project_id),
                status: None,
            },
            Pagination {
                limit: usize::MAX,
                offset: 0,
            },
        )
        .await?
        .items;
    Ok(summarize(&project, &builds))
}

fn summarize(project: &CiProject, builds: &[CiBuild]) -> ProjectStats {
    let mut by_status = BuildsByStatus::default();
    for build in builds {
        match build.status {
            BuildStatus::Pending => by_status.pending += 1,
            BuildStatus::Running => by_status.running += 1,
            BuildStatus::Success => by_status.success += 1,
            BuildStatus::Failed => by_status.failed += 1,
            BuildStatus::Cancelled => by_status.cancelled += 1,
        }
    }

    let success_rate = if builds.is_empty() {
        0.0
    } else {
        (by_status.success as f64 / builds.len() as f64 * 10_000.0).round() / 100.0
    };

    let durations: Vec<i64> = builds.iter().filter_map(CiBuild::duration_secs).collect();
    let avg_build_duration_secs = if durations.is_empty() {
        0
    } else {
        (durations.iter().sum::<i64>() as f64 / durations.len() as f64).round() as i64
    };

    ProjectStats {
        project_id: project.id,
        project_name: project.name.clone(),
        total_builds: builds.len(),
        by_status,
        success_rate,
        avg_build_duration_secs,
        last_build_at: project.last_build_at,
        last_build_status: project.last_build_status,
    }
}
