//! Project CRUD. Deletion lives on the dispatcher since it must stop
//! live pipelines first.

use chrono::Utc;

use crate::error::{CiError, CiResult};
use crate::models::project::{CiProject, CiProjectUpdate, NewCiProject, ProjectId};
use crate::services::aggregator::ProjectAggregator;
use crate::store::{ProjectFilter, Repository};

/// List projects matching the filter, newest first.
pub async fn list_projects(
    repo: &dyn Repository,
    filter: &ProjectFilter,
) -> CiResult<Vec<CiProject>> {
    repo.list_projects(filter).await
}

pub async fn get_project(repo: &dyn Repository, id: ProjectId) -> CiResult<CiProject> {
    repo.get_project(id).await
}

/// Find the project tracking a repository URL, e.g. from a push webhook.
pub async fn find_by_repository(
    repo: &dyn Repository,
    url: &str,
) -> CiResult<Option<CiProject>> {
    repo.find_project_by_repository(url).await
}

/// Validate and register a new project.
pub async fn create_project(repo: &dyn Repository, new_project: NewCiProject) -> CiResult<CiProject> {
    let project = new_project.into_project(Utc::now());
    project.validate()?;
    if repo.find_project_by_name(&project.name).await?.is_some() {
        return Err(CiError::invalid(
            "name",
            format!("project '{}' already exists", project.name),
        ));
    }
    let project = repo.create_project(project).await?;

    tracing::info!(project_id = %project.id, name = %project.name, "Project created");
    Ok(project)
}

/// Apply a partial update. Holds the project's rollup lock so counters
/// written by running builds are never overwritten with a stale copy.
pub async fn update_project(
    repo: &dyn Repository,
    aggregator: &ProjectAggregator,
    id: ProjectId,
    update: CiProjectUpdate,
) -> CiResult<CiProject> {
    let _guard = aggregator.lock(id).await;
    let mut project = repo.get_project(id).await?;
    update.apply(&mut project, Utc::now());
    project.validate()?;
    let project = repo.update_project(project).await?;

    tracing::info!(project_id = %project.id, "Project updated");
    Ok(project)
}
