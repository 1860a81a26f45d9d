//! Build reads: single builds, filtered listings and log snapshots.

use crate::error::CiResult;
use crate::models::build::{BuildId, CiBuild, LogSnapshot};
use crate::store::{BuildFilter, Page, Pagination, Repository};

/// Get a build by ID.
pub async fn get_build(repo: &dyn Repository, id: BuildId) -> CiResult<CiBuild> {
    repo.get_build(id).await
}

/// List builds newest first.
pub async fn list_builds(
    repo: &dyn Repository,
    filter: &BuildFilter,
    page: Pagination,
) -> CiResult<Page<CiBuild>> {
    repo.list_builds(filter, page).await
}

/// Current log and timing of a build, for observers catching up.
pub async fn get_logs(repo: &dyn Repository, id: BuildId) -> CiResult<LogSnapshot> {
    let build = repo.get_build(id).await?;
    Ok(LogSnapshot::from(&build))
}
