//! Persistence boundary for projects and builds.
//!
//! The engine only talks to storage through [`Repository`]; the service
//! ships with [`MemoryRepository`].

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CiResult;
use crate::models::build::{BuildId, BuildStatus, CiBuild};
use crate::models::project::{CiProject, ProjectId, ProjectStatus};

pub use memory::MemoryRepository;

pub const DEFAULT_PAGE_LIMIT: usize = 50;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectFilter {
    pub status: Option<ProjectStatus>,
    /// Case-insensitive substring of the name or repository URL.
    pub search: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildFilter {
    pub project_id: Option<ProjectId>,
    pub status: Option<BuildStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Pagination {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

impl<T> Page<T> {
    pub fn pages(&self) -> usize {
        if self.limit == 0 {
            0
        } else {
            self.total.div_ceil(self.limit)
        }
    }
}

/// Storage operations the engine depends on.
///
/// Build logs are append-only: `update_build` never changes `logs`, only
/// `append_log` grows them.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Fails with a validation error when the name is already taken.
    async fn create_project(&self, project: CiProject) -> CiResult<CiProject>;
    async fn get_project(&self, id: ProjectId) -> CiResult<CiProject>;
    async fn find_project_by_name(&self, name: &str) -> CiResult<Option<CiProject>>;
    /// Match on the repository URL, ignoring case, a trailing `/` and `.git`.
    async fn find_project_by_repository(&self, url: &str) -> CiResult<Option<CiProject>>;
    async fn list_projects(&self, filter: &ProjectFilter) -> CiResult<Vec<CiProject>>;
    async fn update_project(&self, project: CiProject) -> CiResult<CiProject>;
    /// Removes the project and every build it owns, returning the build ids.
    async fn delete_project(&self, id: ProjectId) -> CiResult<Vec<BuildId>>;

    async fn create_build(&self, build: CiBuild) -> CiResult<CiBuild>;
    async fn get_build(&self, id: BuildId) -> CiResult<CiBuild>;
    async fn update_build(&self, build: CiBuild) -> CiResult<CiBuild>;
    async fn append_log(&self, id: BuildId, fragment: &str) -> CiResult<CiBuild>;
    async fn delete_build(&self, id: BuildId) -> CiResult<()>;
    /// Newest first.
    async fn list_builds(&self, filter: &BuildFilter, page: Pagination) -> CiResult<Page<CiBuild>>;
    /// Highest build number stored for the project, 0 when it has none.
    async fn last_build_number(&self, project_id: ProjectId) -> CiResult<u64>;
}
