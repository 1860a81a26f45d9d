//! In-process repository backed by hash maps.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use super::{BuildFilter, Page, Pagination, ProjectFilter, Repository};
use crate::error::{CiError, CiResult};
use crate::models::build::{BuildId, CiBuild};
use crate::models::project::{repository_key, CiProject, ProjectId};

#[derive(Default)]
struct Tables {
    projects: HashMap<ProjectId, CiProject>,
    builds: HashMap<BuildId, CiBuild>,
}

#[derive(Default)]
pub struct MemoryRepository {
    tables: RwLock<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn duplicate_name(name: &str) -> CiError {
    CiError::invalid("name", format!("project '{name}' already exists"))
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_project(&self, project: CiProject) -> CiResult<CiProject> {
        let mut tables = self.write();
        if tables.projects.values().any(|p| p.name == project.name) {
            return Err(duplicate_name(&project.name));
        }
        tables.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: ProjectId) -> CiResult<CiProject> {
        self.read()
            .projects
            .get(&id)
            .cloned()
            .ok_or_else(|| CiError::not_found("project", id))
    }

    async fn find_project_by_name(&self, name: &str) -> CiResult<Option<CiProject>> {
        Ok(self
            .read()
            .projects
            .values()
            .find(|p| p.name == name)
            .cloned())
    }

    async fn find_project_by_repository(&self, url: &str) -> CiResult<Option<CiProject>> {
        let key = repository_key(url);
        Ok(self
            .read()
            .projects
            .values()
            .find(|p| repository_key(&p.repository) == key)
            .cloned())
    }

    async fn list_projects(&self, filter: &ProjectFilter) -> CiResult<Vec<CiProject>> {
        let needle = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        let mut projects: Vec<CiProject> = self
            .read()
            .projects
            .values()
            .filter(|p| filter.status.map_or(true, |s| p.status == s))
            .filter(|p| {
                needle.as_ref().map_or(true, |n| {
                    p.name.to_lowercase().contains(n) || p.repository.to_lowercase().contains(n)
                })
            })
            .cloned()
            .collect();
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(projects)
    }

    async fn update_project(&self, project: CiProject) -> CiResult<CiProject> {
        let mut tables = self.write();
        if !tables.projects.contains_key(&project.id) {
            return Err(CiError::not_found("project", project.id));
        }
        if tables
            .projects
            .values()
            .any(|p| p.id != project.id && p.name == project.name)
        {
            return Err(duplicate_name(&project.name));
        }
        tables.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn delete_project(&self, id: ProjectId) -> CiResult<Vec<BuildId>> {
        let mut tables = self.write();
        if tables.projects.remove(&id).is_none() {
            return Err(CiError::not_found("project", id));
        }
        let owned: Vec<BuildId> = tables
            .builds
            .values()
            .filter(|b| b.project_id == id)
            .map(|b| b.id)
            .collect();
        for build_id in &owned {
            tables.builds.remove(build_id);
        }
        Ok(owned)
    }

    async fn create_build(&self, mut build: CiBuild) -> CiResult<CiBuild> {
        let mut tables = self.write();
        if !tables.projects.contains_key(&build.project_id) {
            return Err(CiError::not_found("project", build.project_id));
        }
        let taken = tables
            .builds
            .values()
            .any(|b| b.project_id == build.project_id && b.build_number == build.build_number);
        if taken {
            return Err(CiError::Internal(format!(
                "build number {} already issued for project {}",
                build.build_number, build.project_id
            )));
        }
        build.sync_duration();
        tables.builds.insert(build.id, build.clone());
        Ok(build)
    }

    async fn get_build(&self, id: BuildId) -> CiResult<CiBuild> {
        self.read()
            .builds
            .get(&id)
            .cloned()
            .ok_or_else(|| CiError::not_found("build", id))
    }

    async fn update_build(&self, mut build: CiBuild) -> CiResult<CiBuild> {
        let mut tables = self.write();
        let stored = tables
            .builds
            .get_mut(&build.id)
            .ok_or_else(|| CiError::not_found("build", build.id))?;
        build.logs = std::mem::take(&mut stored.logs);
        build.updated_at = Utc::now();
        build.sync_duration();
        *stored = build;
        Ok(stored.clone())
    }

    async fn append_log(&self, id: BuildId, fragment: &str) -> CiResult<CiBuild> {
        let mut tables = self.write();
        let stored = tables
            .builds
            .get_mut(&id)
            .ok_or_else(|| CiError::not_found("build", id))?;
        stored.logs.push_str(fragment);
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn delete_build(&self, id: BuildId) -> CiResult<()> {
        self.write()
            .builds
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CiError::not_found("build", id))
    }

    async fn list_builds(&self, filter: &BuildFilter, page: Pagination) -> CiResult<Page<CiBuild>> {
        let mut builds: Vec<CiBuild> = self
            .read()
            .builds
            .values()
            .filter(|b| filter.project_id.map_or(true, |p| b.project_id == p))
            .filter(|b| filter.status.map_or(true, |s| b.status == s))
            .cloned()
            .collect();
        builds.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.build_number.cmp(&a.build_number))
        });

        let total = builds.len();
        let items = builds
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect();
        Ok(Page {
            items,
            total,
            limit: page.limit,
            offset: page.offset,
        })
    }

    async fn last_build_number(&self, project_id: ProjectId) -> CiResult<u64> {
        Ok(self
            .read()
            .builds
            .values()
            .filter(|b| b.project_id == project_id)
            .map(|b| b.build_number)
            .max()
            .unwrap_or(0))
    }
}
