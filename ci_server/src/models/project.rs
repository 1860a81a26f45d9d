//! Project: a tracked repository with its build configuration and rollup counters.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CiError, CiResult, FieldError};
use crate::models::build::BuildStatus;

pub type ProjectId = Uuid;

pub const DEFAULT_BRANCH: &str = "main";

static URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https?|git|ssh)://[A-Za-z0-9]([A-Za-z0-9.@:_-]*[A-Za-z0-9])?(/\S*)?$")
        .unwrap()
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    #[default]
    Active,
    Inactive,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CiProject {
    pub id: ProjectId,
    pub name: String,
    pub description: Option<String>,
    pub repository: String,
    pub branch: String,
    pub build_command: String,
    pub deploy_command: Option<String>,
    pub status: ProjectStatus,
    pub total_builds: u64,
    pub successful_builds: u64,
    pub failed_builds: u64,
    pub last_build_at: Option<DateTime<Utc>>,
    pub last_build_status: Option<BuildStatus>,
    pub last_build_number: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CiProject {
    /// Checks the configuration fields, collecting every failure.
    pub fn validate(&self) -> CiResult<()> {
        let mut errors = Vec::new();

        let name_len = self.name.chars().count();
        if !(3..=100).contains(&name_len) {
            errors.push(FieldError::new(
                "name",
                "must be between 3 and 100 characters",
            ));
        }

        if self.repository.trim().is_empty() {
            errors.push(FieldError::new("repository", "is required"));
        } else if self.repository.len() > 500 || !URL_REGEX.is_match(&self.repository) {
            errors.push(FieldError::new("repository", "must be a valid URL"));
        }

        if self.branch.trim().is_empty() || self.branch.len() > 100 {
            errors.push(FieldError::new(
                "branch",
                "must be between 1 and 100 characters",
            ));
        }

        if self.build_command.trim().is_empty() {
            errors.push(FieldError::new("build_command", "is required"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CiError::Validation(errors))
        }
    }
}

/// Comparison key for repository URLs: `https://github.com/Acme/API.git/`
/// and `https://github.com/acme/api` name the same repository.
pub fn repository_key(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    url.strip_suffix(".git").unwrap_or(url).to_lowercase()
}

/// Request body for registering a project.
#[derive(Debug, Clone, Deserialize)]
pub struct NewCiProject {
    pub name: String,
    pub description: Option<String>,
    pub repository: String,
    pub branch: Option<String>,
    pub build_command: String,
    pub deploy_command: Option<String>,
}

impl NewCiProject {
    /// Builds an active project with zeroed counters. Does not validate.
    pub fn into_project(self, now: DateTime<Utc>) -> CiProject {
        CiProject {
            id: Uuid::new_v4(),
            name: self.name.trim().to_string(),
            description: self.description,
            repository: self.repository.trim().to_string(),
            branch: self
                .branch
                .filter(|b| !b.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
            build_command: self.build_command,
            deploy_command: self.deploy_command,
            status: ProjectStatus::Active,
            total_builds: 0,
            successful_builds: 0,
            failed_builds: 0,
            last_build_at: None,
            last_build_status: None,
            last_build_number: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CiProjectUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub build_command: Option<String>,
    pub deploy_command: Option<String>,
    pub status: Option<ProjectStatus>,
}

impl CiProjectUpdate {
    pub fn apply(self, project: &mut CiProject, now: DateTime<Utc>) {
        if let Some(name) = self.name {
            project.name = name.trim().to_string();
        }
        if let Some(description) = self.description {
            project.description = Some(description);
        }
        if let Some(repository) = self.repository {
            project.repository = repository.trim().to_string();
        }
        if let Some(branch) = self.branch {
            project.branch = branch;
        }
        if let Some(build_command) = self.build_command {
            project.build_command = build_command;
        }
        if let Some(deploy_command) = self.deploy_command {
            project.deploy_command = Some(deploy_command);
        }
        if let Some(status) = self.status {
            project.status = status;
        }
        project.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_project(name: &str, repository: &str, build_command: &str) -> NewCiProject {
        NewCiProject {
            name: name.to_string(),
            description: None,
            repository: repository.to_string(),
            branch: None,
            build_command: build_command.to_string(),
            deploy_command: None,
        }
    }

    #[test]
    fn defaults_branch_and_status() {
        let project = new_project("web-app", "https://github.com/acme/web-app", "npm run build")
            .into_project(Utc::now());
        assert_eq!(project.branch, "main");
        assert_eq!(project.status, ProjectStatus::Active);
        assert_eq!(project.total_builds, 0);
        assert!(project.validate().is_ok());
    }

    #[test]
    fn rejects_short_name_bad_url_and_blank_command() {
        let project = new_project("ab", "not a url", "   ").into_project(Utc::now());
        let Err(CiError::Validation(errors)) = project.validate() else {
            panic!("expected validation error");
        };
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["name", "repository", "build_command"]);
    }

    #[test]
    fn accepts_common_repository_urls() {
        for url in [
            "https://github.com/acme/api",
            "http://gitlab.internal:8080/team/api.git",
            "ssh://git@github.com/acme/api.git",
            "git://github.com/acme/api.git",
        ] {
            let project = new_project("api", url, "make").into_project(Utc::now());
            assert!(project.validate().is_ok(), "{url} should be accepted");
        }
    }

    #[test]
    fn rejects_non_git_url_schemes() {
        for url in ["ftp://files.example.com/repo", "file:///srv/repo.git"] {
            let project = new_project("api", url, "make").into_project(Utc::now());
            let Err(CiError::Validation(errors)) = project.validate() else {
                panic!("{url} should be rejected");
            };
            assert_eq!(errors[0].field, "repository");
        }
    }

    #[test]
    fn update_keeps_absent_fields() {
        let mut project = new_project("api", "https://github.com/acme/api", "make")
            .into_project(Utc::now());
        let update = CiProjectUpdate {
            branch: Some("develop".into()),
            status: Some(ProjectStatus::Archived),
            ..Default::default()
        };
        update.apply(&mut project, Utc::now());
        assert_eq!(project.name, "api");
        assert_eq!(project.branch, "develop");
        assert_eq!(project.status, ProjectStatus::Archived);
        assert_eq!(project.build_command, "make");
    }

    #[test]
    fn repository_key_ignores_case_and_git_suffix() {
        assert_eq!(
            repository_key("https://github.com/Acme/API.git/"),
            repository_key("https://github.com/acme/api")
        );
        assert_ne!(
            repository_key("https://github.com/acme/api"),
            repository_key("https://github.com/acme/api-docs")
        );
    }
}
