//! Build: one execution attempt of a project's pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CiError, CiResult, FieldError};
use crate::models::project::{CiProject, ProjectId};

pub type BuildId = Uuid;

pub const QUEUED_LOG: &str = "[INFO] Build queued...\n";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl BuildStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: BuildStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Success)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    #[default]
    Manual,
    Webhook,
    Schedule,
}

impl TriggerSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Webhook => "webhook",
            Self::Schedule => "schedule",
        }
    }
}

/// Where a build's source came from and who asked for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub commit: Option<String>,
    pub commit_message: Option<String>,
    pub branch: String,
    pub author: Option<String>,
    pub author_email: Option<String>,
    pub triggered_by: TriggerSource,
}

impl Provenance {
    pub fn validate(&self) -> CiResult<()> {
        let mut errors = Vec::new();
        if self.commit.as_ref().is_some_and(|c| c.len() > 40) {
            errors.push(FieldError::new("commit", "must be at most 40 characters"));
        }
        if self.branch.trim().is_empty() || self.branch.len() > 100 {
            errors.push(FieldError::new(
                "branch",
                "must be between 1 and 100 characters",
            ));
        }
        if self.author.as_ref().is_some_and(|a| a.len() > 255) {
            errors.push(FieldError::new("author", "must be at most 255 characters"));
        }
        if self.author_email.as_ref().is_some_and(|a| a.len() > 255) {
            errors.push(FieldError::new(
                "author_email",
                "must be at most 255 characters",
            ));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CiError::Validation(errors))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CiBuild {
    pub id: BuildId,
    pub project_id: ProjectId,
    pub build_number: u64,
    pub status: BuildStatus,
    #[serde(flatten)]
    pub provenance: Provenance,
    pub logs: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Whole seconds between start and completion. The repository refreshes
    /// it through `sync_duration` on every write.
    #[serde(default)]
    pub duration: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CiBuild {
    /// A fresh `pending` build whose log holds the queued line.
    pub fn new_pending(
        project_id: ProjectId,
        build_number: u64,
        provenance: Provenance,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            build_number,
            status: BuildStatus::Pending,
            provenance,
            logs: QUEUED_LOG.to_string(),
            started_at: None,
            completed_at: None,
            duration: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn duration_secs(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        }
    }

    /// Refresh the derived `duration` field after a timing change.
    pub fn sync_duration(&mut self) {
        self.duration = self.duration_secs();
    }
}

/// What an observer that missed live events needs to catch up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogSnapshot {
    pub build_id: BuildId,
    pub build_number: u64,
    pub status: BuildStatus,
    pub logs: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&CiBuild> for LogSnapshot {
    fn from(build: &CiBuild) -> Self {
        Self {
            build_id: build.id,
            build_number: build.build_number,
            status: build.status,
            logs: build.logs.clone(),
            started_at: build.started_at,
            completed_at: build.completed_at,
        }
    }
}

/// A request to enqueue a build. Missing fields fall back to manual-trigger
/// defaults when converted with [`TriggerRequest::into_provenance`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerRequest {
    pub project_id: ProjectId,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub commit_message: Option<String>,
    pub author: Option<String>,
    pub author_email: Option<String>,
    pub triggered_by: Option<TriggerSource>,
}

impl TriggerRequest {
    pub fn manual(project_id: ProjectId) -> Self {
        Self {
            project_id,
            ..Self::default()
        }
    }

    pub fn into_provenance(self, project: &CiProject) -> Provenance {
        Provenance {
            commit: Some(non_blank(self.commit).unwrap_or_else(random_commit)),
            commit_message: Some(
                non_blank(self.commit_message).unwrap_or_else(|| "Manual trigger".to_string()),
            ),
            branch: non_blank(self.branch).unwrap_or_else(|| project.branch.clone()),
            author: Some(non_blank(self.author).unwrap_or_else(|| "System".to_string())),
            author_email: Some(
                non_blank(self.author_email)
                    .unwrap_or_else(|| "system@cicd-dashboard.com".to_string()),
            ),
            triggered_by: self.triggered_by.unwrap_or_default(),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Seven hex characters, the length of an abbreviated git hash.
fn random_commit() -> String {
    let mut hex = Uuid::new_v4().simple().to_string();
    hex.truncate(7);
    hex
}
