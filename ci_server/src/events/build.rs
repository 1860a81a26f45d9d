//! Build event definitions published on the event bus.

use serde::{Deserialize, Serialize};

use crate::models::build::{BuildId, BuildStatus, CiBuild};
use crate::models::project::ProjectId;

/// A named channel observers subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Incremental status and log updates for one build.
    Build(BuildId),
    /// Lifecycle entry and exit of every build.
    Global,
}

/// Events that can happen to a CI build.
///
/// Each value is computed once at the transition that produced it and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CiBuildEvent {
    /// Build record was created in `pending`.
    BuildCreated {
        build_id: BuildId,
        project_id: ProjectId,
        project_name: String,
        build_number: u64,
        status: BuildStatus,
    },
    /// Build entered a new state; carries the fragment appended with it.
    StatusChanged {
        build_id: BuildId,
        project_id: ProjectId,
        status: BuildStatus,
        log_fragment: Option<String>,
    },
    /// A pipeline step appended to the log.
    LogAppended {
        build_id: BuildId,
        log_fragment: String,
    },
    /// Pipeline reached `success` or `failed`.
    BuildCompleted {
        build_id: BuildId,
        project_id: ProjectId,
        status: BuildStatus,
    },
    /// Build was cancelled on request.
    BuildCancelled {
        build_id: BuildId,
        project_id: ProjectId,
        status: BuildStatus,
    },
}

impl CiBuildEvent {
    pub fn created(build: &CiBuild, project_name: &str) -> Self {
        Self::BuildCreated {
            build_id: build.id,
            project_id: build.project_id,
            project_name: project_name.to_string(),
            build_number: build.build_number,
            status: build.status,
        }
    }

    pub fn status_changed(build: &CiBuild, log_fragment: Option<&str>) -> Self {
        Self::StatusChanged {
            build_id: build.id,
            project_id: build.project_id,
            status: build.status,
            log_fragment: log_fragment.map(str::to_string),
        }
    }

    pub fn log_appended(build_id: BuildId, log_fragment: &str) -> Self {
        Self::LogAppended {
            build_id,
            log_fragment: log_fragment.to_string(),
        }
    }

    /// The global exit event matching a terminal build.
    pub fn finished(build: &CiBuild) -> Self {
        if build.status == BuildStatus::Cancelled {
            Self::BuildCancelled {
                build_id: build.id,
                project_id: build.project_id,
                status: build.status,
            }
        } else {
            Self::BuildCompleted {
                build_id: build.id,
                project_id: build.project_id,
                status: build.status,
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::BuildCreated { .. } => "build-created",
            Self::StatusChanged { .. } => "status-changed",
            Self::LogAppended { .. } => "log-appended",
            Self::BuildCompleted { .. } => "build-completed",
            Self::BuildCancelled { .. } => "build-cancelled",
        }
    }

    pub fn build_id(&self) -> BuildId {
        match self {
            Self::BuildCreated { build_id, .. }
            | Self::StatusChanged { build_id, .. }
            | Self::LogAppended { build_id, .. }
            | Self::BuildCompleted { build_id, .. }
            | Self::BuildCancelled { build_id, .. } => *build_id,
        }
    }

    pub fn status(&self) -> Option<BuildStatus> {
        match self {
            Self::BuildCreated { status, .. }
            | Self::StatusChanged { status, .. }
            | Self::BuildCompleted { status, .. }
            | Self::BuildCancelled { status, .. } => Some(*status),
            Self::LogAppended { .. } => None,
        }
    }
}

/// Observer-side fold of a build's events, used to check ordering.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct CiBuildAggregate {
    pub status: Option<BuildStatus>,
    pub logs: String,
    pub out_of_order: bool,
}

#[cfg(test)]
impl CiBuildAggregate {
    pub fn apply(&mut self, event: &CiBuildEvent) {
        if let Some(next) = event.status() {
            match self.status {
                Some(current) if current == next => {}
                Some(current) if !current.can_transition_to(next) => self.out_of_order = true,
                _ => {}
            }
            self.status = Some(next);
        }
        match event {
            CiBuildEvent::StatusChanged {
                log_fragment: Some(fragment),
                ..
            }
            | CiBuildEvent::LogAppended {
                log_fragment: fragment,
                ..
            } => self.logs.push_str(fragment),
            _ => {}
        }
    }
}
