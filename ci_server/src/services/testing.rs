//! Deterministic fixtures for engine tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use crate::models::build::{BuildStatus, CiBuild, Provenance, TriggerSource};
use crate::models::project::{CiProject, NewCiProject, ProjectId};
use crate::services::step_executor::{PipelineStep, StepError, StepOutput, StepRunner, Verdict};
use crate::store::Repository;

pub fn fixture_project(name: &str) -> CiProject {
    NewCiProject {
        name: name.to_string(),
        description: None,
        repository: format!("https://github.com/acme/{name}"),
        branch: None,
        build_command: "cargo build --release".to_string(),
        deploy_command: None,
    }
    .into_project(Utc::now())
}

pub fn pending_build(project_id: ProjectId, number: u64) -> CiBuild {
    CiBuild::new_pending(
        project_id,
        number,
        Provenance {
            commit: Some("abc1234".into()),
            commit_message: Some("test".into()),
            branch: "main".into(),
            author: None,
            author_email: None,
            triggered_by: TriggerSource::Manual,
        },
        Utc::now(),
    )
}

/// Pauses a run at one step until the test releases it.
#[derive(Default)]
pub struct Gate {
    pub reached: Notify,
    pub release: Notify,
}

/// A [`StepRunner`] whose steps, failures and timing are fixed up front.
pub struct ScriptedRunner {
    steps: usize,
    verdict: Verdict,
    fail_at: Option<usize>,
    error_at: Option<usize>,
    panic_at: Option<usize>,
    gate: Option<(usize, Arc<Gate>)>,
    step_delay: Duration,
}

impl ScriptedRunner {
    pub fn passing(steps: usize) -> Self {
        Self {
            steps,
            verdict: Verdict::Success,
            fail_at: None,
            error_at: None,
            panic_at: None,
            gate: None,
            step_delay: Duration::ZERO,
        }
    }

    pub fn with_verdict(mut self, verdict: Verdict) -> Self {
        self.verdict = verdict;
        self
    }

    pub fn failing_at(mut self, step: usize) -> Self {
        self.fail_at = Some(step);
        self
    }

    pub fn erroring_at(mut self, step: usize) -> Self {
        self.error_at = Some(step);
        self
    }

    pub fn panicking_at(mut self, step: usize) -> Self {
        self.panic_at = Some(step);
        self
    }

    pub fn gated_at(mut self, step: usize, gate: Arc<Gate>) -> Self {
        self.gate = Some((step, gate));
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }
}

#[async_trait]
impl StepRunner for ScriptedRunner {
    fn steps(&self, _project: &CiProject) -> Vec<PipelineStep> {
        (0..self.steps)
            .map(|i| PipelineStep {
                name: format!("step-{i}"),
                command: None,
                duration: self.step_delay,
                log: format!("[STEP] step-{i}\n"),
            })
            .collect()
    }

    async fn run(&self, step: &PipelineStep) -> Result<StepOutput, StepError> {
        let index: usize = step
            .name
            .trim_start_matches("step-")
            .parse()
            .unwrap_or_default();

        if let Some((at, gate)) = &self.gate {
            if *at == index {
                gate.reached.notify_one();
                gate.release.notified().await;
            }
        }
        if !step.duration.is_zero() {
            tokio::time::sleep(step.duration).await;
        }
        if self.panic_at == Some(index) {
            panic!("runner exploded");
        }
        if self.error_at == Some(index) {
            return Err(StepError {
                step: step.name.clone(),
                message: "disk full".to_string(),
            });
        }
        Ok(StepOutput {
            log: step.log.clone(),
            passed: self.fail_at != Some(index),
        })
    }

    fn verdict(&self, _outputs: &[StepOutput]) -> Verdict {
        self.verdict.clone()
    }
}

/// Poll until the build reaches a terminal state.
pub async fn wait_terminal(repo: &dyn Repository, build_id: uuid::Uuid) -> CiBuild {
    for _ in 0..500 {
        let build = repo.get_build(build_id).await.unwrap();
        if build.status.is_terminal() {
            return build;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("build {build_id} never finished");
}

/// Poll until the build reaches `status`.
pub async fn wait_status(repo: &dyn Repository, build_id: uuid::Uuid, status: BuildStatus) {
    for _ in 0..500 {
        if repo.get_build(build_id).await.unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("build {build_id} never reached {status}");
}
