//! Step executor: the capability seam between the pipeline state machine
//! and whatever actually performs the work.
//!
//! The pipeline asks a [`StepRunner`] for the ordered steps of a project,
//! runs them one at a time, and lets the runner decide the final verdict.
//! [`SimulatedStepRunner`] stands in for real tooling with timed sleeps and
//! a weighted coin flip.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::project::CiProject;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStep {
    pub name: String,
    /// Command the step stands for, echoed into the log when present.
    pub command: Option<String>,
    /// How long the simulated step takes.
    pub duration: Duration,
    /// Log text the simulated step produces.
    pub log: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    pub log: String,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
#[error("step '{step}' errored: {message}")]
pub struct StepError {
    pub step: String,
    pub message: String,
}

#[async_trait]
pub trait StepRunner: Send + Sync {
    /// The ordered steps for one build of `project`.
    fn steps(&self, project: &CiProject) -> Vec<PipelineStep>;

    /// Execute a single step. A step that runs but does not pass returns
    /// `Ok` with `passed == false`; `Err` means the step could not run.
    async fn run(&self, step: &PipelineStep) -> Result<StepOutput, StepError>;

    /// Decide the outcome once every step has passed.
    fn verdict(&self, outputs: &[StepOutput]) -> Verdict;
}

pub struct SimulatedStepRunner {
    success_rate: f64,
    delay_scale: f64,
}

impl SimulatedStepRunner {
    pub fn new(success_rate: f64, delay_scale: f64) -> Self {
        Self {
            success_rate: success_rate.clamp(0.0, 1.0),
            delay_scale: delay_scale.max(0.0),
        }
    }

    fn scaled(&self, millis: u64) -> Duration {
        Duration::from_millis(millis).mul_f64(self.delay_scale)
    }
}

#[async_trait]
impl StepRunner for SimulatedStepRunner {
    fn steps(&self, project: &CiProject) -> Vec<PipelineStep> {
        vec![
            PipelineStep {
                name: "install".to_string(),
                command: None,
                duration: self.scaled(2_000),
                log: "[INFO] Installing dependencies...\n".to_string(),
            },
            PipelineStep {
                name: "test".to_string(),
                command: None,
                duration: self.scaled(3_000),
                log: "[INFO] Running tests...\n[TEST] ✓ All tests passed\n".to_string(),
            },
            PipelineStep {
                name: "build".to_string(),
                command: Some(project.build_command.clone()),
                duration: self.scaled(2_000),
                log: "[INFO] Building production bundle...\n".to_string(),
            },
            PipelineStep {
                name: "optimize".to_string(),
                command: None,
                duration: self.scaled(2_000),
                log: "[BUILD] Optimizing assets...\n".to_string(),
            },
        ]
    }

    async fn run(&self, step: &PipelineStep) -> Result<StepOutput, StepError> {
        tokio::time::sleep(step.duration).await;
        let log = match &step.command {
            Some(command) => format!("{}[INFO] $ {command}\n", step.log),
            None => step.log.clone(),
        };
        Ok(StepOutput { log, passed: true })
    }

    fn verdict(&self, _outputs: &[StepOutput]) -> Verdict {
        if roll() < self.success_rate {
            Verdict::Success
        } else {
            Verdict::Failed("Module not found".to_string())
        }
    }
}

/// Uniform sample in `[0, 1)` taken from the random bits of a v4 UUID.
fn roll() -> f64 {
    // The top 48 bits of a v4 UUID precede the version nibble.
    let bits = Uuid::new_v4().as_u128() >> 80;
    bits as f64 / (1u64 << 48) as f64
}
