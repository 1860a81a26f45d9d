//! Build executor: drives one build from `pending` to a terminal state.
//!
//! Steps run strictly in sequence. Each step's log fragment is stored
//! before the next step starts and is published on the build's topic, so
//! observers always see a prefix of the final transcript. Every mutation
//! happens under the run's [`RunControl`] lock, which cancellation shares.
//!
//! Faults never escape: a repository error, step error, step timeout or
//! panic turns into a `failed` build with the detail in its log.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;

use crate::error::CiError;
use crate::events::{CiBuildEvent, EventBus, Topic};
use crate::models::build::{BuildId, BuildStatus};
use crate::models::project::CiProject;
use crate::services::aggregator::ProjectAggregator;
use crate::services::step_executor::{StepError, StepRunner, Verdict};
use crate::store::Repository;

pub const START_LOG: &str = "[INFO] Build started...\n[INFO] Cloning repository...\n";
pub const SUCCESS_LOG: &str =
    "[BUILD] ✓ Build completed successfully\n[SUCCESS] Deployment ready!\n";

pub fn failure_log(reason: &str) -> String {
    format!("[ERROR] Build failed: {reason}\n[FAILED] Build terminated\n")
}

pub fn internal_error_log(detail: &str) -> String {
    format!("[ERROR] Internal error: {detail}\n")
}

/// Synchronization point shared by one pipeline run and whoever cancels it.
#[derive(Clone, Default)]
pub struct RunControl {
    lock: Arc<tokio::sync::Mutex<()>>,
    cancelled: Arc<AtomicBool>,
}

impl RunControl {
    pub async fn lock(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.lock).lock_owned().await
    }

    /// Flag the run as cancelled. Callers hold the lock while doing so.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, thiserror::Error)]
enum PipelineFault {
    #[error(transparent)]
    Store(#[from] CiError),
    #[error(transparent)]
    Step(#[from] StepError),
    #[error("step '{step}' timed out after {secs}s")]
    Timeout { step: String, secs: u64 },
}

pub struct Pipeline {
    repo: Arc<dyn Repository>,
    bus: EventBus,
    aggregator: Arc<ProjectAggregator>,
    runner: Arc<dyn StepRunner>,
    step_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        repo: Arc<dyn Repository>,
        bus: EventBus,
        aggregator: Arc<ProjectAggregator>,
        runner: Arc<dyn StepRunner>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            bus,
            aggregator,
            runner,
            step_timeout,
        }
    }

    /// Run the build to completion. The work happens in a child task so a
    /// panic is observed here and still ends the build as `failed`.
    pub async fn run(self: Arc<Self>, project: CiProject, build_id: BuildId, control: RunControl) {
        let started = Instant::now();
        let worker = {
            let pipeline = Arc::clone(&self);
            let control = control.clone();
            tokio::spawn(async move { pipeline.execute(&project, build_id, &control).await })
        };

        let fault = match worker.await {
            Ok(Ok(())) => None,
            Ok(Err(fault)) => Some(fault.to_string()),
            Err(e) if e.is_panic() => Some(format!(
                "pipeline panicked: {}",
                panic_message(e.into_panic())
            )),
            Err(e) => Some(format!("pipeline task stopped: {e}")),
        };

        if let Some(detail) = fault {
            tracing::error!(%build_id, "Pipeline fault: {detail}");
            if let Err(e) = self
                .terminate(build_id, &control, BuildStatus::Failed, &internal_error_log(&detail))
                .await
            {
                tracing::error!(%build_id, "Could not record pipeline fault: {e}");
            }
        }

        crate::metrics::build_duration(started.elapsed().as_millis() as u64);
    }

    async fn execute(
        &self,
        project: &CiProject,
        build_id: BuildId,
        control: &RunControl,
    ) -> Result<(), PipelineFault> {
        if !self.start(build_id, control).await? {
            return Ok(());
        }

        let mut outputs = Vec::new();
        for step in self.runner.steps(project) {
            if control.is_cancelled() {
                tracing::info!(%build_id, step = %step.name, "Pipeline stopped after cancellation");
                return Ok(());
            }

            tracing::info!(%build_id, step = %step.name, "Running step");
            let step_start = Instant::now();
            let output = tokio::time::timeout(self.step_timeout, self.runner.run(&step))
                .await
                .map_err(|_| PipelineFault::Timeout {
                    step: step.name.clone(),
                    secs: self.step_timeout.as_secs(),
                })??;
            crate::metrics::step_duration(&step.name, step_start.elapsed().as_millis() as u64);

            let guard = control.lock().await;
            if control.is_cancelled() {
                return Ok(());
            }
            self.repo.append_log(build_id, &output.log).await?;
            self.bus.publish(
                Topic::Build(build_id),
                CiBuildEvent::log_appended(build_id, &output.log),
            );
            drop(guard);

            if !output.passed {
                tracing::warn!(%build_id, step = %step.name, "Step failed");
                return self
                    .finish(build_id, control, Verdict::Failed(format!("step '{}' failed", step.name)))
                    .await;
            }
            outputs.push(output);
        }

        let verdict = self.runner.verdict(&outputs);
        self.finish(build_id, control, verdict).await
    }

    /// `pending -> running`. Returns false when the build is no longer pending.
    async fn start(&self, build_id: BuildId, control: &RunControl) -> Result<bool, PipelineFault> {
        let _guard = control.lock().await;
        if control.is_cancelled() {
            return Ok(false);
        }

        let mut build = self.repo.get_build(build_id).await?;
        if !build.status.can_transition_to(BuildStatus::Running) {
            tracing::debug!(%build_id, status = %build.status, "Build not pending, skipping run");
            return Ok(false);
        }

        build.status = BuildStatus::Running;
        build.started_at = Some(Utc::now());
        self.repo.update_build(build).await?;
        let build = self.repo.append_log(build_id, START_LOG).await?;

        self.bus.publish(
            Topic::Build(build_id),
            CiBuildEvent::status_changed(&build, Some(START_LOG)),
        );
        crate::metrics::build_status_changed(BuildStatus::Running.as_str());
        tracing::info!(
            %build_id,
            project_id = %build.project_id,
            build_number = build.build_number,
            "Build started"
        );
        Ok(true)
    }

    async fn finish(
        &self,
        build_id: BuildId,
        control: &RunControl,
        verdict: Verdict,
    ) -> Result<(), PipelineFault> {
        match verdict {
            Verdict::Success => {
                self.terminate(build_id, control, BuildStatus::Success, SUCCESS_LOG)
                    .await
            }
            Verdict::Failed(reason) => {
                self.terminate(build_id, control, BuildStatus::Failed, &failure_log(&reason))
                    .await
            }
        }
    }

    /// Move a live build into `status`, appending `fragment`.
    async fn terminate(
        &self,
        build_id: BuildId,
        control: &RunControl,
        status: BuildStatus,
        fragment: &str,
    ) -> Result<(), PipelineFault> {
        let _guard = control.lock().await;
        if control.is_cancelled() {
            return Ok(());
        }

        let mut build = self.repo.get_build(build_id).await?;
        if build.status.is_terminal() {
            return Ok(());
        }

        let now = Utc::now();
        // A fault before `running` was recorded still gets a start time.
        build.started_at.get_or_insert(now);
        build.completed_at = Some(now);
        build.status = status;
        self.repo.append_log(build_id, fragment).await?;
        let build = self.repo.update_build(build).await?;

        if let Err(e) = self.aggregator.record_terminal(&build).await {
            tracing::warn!(%build_id, "Rollup update failed: {e}");
        }

        self.bus.publish(
            Topic::Build(build_id),
            CiBuildEvent::status_changed(&build, Some(fragment)),
        );
        self.bus.publish(Topic::Global, CiBuildEvent::finished(&build));
        crate::metrics::build_status_changed(status.as_str());

        if status == BuildStatus::Success {
            tracing::info!(%build_id, build_number = build.build_number, duration_secs = ?build.duration, "Build succeeded");
        } else {
            tracing::warn!(%build_id, build_number = build.build_number, %status, "Build did not succeed");
        }
        Ok(())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
