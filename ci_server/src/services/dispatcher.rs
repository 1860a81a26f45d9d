//! Dispatcher: accepts trigger requests, starts pipelines in the
//! background, and routes cancellation and deletion to live runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;

use crate::error::{CiError, CiResult};
use crate::events::{CiBuildEvent, EventBus, Topic};
use crate::models::build::{BuildId, BuildStatus, CiBuild, TriggerRequest};
use crate::models::project::{CiProject, ProjectId};
use crate::services::aggregator::ProjectAggregator;
use crate::services::build_counter::BuildCounter;
use crate::services::executor::{Pipeline, RunControl};
use crate::store::Repository;

pub const CANCEL_LOG: &str = "\n[INFO] Build cancelled by user\n";
pub const SHUTDOWN_LOG: &str = "\n[INFO] Build cancelled: server shutting down\n";

struct ActiveRun {
    project_id: ProjectId,
    control: RunControl,
}

type RunTable = Arc<Mutex<HashMap<BuildId, ActiveRun>>>;

pub struct Dispatcher {
    repo: Arc<dyn Repository>,
    bus: EventBus,
    counter: BuildCounter,
    aggregator: Arc<ProjectAggregator>,
    pipeline: Arc<Pipeline>,
    runs: RunTable,
    tasks: Mutex<JoinSet<()>>,
    closed: AtomicBool,
    shutdown_grace: Duration,
}

impl Dispatcher {
    pub fn new(
        repo: Arc<dyn Repository>,
        bus: EventBus,
        aggregator: Arc<ProjectAggregator>,
        pipeline: Arc<Pipeline>,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            counter: BuildCounter::new(repo.clone()),
            repo,
            bus,
            aggregator,
            pipeline,
            runs: Arc::new(Mutex::new(HashMap::new())),
            tasks: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
            shutdown_grace,
        }
    }

    /// Create a `pending` build and start its pipeline. Returns as soon as
    /// the build is stored; the pipeline keeps running in the background.
    pub async fn trigger(&self, request: TriggerRequest) -> CiResult<CiBuild> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CiError::InvalidState(
                "server is shutting down; no new builds are accepted".to_string(),
            ));
        }

        let project = self.repo.get_project(request.project_id).await?;
        let provenance = request.into_provenance(&project);
        provenance.validate()?;

        let number = self.counter.next(project.id).await?;
        let build = self
            .repo
            .create_build(CiBuild::new_pending(project.id, number, provenance, Utc::now()))
            .await?;

        if let Err(e) = self.aggregator.record_created(&build).await {
            tracing::warn!(build_id = %build.id, "Rollup update failed: {e}");
        }
        self.bus
            .publish(Topic::Global, CiBuildEvent::created(&build, &project.name));
        crate::metrics::build_status_changed(BuildStatus::Pending.as_str());
        tracing::info!(
            build_id = %build.id,
            project = %project.name,
            build_number = build.build_number,
            trigger = build.provenance.triggered_by.as_str(),
            "Build queued"
        );

        if !self.start(project, &build)? {
            tracing::warn!(build_id = %build.id, "Shutdown began while queuing, cancelling build");
            return self.cancel_with(build.id, SHUTDOWN_LOG).await;
        }
        Ok(build)
    }

    /// Spawn the build's pipeline. Returns `false` without spawning once
    /// shutdown has taken the task set.
    fn start(&self, project: CiProject, build: &CiBuild) -> CiResult<bool> {
        let build_id = build.id;
        let control = RunControl::default();
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if self.closed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        {
            let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
            if runs.contains_key(&build_id) {
                return Err(CiError::InvalidState(format!(
                    "build {build_id} already has an active pipeline"
                )));
            }
            runs.insert(
                build_id,
                ActiveRun {
                    project_id: project.id,
                    control: control.clone(),
                },
            );
            crate::metrics::active_builds(runs.len());
        }

        let pipeline = Arc::clone(&self.pipeline);
        let runs = Arc::clone(&self.runs);
        // Reap finished runs so the set does not grow without bound.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            pipeline.run(project, build_id, control).await;
            let mut runs = runs.lock().unwrap_or_else(|e| e.into_inner());
            runs.remove(&build_id);
            crate::metrics::active_builds(runs.len());
        });
        Ok(true)
    }

    pub fn active_count(&self) -> usize {
        self.runs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Cancel a `pending` or `running` build.
    pub async fn cancel(&self, build_id: BuildId) -> CiResult<CiBuild> {
        self.cancel_with(build_id, CANCEL_LOG).await
    }

    async fn cancel_with(&self, build_id: BuildId, fragment: &str) -> CiResult<CiBuild> {
        let control = self.control_for(build_id);
        let _guard = control.lock().await;

        let mut build = self.repo.get_build(build_id).await?;
        if !build.status.can_transition_to(BuildStatus::Cancelled) {
            return Err(CiError::InvalidState(format!(
                "build #{} is already {}; only pending or running builds can be cancelled",
                build.build_number, build.status
            )));
        }

        control.cancel();
        let now = Utc::now();
        build.status = BuildStatus::Cancelled;
        build.completed_at = Some(now);
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
        crate::metrics::build_status_changed(BuildStatus::Cancelled.as_str());
        tracing::info!(%build_id, build_number = build.build_number, "Build cancelled");
        Ok(build)
    }

    /// Delete a build, stopping its pipeline first if one is live.
    pub async fn delete_build(&self, build_id: BuildId) -> CiResult<()> {
        let control = self.control_for(build_id);
        {
            let _guard = control.lock().await;
            control.cancel();
        }
        self.repo.delete_build(build_id).await?;
        tracing::info!(%build_id, "Build deleted");
        Ok(())
    }

    /// Delete a project and all of its builds. Returns how many builds went.
    pub async fn delete_project(&self, project_id: ProjectId) -> CiResult<usize> {
        let controls: Vec<RunControl> = self
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|run| run.project_id == project_id)
            .map(|run| run.control.clone())
            .collect();
        for control in &controls {
            let _guard = control.lock().await;
            control.cancel();
        }

        let removed = self.repo.delete_project(project_id).await?;
        self.counter.forget(project_id);
        self.aggregator.forget(project_id);
        tracing::info!(%project_id, builds = removed.len(), stopped = controls.len(), "Project deleted");
        Ok(removed.len())
    }

    /// Stop accepting builds and wait for live pipelines. Whatever is still
    /// running when the grace period ends is cancelled.
    pub async fn shutdown(&self) {
        let mut tasks = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            self.closed.store(true, Ordering::SeqCst);
            std::mem::take(&mut *tasks)
        };
        if tasks.is_empty() {
            return;
        }

        tracing::info!(pending = tasks.len(), grace_secs = self.shutdown_grace.as_secs(), "Waiting for running builds");
        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_ok() {
            return;
        }

        let live: Vec<BuildId> = self
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        tracing::warn!(builds = live.len(), "Grace period over, cancelling remaining builds");
        for build_id in live {
            match self.cancel_with(build_id, SHUTDOWN_LOG).await {
                Ok(_) | Err(CiError::InvalidState(_)) | Err(CiError::NotFound { .. }) => {}
                Err(e) => tracing::error!(%build_id, "Could not cancel build on shutdown: {e}"),
            }
        }
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    /// The live run's control, or a detached one when nothing is running.
    fn control_for(&self, build_id: BuildId) -> RunControl {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&build_id)
            .map(|run| run.control.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::build::CiBuildAggregate;
    use crate::models::build::{TriggerSource, QUEUED_LOG};
    use crate::services::executor::{START_LOG, SUCCESS_LOG};
    use crate::services::testing::{
        fixture_project, wait_status, wait_terminal, Gate, ScriptedRunner,
    };
    use crate::services::step_executor::StepRunner;
    use crate::store::MemoryRepository;

    struct Engine {
        repo: Arc<MemoryRepository>,
        bus: EventBus,
        dispatcher: Dispatcher,
    }

    fn engine(runner: impl StepRunner + 'static) -> Engine {
        let repo = Arc::new(MemoryRepository::new());
        let bus = EventBus::new();
        let aggregator = Arc::new(ProjectAggregator::new(repo.clone()));
        let pipeline = Arc::new(Pipeline::new(
            repo.clone(),
            bus.clone(),
            aggregator.clone(),
            Arc::new(runner),
            Duration::from_secs(5),
        ));
        let dispatcher = Dispatcher::new(
            repo.clone(),
            bus.clone(),
            aggregator,
            pipeline,
            Duration::from_secs(2),
        );
        Engine {
            repo,
            bus,
            dispatcher,
        }
    }

    /// Wait until no pipeline is live, so rollups are final.
    async fn settle(e: &Engine) {
        for _ in 0..400 {
            if e.dispatcher.active_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pipelines never settled");
    }

    async fn project(e: &Engine, name: &str) -> CiProject {
        e.repo.create_project(fixture_project(name)).await.unwrap()
    }

    #[tokio::test]
    async fn first_build_runs_to_success() {
        let e = engine(ScriptedRunner::passing(2));
        let p = project(&e, "first").await;

        let queued = e.dispatcher.trigger(TriggerRequest::manual(p.id)).await.unwrap();
        assert_eq!(queued.build_number, 1);
        assert_eq!(queued.status, BuildStatus::Pending);
        assert_eq!(queued.logs, QUEUED_LOG);
        assert_eq!(queued.provenance.triggered_by, TriggerSource::Manual);

        let done = wait_terminal(e.repo.as_ref(), queued.id).await;
        assert_eq!(done.status, BuildStatus::Success);
        assert!(done.logs.starts_with(&format!("{QUEUED_LOG}{START_LOG}")));
        assert!(done.logs.ends_with(SUCCESS_LOG));
        assert!(done.started_at.is_some());
        assert!(done.completed_at >= done.started_at);

        settle(&e).await;
        let p = e.repo.get_project(p.id).await.unwrap();
        assert_eq!(p.total_builds, 1);
        assert_eq!(p.successful_builds, 1);
        assert_eq!(p.last_build_status, Some(BuildStatus::Success));
    }

    #[tokio::test]
    async fn back_to_back_triggers_get_sequential_numbers() {
        let e = engine(ScriptedRunner::passing(1));
        let p = project(&e, "sequence").await;

        let a = e.dispatcher.trigger(TriggerRequest::manual(p.id)).await.unwrap();
        let b = e.dispatcher.trigger(TriggerRequest::manual(p.id)).await.unwrap();
        assert_eq!((a.build_number, b.build_number), (1, 2));

        wait_terminal(e.repo.as_ref(), a.id).await;
        wait_terminal(e.repo.as_ref(), b.id).await;
    }

    #[tokio::test]
    async fn concurrent_triggers_never_share_a_number() {
        let e = Arc::new(engine(ScriptedRunner::passing(1)));
        let project_id = project(&e, "parallel").await.id;

        let mut handles = Vec::new();
        for _ in 0..20 {
            let e = e.clone();
            handles.push(tokio::spawn(async move {
                e.dispatcher.trigger(TriggerRequest::manual(project_id)).await.unwrap()
            }));
        }
        let mut numbers = Vec::new();
        for h in handles {
            numbers.push(h.await.unwrap().build_number);
        }
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn unknown_project_is_not_found() {
        let e = engine(ScriptedRunner::passing(1));
        let err = e
            .dispatcher
            .trigger(TriggerRequest::manual(uuid::Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, CiError::NotFound { .. }));
    }

    #[tokio::test]
    async fn cancel_while_running_stops_pipeline() {
        let gate = Arc::new(Gate::default());
        let e = engine(ScriptedRunner::passing(3).gated_at(1, gate.clone()));
        let p = project(&e, "cancel").await;
        let build = e.dispatcher.trigger(TriggerRequest::manual(p.id)).await.unwrap();
        let mut events = e.bus.subscribe(Topic::Build(build.id));

        gate.reached.notified().await;
        let cancelled = e.dispatcher.cancel(build.id).await.unwrap();
        assert_eq!(cancelled.status, BuildStatus::Cancelled);
        assert!(cancelled.logs.ends_with(CANCEL_LOG));
        gate.release.notify_one();

        settle(&e).await;

        let stored = e.repo.get_build(build.id).await.unwrap();
        assert_eq!(stored.status, BuildStatus::Cancelled);
        assert!(stored.logs.ends_with(CANCEL_LOG));
        assert!(!stored.logs.contains("step-1"));

        let mut aggregate = CiBuildAggregate::default();
        while let Ok(event) = events.receiver.try_recv() {
            aggregate.apply(&event);
        }
        assert_eq!(aggregate.status, Some(BuildStatus::Cancelled));

        let again = e.dispatcher.cancel(build.id).await.unwrap_err();
        assert!(matches!(again, CiError::InvalidState(_)));

        let p = e.repo.get_project(p.id).await.unwrap();
        assert_eq!(p.successful_builds + p.failed_builds, 0);
        assert_eq!(p.last_build_status, Some(BuildStatus::Cancelled));
    }

    #[tokio::test]
    async fn cancel_finished_build_is_invalid_state() {
        let e = engine(ScriptedRunner::passing(1));
        let p = project(&e, "finished").await;
        let build = e.dispatcher.trigger(TriggerRequest::manual(p.id)).await.unwrap();
        wait_terminal(e.repo.as_ref(), build.id).await;

        settle(&e).await;
        let before = e.repo.get_build(build.id).await.unwrap();
        let project_before = e.repo.get_project(p.id).await.unwrap();
        let mut global = e.bus.subscribe(Topic::Global);
        let mut build_topic = e.bus.subscribe(Topic::Build(build.id));

        let err = e.dispatcher.cancel(build.id).await.unwrap_err();
        assert!(matches!(err, CiError::InvalidState(_)));

        let after = e.repo.get_build(build.id).await.unwrap();
        assert_eq!(after.status, before.status);
        assert_eq!(after.logs, before.logs);
        assert_eq!(after.completed_at, before.completed_at);
        assert_eq!(after.updated_at, before.updated_at);
        assert_eq!(e.repo.get_project(p.id).await.unwrap(), project_before);
        assert!(global.receiver.try_recv().is_err());
        assert!(build_topic.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn start_after_shutdown_spawns_nothing() {
        let e = engine(ScriptedRunner::passing(1));
        let p = project(&e, "late").await;
        let build = e
            .repo
            .create_build(crate::services::testing::pending_build(p.id, 1))
            .await
            .unwrap();

        e.dispatcher.shutdown().await;

        assert!(!e.dispatcher.start(p, &build).unwrap());
        assert_eq!(e.dispatcher.active_count(), 0);
        assert!(e.dispatcher.tasks.lock().unwrap().is_empty());

        let cancelled = e.dispatcher.cancel_with(build.id, SHUTDOWN_LOG).await.unwrap();
        assert_eq!(cancelled.status, BuildStatus::Cancelled);
        assert!(cancelled.logs.ends_with(SHUTDOWN_LOG));
    }

    #[tokio::test]
    async fn deleting_project_removes_live_builds() {
        let gate = Arc::new(Gate::default());
        let e = engine(ScriptedRunner::passing(2).gated_at(0, gate.clone()));
        let p = project(&e, "doomed").await;
        let build = e.dispatcher.trigger(TriggerRequest::manual(p.id)).await.unwrap();
        gate.reached.notified().await;

        assert_eq!(e.dispatcher.delete_project(p.id).await.unwrap(), 1);
        gate.release.notify_one();

        assert!(matches!(
            e.repo.get_build(build.id).await,
            Err(CiError::NotFound { .. })
        ));
        assert!(matches!(
            e.repo.get_project(p.id).await,
            Err(CiError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn numbers_are_not_reused_after_deleting_latest() {
        let e = engine(ScriptedRunner::passing(1));
        let p = project(&e, "reuse").await;
        let first = e.dispatcher.trigger(TriggerRequest::manual(p.id)).await.unwrap();
        wait_terminal(e.repo.as_ref(), first.id).await;
        e.dispatcher.delete_build(first.id).await.unwrap();

        let second = e.dispatcher.trigger(TriggerRequest::manual(p.id)).await.unwrap();
        assert_eq!(second.build_number, 2);
    }

    #[tokio::test]
    async fn accounting_identity_holds_after_mixed_outcomes() {
        let gate = Arc::new(Gate::default());
        let e = engine(ScriptedRunner::passing(2).gated_at(1, gate.clone()));
        let p = project(&e, "ledger").await;

        let held = e.dispatcher.trigger(TriggerRequest::manual(p.id)).await.unwrap();
        gate.reached.notified().await;
        e.dispatcher.cancel(held.id).await.unwrap();
        gate.release.notify_one();

        let ok = e.dispatcher.trigger(TriggerRequest::manual(p.id)).await.unwrap();
        gate.reached.notified().await;
        gate.release.notify_one();
        wait_terminal(e.repo.as_ref(), ok.id).await;
        settle(&e).await;

        let p = e.repo.get_project(p.id).await.unwrap();
        let cancelled = 1;
        assert_eq!(p.total_builds, 2);
        assert_eq!(p.successful_builds + p.failed_builds + cancelled, p.total_builds);
    }

    #[tokio::test]
    async fn shutdown_cancels_builds_past_grace() {
        let gate = Arc::new(Gate::default());
        let mut e = engine(ScriptedRunner::passing(2).gated_at(0, gate.clone()));
        e.dispatcher.shutdown_grace = Duration::from_millis(20);
        let p = project(&e, "shutdown").await;
        let build = e.dispatcher.trigger(TriggerRequest::manual(p.id)).await.unwrap();
        wait_status(e.repo.as_ref(), build.id, BuildStatus::Running).await;

        e.dispatcher.shutdown().await;

        let stored = e.repo.get_build(build.id).await.unwrap();
        assert_eq!(stored.status, BuildStatus::Cancelled);
        assert!(stored.logs.ends_with(SHUTDOWN_LOG));

        let refused = e.dispatcher.trigger(TriggerRequest::manual(p.id)).await.unwrap_err();
        assert!(matches!(refused, CiError::InvalidState(_)));
    }

    #[tokio::test]
    async fn global_topic_sees_creation_then_exit() {
        let e = engine(ScriptedRunner::passing(1));
        let p = project(&e, "global").await;
        let mut global = e.bus.subscribe(Topic::Global);

        let build = e.dispatcher.trigger(TriggerRequest::manual(p.id)).await.unwrap();
        wait_terminal(e.repo.as_ref(), build.id).await;

        let first = global.receiver.recv().await.unwrap();
        let second = global.receiver.recv().await.unwrap();
        assert_eq!(first.name(), "build-created");
        assert_eq!(second.name(), "build-completed");
        assert_eq!(second.build_id(), build.id);
    }
}
