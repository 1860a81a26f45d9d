//! Process-wide application context handed to every route handler.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;

use crate::config::CiConfig;
use crate::events::EventBus;
use crate::services::aggregator::ProjectAggregator;
use crate::services::dispatcher::Dispatcher;
use crate::services::executor::Pipeline;
use crate::services::step_executor::{SimulatedStepRunner, StepRunner};
use crate::store::{MemoryRepository, Repository};

pub struct AppContext {
    pub config: CiConfig,
    pub repo: Arc<dyn Repository>,
    pub bus: EventBus,
    pub aggregator: Arc<ProjectAggregator>,
    pub dispatcher: Dispatcher,
    pub started_at: Instant,
    closing: watch::Sender<bool>,
}

impl AppContext {
    pub fn new(config: CiConfig, repo: Arc<dyn Repository>, runner: Arc<dyn StepRunner>) -> Self {
        let bus = EventBus::new();
        let aggregator = Arc::new(ProjectAggregator::new(repo.clone()));
        let pipeline = Arc::new(Pipeline::new(
            repo.clone(),
            bus.clone(),
            aggregator.clone(),
            runner,
            config.step_timeout(),
        ));
        let dispatcher = Dispatcher::new(
            repo.clone(),
            bus.clone(),
            aggregator.clone(),
            pipeline,
            config.shutdown_grace(),
        );

        Self {
            config,
            repo,
            bus,
            aggregator,
            dispatcher,
            started_at: Instant::now(),
            closing: watch::Sender::new(false),
        }
    }

    /// In-memory storage with the simulated step runner.
    pub fn in_memory(config: CiConfig) -> Self {
        let runner = Arc::new(SimulatedStepRunner::new(
            config.success_rate,
            config.step_delay_scale,
        ));
        Self::new(config, Arc::new(MemoryRepository::new()), runner)
    }

    /// Flips to `true` once the server starts shutting down.
    pub fn closing(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    /// Tell long-lived connections such as observers to wind down.
    pub fn close_observers(&self) {
        self.closing.send_replace(true);
    }

    pub async fn shutdown(&self) {
        self.close_observers();
        self.dispatcher.shutdown().await;
    }
}
