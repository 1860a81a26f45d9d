//! CI platform services: build lifecycle engine and CRUD business logic.

pub mod aggregator;
pub mod build_counter;
pub mod build_service;
pub mod dispatcher;
pub mod executor;
pub mod github_service;
pub mod locks;
pub mod project_service;
pub mod step_executor;

#[cfg(test)]
pub mod testing;
