//! Data models: projects and the builds they own.

pub mod build;
pub mod project;
