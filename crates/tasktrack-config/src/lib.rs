//! # TaskTrack Config
//!
//! Configuration management for TaskTrack.
//! Supports layered configuration from files, environment variables,
//! and runtime refresh.

mod app_config;
mod export_config;
mod loader;
mod validation;

pub use app_config::*;
pub use export_config::*;
pub use loader::*;
pub use validation::*;
