//! HTTP controllers.

pub mod export_controller;
pub mod gateway_controller;
pub mod health_controller;
pub mod mutation_controller;
