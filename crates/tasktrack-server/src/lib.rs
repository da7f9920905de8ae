//! # TaskTrack Server Library
//!
//! HTTP and WebSocket surface of the export subsystem: REST endpoints for
//! submitting and controlling exports, the gateway socket, the task
//! mutation hook, and process wiring.

pub mod controllers;
pub mod middleware;
pub mod responses;
pub mod router;
pub mod startup;
pub mod state;
pub mod telemetry;

pub use router::create_router;
pub use state::AppState;
