//! Application state for Axum handlers.

use std::sync::Arc;
use tasktrack_export::ExportServiceInterface;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub exports: Arc<dyn ExportServiceInterface>,
}

impl AppState {
    /// Creates a new application state.
    pub fn new(exports: Arc<dyn ExportServiceInterface>) -> Self {
        Self { exports }
    }
}
