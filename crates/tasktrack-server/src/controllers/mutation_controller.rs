//! Task mutation hook.
//!
//! The task CRUD layer posts a [`TaskMutation`] after every write so cached
//! exports covering the changed task are dropped.

use crate::responses::{ok, ApiResult};
use crate::state::AppState;
use axum::{extract::State, routing::post, Json, Router};
use tasktrack_core::TaskMutation;
use tasktrack_export::InvalidationReport;

/// Creates the internal router.
pub fn router() -> Router<AppState> {
    Router::new().route("/task-mutations", post(task_mutated))
}

async fn task_mutated(
    State(state): State<AppState>,
    Json(mutation): Json<TaskMutation>,
) -> ApiResult<InvalidationReport> {
    ok(state.exports.on_task_mutation(mutation).await)
}
