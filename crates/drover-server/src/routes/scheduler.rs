//! Scheduler endpoints: trigger a cycle, read stats.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use drover_core::scheduler;

use crate::error::AppError;
use crate::state::AppState;

pub async fn run(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let result = scheduler::run_cycle(&state.pool, &state.coord, &state.config)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(result))
}

pub async fn stats(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let stats = scheduler::stats(&state.pool, &state.coord, &state.config)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(stats))
}
