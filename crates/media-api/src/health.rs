use axum::{extract::State, response::IntoResponse};

use crate::error::ApiError;
use crate::state::AppState;

/// Liveness plus a round trip to the cache.
pub async fn health(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    state.queries.ping().await?;
    Ok("ok")
}
