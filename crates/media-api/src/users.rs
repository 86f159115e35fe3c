use axum::{Extension, Json, extract::State, response::IntoResponse};
use tracing::info;

use media_types::api::Claims;
use media_types::events::DomainEvent;
use media_types::models::User;

use crate::error::ApiError;
use crate::state::AppState;
use crate::accepted;

/// A profile without an email is the caller's own.
fn with_caller_email(mut user: User, claims: &Claims) -> User {
    if user.email.trim().is_empty() {
        user.email = claims.sub.clone();
    }
    user
}

pub async fn create_user(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(user): Json<User>,
) -> Result<impl IntoResponse, ApiError> {
    let user = with_caller_email(user, &claims);
    let email = user.email.clone();
    state.publisher.publish(DomainEvent::UserCreated(user)).await?;

    info!("User create accepted for {}", email);
    Ok(accepted(format!("User creation request accepted for {email}")))
}

pub async fn update_user(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(user): Json<User>,
) -> Result<impl IntoResponse, ApiError> {
    let user = with_caller_email(user, &claims);
    let email = user.email.clone();
    state.publisher.publish(DomainEvent::UserUpdated(user)).await?;

    Ok(accepted(format!("User update request accepted for {email}")))
}

/// The caller's cached profile.
pub async fn get_user(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state
        .queries
        .get_user(&claims.sub)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found in cache"))?;
    Ok(Json(user))
}
