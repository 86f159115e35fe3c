use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use media_cache::CacheError;
use media_relay::PublishError;

/// Handler error. Renders as a status code with a plain-text body.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Publish(_) | Self::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::Publish(e) => {
                error!(error = %e, "Publish failed");
                format!("Failed to publish event: {e}")
            }
            Self::Cache(e) => {
                error!(error = %e, "Cache read failed");
                format!("Failed to read from cache: {e}")
            }
            other => other.to_string(),
        };
        (status, body).into_response()
    }
}
