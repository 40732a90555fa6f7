use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Rejected before any query runs
    #[error("{0}")]
    BadRequest(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("storage task failed: {0}")]
    Join(#[from] JoinError),

    #[error("storage lock poisoned")]
    Poisoned,

    #[error("governance indexer request failed: {0}")]
    Upstream(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            // retriable: the caller may try again later
            AppError::Storage(_) | AppError::Join(_) | AppError::Poisoned => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::BadRequest(msg) => msg.clone(),
            AppError::Upstream(_) => {
                error!("Upstream error: {}", self);
                "An error occurred while fetching vote data".to_string()
            }
            _ => {
                error!("Database query error: {}", self);
                "An error occurred while querying the database".to_string()
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
