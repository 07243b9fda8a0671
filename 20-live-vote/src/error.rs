use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum VoteError {
    #[error("Session or option not found")]
    NotFound,

    #[error("Vote failed due to high contention after {attempts} attempts")]
    Contention { attempts: u32 },

    #[error("Counter at {key} holds non-numeric value {value:?}")]
    DataIntegrity { key: String, value: String },

    #[error("Stored metadata at {key} is unreadable: {reason}")]
    CorruptMetadata { key: String, reason: String },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
}

impl VoteError {
    pub fn status(&self) -> StatusCode {
        match self {
            VoteError::NotFound => StatusCode::NOT_FOUND,
            VoteError::Contention { .. } => StatusCode::CONFLICT,
            VoteError::DataIntegrity { .. } | VoteError::CorruptMetadata { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            VoteError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            VoteError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for VoteError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}
