use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use servel_core::KeyError;
use servel_storage::StoreError;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Nothing stored yet for the request; `load` names the resource to sync.
    #[error("no data yet for {what}")]
    NoData { what: String, load: Option<String> },

    #[error("{0}")]
    BadRequest(String),

    #[error("upstream fetch failed for {resource}: {detail}")]
    Upstream { resource: String, detail: String },

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<KeyError> for ApiError {
    fn from(err: KeyError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NoData { .. } => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ApiError::Store(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }

        let mut body = json!({ "error": self.to_string() });
        if let ApiError::NoData { load, .. } = &self {
            let hint = match load {
                Some(resource) => format!("trigger a load with POST /api/sync/{resource}"),
                None => "trigger a load with POST /api/sync".to_string(),
            };
            body["hint"] = json!(hint);
        }
        (status, Json(body)).into_response()
    }
}
