use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use trellis_common::TrellisError;

pub struct ApiError(pub TrellisError);

impl From<TrellisError> for ApiError {
    fn from(err: TrellisError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            TrellisError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            TrellisError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            TrellisError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            TrellisError::Auth(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        };

        let body = serde_json::json!({ "error": message });
        (status, Json(body)).into_response()
    }
}
