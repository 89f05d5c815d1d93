//! Control-plane error responses.
//!
//! Application errors use the legacy status code 601 with a
//! `{result: 601, message}` body; existing operator tooling matches on it.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    pub message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(601).expect("601 is a valid status code");
        let body = Json(json!({
            "result": 601,
            "message": self.message,
        }));
        (status, body).into_response()
    }
}

impl From<bidcast_core::Error> for ApiError {
    fn from(err: bidcast_core::Error) -> Self {
        Self::new(err.control_message())
    }
}
