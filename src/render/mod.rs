pub mod sse;

use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde::Serialize;

/// JSON body of every non-2xx response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub details: String,
}

pub fn error_response(status: StatusCode, details: impl Into<String>) -> Response {
    let body = ErrorResponse {
        details: details.into(),
    };
    (status, Json(body)).into_response()
}
