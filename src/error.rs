use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the HTTP layer. The store itself never fails.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("`time` is not an epoch-milliseconds integer: {0:?}")]
    InvalidTime(String),
    #[error("unreadable request body: {0}")]
    Body(String),
    #[error("error message")]
    Simulated,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::MissingField(_) | Self::InvalidTime(_) | Self::Body(_) => StatusCode::BAD_REQUEST,
            Self::Simulated => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = self.to_string();
        (status, Json(ErrorBody { message: &message })).into_response()
    }
}
