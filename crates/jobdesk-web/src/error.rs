//! Mapping from library errors to JSON error responses.

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use jobdesk_core::{FieldError, ValidationErrors};
use jobdesk_pipeline::{IngestError, ReviewError};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

pub const INTERNAL_DETAIL: &str = "internal error";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("missing or unknown bearer token")]
    Unauthorized,
    #[error("{0}")]
    Forbidden(String),
    /// `expose` controls whether `detail` reaches the client.
    #[error("{detail}")]
    Internal { detail: String, expose: bool },
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    detail: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<&'a [FieldError]>,
}

impl ApiError {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        ApiError::Internal {
            detail: err.to_string(),
            expose: false,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::Malformed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn exposing(self, expose_errors: bool) -> Self {
        match self {
            ApiError::Internal { detail, .. } => ApiError::Internal {
                detail,
                expose: expose_errors,
            },
            other => other,
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Validation(errors) => ApiError::Validation(errors),
            IngestError::Duplicate { .. } => {
                ApiError::Conflict("Job already exists (duplicate detected by fingerprint)".into())
            }
            IngestError::Storage(err) => ApiError::internal(err),
        }
    }
}

impl From<ReviewError> for ApiError {
    fn from(err: ReviewError) -> Self {
        match err {
            ReviewError::Forbidden { action, .. } => {
                ApiError::Forbidden(format!("role may not {action}"))
            }
            ReviewError::Validation(errors) => ApiError::Validation(errors),
            ReviewError::NotFound { stage, id } => {
                ApiError::NotFound(format!("Job {id} not found in {stage}"))
            }
            ReviewError::Duplicate { fingerprint } => ApiError::Conflict(format!(
                "An approved job with fingerprint {} already exists",
                fingerprint.short()
            )),
            ReviewError::Storage(err) => ApiError::internal(err),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Malformed(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::Malformed(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        let body = match &self {
            ApiError::Validation(errors) => ErrorBody {
                detail: "Validation failed",
                errors: Some(&errors.fields),
            },
            ApiError::Internal { detail, expose } => {
                error!(error = %detail, "request failed");
                ErrorBody {
                    detail: if *expose { detail } else { INTERNAL_DETAIL },
                    errors: None,
                }
            }
            _ => ErrorBody {
                detail: &message,
                errors: None,
            },
        };
        (status, Json(body)).into_response()
    }
}
