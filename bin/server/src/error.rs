//! HTTP error responses.
//!
//! Command errors arrive as `Report<FlowError>`; only the domain error's
//! kind, message, entity and violations reach the client.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use flowdeck_workflow::{ErrorDetail, FlowError, FlowErrorKind, Violation};
use rootcause::prelude::Report;
use serde::Serialize;
use std::fmt;
use tracing::error;

/// Errors returned by API handlers.
#[derive(Debug)]
pub enum ApiError {
    /// A flow command failed.
    Flow(Report<FlowError>),
    /// The request itself is malformed.
    BadRequest { message: String },
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flow(report) => write!(f, "{}", report.current_context()),
            Self::BadRequest { message } => write!(f, "bad request: {message}"),
        }
    }
}

impl From<Report<FlowError>> for ApiError {
    fn from(report: Report<FlowError>) -> Self {
        Self::Flow(report)
    }
}

/// Wire form of an error response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(flatten)]
    detail: ErrorDetail,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    violations: Vec<Violation>,
}

/// Maps an error kind to the HTTP status reported for it.
#[must_use]
pub fn status_for(kind: FlowErrorKind) -> StatusCode {
    match kind {
        FlowErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
        FlowErrorKind::PublishConflict | FlowErrorKind::Cancelled => StatusCode::CONFLICT,
        FlowErrorKind::NotFound => StatusCode::NOT_FOUND,
        FlowErrorKind::ToolInvocation => StatusCode::BAD_GATEWAY,
        FlowErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        FlowErrorKind::NodeExecution | FlowErrorKind::Storage => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Flow(report) => {
                let error = report.current_context();
                let status = status_for(error.kind());
                if status.is_server_error() {
                    error!(error = %error, "Request failed");
                }
                let violations = match error {
                    FlowError::Validation { violations } => violations.clone(),
                    _ => Vec::new(),
                };
                let body = ErrorBody {
                    detail: error.detail(),
                    violations,
                };
                (status, Json(body)).into_response()
            }
            Self::BadRequest { message } => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "message": message })),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_statuses() {
        assert_eq!(
            status_for(FlowErrorKind::Validation),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(FlowErrorKind::PublishConflict),
            StatusCode::CONFLICT
        );
        assert_eq!(status_for(FlowErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(FlowErrorKind::Storage),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn not_found_report_becomes_404() {
        let report: Report<FlowError> = FlowError::NotFound {
            entity: "run",
            id: "run_1".to_string(),
        }
        .into();
        let response = ApiError::from(report).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
