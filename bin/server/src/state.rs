//! Shared application state and the caller extractor.

use axum::{
    Json,
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use flowdeck_workflow::{FlowService, RequestContext};
use std::str::FromStr;
use std::sync::Arc;

/// Header carrying the caller's tenant.
pub const TENANT_HEADER: &str = "x-tenant-id";
/// Header carrying the calling user.
pub const USER_HEADER: &str = "x-user-id";
/// Header carrying the optional conversation thread.
pub const THREAD_HEADER: &str = "x-thread-id";

/// Application state shared by all handlers.
pub struct AppState {
    /// The flow command service.
    pub service: Arc<FlowService>,
}

impl AppState {
    /// Creates a new application state.
    pub fn new(service: Arc<FlowService>) -> Self {
        Self { service }
    }
}

/// Extractor for the request context of the caller.
///
/// Identity is taken from headers set by the fronting gateway.
pub struct Caller(pub RequestContext);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = CallerRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant_id = required_header(parts, TENANT_HEADER)?;
        let operator_id = required_header(parts, USER_HEADER)?;
        let mut ctx = RequestContext::new(tenant_id, operator_id);
        if let Some(thread_id) = optional_header(parts, THREAD_HEADER)? {
            ctx = ctx.with_thread(thread_id);
        }
        Ok(Caller(ctx))
    }
}

fn optional_header<T: FromStr>(
    parts: &Parts,
    name: &'static str,
) -> Result<Option<T>, CallerRejection> {
    let Some(value) = parts.headers.get(name) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| CallerRejection::InvalidHeader(name))?;
    T::from_str(value)
        .map(Some)
        .map_err(|_| CallerRejection::InvalidHeader(name))
}

fn required_header<T: FromStr>(parts: &Parts, name: &'static str) -> Result<T, CallerRejection> {
    optional_header(parts, name)?.ok_or(CallerRejection::MissingHeader(name))
}

/// Rejection type for the caller extractor.
#[derive(Debug, PartialEq, Eq)]
pub enum CallerRejection {
    MissingHeader(&'static str),
    InvalidHeader(&'static str),
}

impl IntoResponse for CallerRejection {
    fn into_response(self) -> Response {
        let message = match self {
            Self::MissingHeader(name) => format!("missing header {name}"),
            Self::InvalidHeader(name) => format!("invalid header {name}"),
        };
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "message": message })),
        )
            .into_response()
    }
}
