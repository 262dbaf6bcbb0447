//! HTTP routes for projects, flow definitions, snapshots and runs.

use crate::error::ApiError;
use crate::state::{AppState, Caller};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use flowdeck_workflow::{CreateFlowDefinition, CreateProject, ExecuteFlow, FlowContent};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Builds the API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/projects", post(create_project))
        .route("/projects/{id}", delete(delete_project))
        .route("/projects/{id}/flows/{name}/versions", get(list_versions))
        .route("/projects/{id}/flows/{name}/archive", post(archive_flow))
        .route("/definitions", post(create_definition))
        .route("/definitions/{id}", get(get_definition))
        .route("/definitions/{id}/structure", put(update_structure))
        .route("/definitions/{id}/publish", post(publish))
        .route("/snapshots/{id}", get(get_snapshot))
        .route("/runs", post(execute_flow))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/logs", get(run_logs))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Parses an id taken from the request path.
fn parse_id<T>(raw: &str) -> Result<T, ApiError>
where
    T: FromStr,
    T::Err: Display,
{
    T::from_str(raw).map_err(|e| ApiError::BadRequest {
        message: e.to_string(),
    })
}

/// Body of a publish request.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    #[serde(default)]
    pub publish_note: Option<String>,
}

/// Response of an archive request.
#[derive(Debug, Serialize)]
pub struct ArchiveResponse {
    pub archived: usize,
}

async fn create_project(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Json(command): Json<CreateProject>,
) -> Result<Response, ApiError> {
    let project = state.service.create_project(&ctx, command).await?;
    Ok((StatusCode::CREATED, Json(project)).into_response())
}

async fn delete_project(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let project = state.service.delete_project(&ctx, parse_id(&id)?).await?;
    Ok(Json(project).into_response())
}

async fn list_versions(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path((id, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let versions = state
        .service
        .list_versions(&ctx, parse_id(&id)?, &name)
        .await?;
    Ok(Json(versions).into_response())
}

async fn archive_flow(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path((id, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let archived = state
        .service
        .archive_flow(&ctx, parse_id(&id)?, &name)
        .await?;
    Ok(Json(ArchiveResponse { archived }).into_response())
}

async fn create_definition(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Json(command): Json<CreateFlowDefinition>,
) -> Result<Response, ApiError> {
    let definition = state.service.create_definition(&ctx, command).await?;
    Ok((StatusCode::CREATED, Json(definition)).into_response())
}

async fn get_definition(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let definition = state.service.get_definition(&ctx, parse_id(&id)?).await?;
    Ok(Json(definition).into_response())
}

async fn update_structure(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
    Json(content): Json<FlowContent>,
) -> Result<Response, ApiError> {
    let definition = state
        .service
        .update_structure(&ctx, parse_id(&id)?, content)
        .await?;
    Ok(Json(definition).into_response())
}

async fn publish(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
    body: Option<Json<PublishRequest>>,
) -> Result<Response, ApiError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let plan = state
        .service
        .publish(&ctx, parse_id(&id)?, request.publish_note)
        .await?;
    Ok((StatusCode::CREATED, Json(plan)).into_response())
}

async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let snapshot = state.service.get_snapshot(&ctx, parse_id(&id)?).await?;
    Ok(Json(snapshot).into_response())
}

async fn execute_flow(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Json(command): Json<ExecuteFlow>,
) -> Result<Response, ApiError> {
    let status = if command.async_mode {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    let run = state.service.execute_flow(&ctx, command).await?;
    Ok((status, Json(run)).into_response())
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let run = state.service.get_run(&ctx, parse_id(&id)?).await?;
    Ok(Json(run).into_response())
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let run = state.service.cancel_run(&ctx, parse_id(&id)?).await?;
    Ok((StatusCode::ACCEPTED, Json(run)).into_response())
}

async fn run_logs(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let entries = state.service.run_logs(&ctx, parse_id(&id)?).await?;
    Ok(Json(entries).into_response())
}
