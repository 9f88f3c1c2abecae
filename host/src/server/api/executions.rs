use axum::{
    debug_handler,
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use utoipa::{IntoParams, OpenApi};

use oscar_engine::TaskSnapshot;
use oscar_lib::{ExecutionRecord, ExecutionStatus};
use oscar_store::{ListFilter, Page};

use crate::{
    error::HostResult,
    server::api::acting_user,
    service::{ExecutionRequest, PreviewResponse},
    HostState,
};

#[derive(Debug, Deserialize, IntoParams)]
struct ListQuery {
    page: Option<u32>,
    size: Option<u32>,
    status: Option<ExecutionStatus>,
    connection_id: Option<String>,
    /// Substring match on id, database and table name
    keyword: Option<String>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
}

#[utoipa::path(
    post,
    path = "/",
    tag = "Executions",
    request_body = ExecutionRequest,
    responses (
        (status = 200, description = "Execution accepted and queued", body = ExecutionRecord),
        (status = 400, description = "The DDL intent failed validation"),
        (status = 403, description = "The safety gate blocked the execution"),
        (status = 429, description = "The execution queue is full"),
    )
)]
#[debug_handler(state = HostState)]
/// Submit a schema change
///
/// Validates the intent, classifies its risk, persists a pending record and
/// enqueues it for the worker pool.
async fn create_handler(
    State(state): State<HostState>,
    headers: HeaderMap,
    Json(request): Json<ExecutionRequest>,
) -> HostResult<Json<ExecutionRecord>> {
    let user = acting_user(&headers);
    let record = state.service.submit(&request, &user).await?;
    Ok(Json(record))
}

#[utoipa::path(
    post,
    path = "/preview",
    tag = "Executions",
    request_body = ExecutionRequest,
    responses (
        (status = 200, description = "The redacted command and its risk assessment", body = PreviewResponse),
        (status = 400, description = "The DDL intent failed validation"),
    )
)]
#[debug_handler(state = HostState)]
/// Preview the generated command without creating a record
async fn preview_handler(
    State(state): State<HostState>,
    headers: HeaderMap,
    Json(request): Json<ExecutionRequest>,
) -> HostResult<Json<PreviewResponse>> {
    let user = acting_user(&headers);
    let preview = state.service.preview(&request, &user).await?;
    Ok(Json(preview))
}

#[utoipa::path(
    get,
    path = "/",
    tag = "Executions",
    params(ListQuery),
    responses (
        (status = 200, description = "Matching execution records, newest first"),
    )
)]
#[debug_handler(state = HostState)]
/// List execution records
async fn list_handler(
    State(state): State<HostState>,
    Query(query): Query<ListQuery>,
) -> HostResult<Json<Value>> {
    let filter = ListFilter {
        status: query.status,
        connection_id: query.connection_id,
        start_date: query.start_date,
        end_date: query.end_date,
        keyword: query.keyword,
    };
    let page = Page {
        page: query.page.unwrap_or(1),
        size: query.size.unwrap_or(20),
    }
    .normalized();
    let (items, total) = state.service.list(&filter, page).await?;
    Ok(Json(json!({
        "items": items,
        "total": total,
        "page": page.page,
        "size": page.size,
    })))
}

#[utoipa::path(
    get,
    path = "/running",
    tag = "Executions",
    responses (
        (status = 200, description = "Live snapshots of every running task", body = [TaskSnapshot]),
    )
)]
#[debug_handler(state = HostState)]
/// Running tasks with their live stage, percent and rate
async fn running_handler(State(state): State<HostState>) -> Json<Vec<TaskSnapshot>> {
    Json(state.orchestrator.running_tasks())
}

#[utoipa::path(
    get,
    path = "/{id}",
    tag = "Executions",
    responses (
        (status = 200, description = "The execution record", body = ExecutionRecord),
        (status = 404, description = "No such execution"),
    )
)]
#[debug_handler(state = HostState)]
/// Fetch one execution record
async fn get_handler(
    State(state): State<HostState>,
    Path(id): Path<String>,
) -> HostResult<Json<ExecutionRecord>> {
    Ok(Json(state.service.get(&id).await?))
}

#[utoipa::path(
    get,
    path = "/{id}/logs",
    tag = "Executions",
    responses (
        (status = 200, description = "Captured tool output for the execution"),
        (status = 404, description = "No such execution"),
    )
)]
#[debug_handler(state = HostState)]
/// Captured logs of one execution
async fn logs_handler(
    State(state): State<HostState>,
    Path(id): Path<String>,
) -> HostResult<Json<Value>> {
    let logs = state.service.logs(&id).await?;
    Ok(Json(json!({
        "execution_id": id,
        "logs": logs.unwrap_or_default(),
    })))
}

#[utoipa::path(
    post,
    path = "/{id}/stop",
    tag = "Executions",
    responses (
        (status = 200, description = "The execution was cancelled", body = ExecutionRecord),
        (status = 404, description = "No such execution"),
        (status = 409, description = "The execution is not running"),
    )
)]
#[debug_handler(state = HostState)]
/// Cancel a running execution
async fn stop_handler(
    State(state): State<HostState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> HostResult<Json<ExecutionRecord>> {
    let user = acting_user(&headers);
    Ok(Json(state.service.stop(&id, &user).await?))
}

#[utoipa::path(
    post,
    path = "/{id}/retry",
    tag = "Executions",
    responses (
        (status = 200, description = "The execution was reset and requeued", body = ExecutionRecord),
        (status = 404, description = "No such execution"),
        (status = 409, description = "The execution is not failed or cancelled"),
    )
)]
#[debug_handler(state = HostState)]
/// Retry a failed or cancelled execution
async fn retry_handler(
    State(state): State<HostState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> HostResult<Json<ExecutionRecord>> {
    let user = acting_user(&headers);
    Ok(Json(state.service.retry(&id, &user).await?))
}

#[derive(OpenApi)]
#[openapi(paths(
    create_handler,
    preview_handler,
    list_handler,
    running_handler,
    get_handler,
    logs_handler,
    stop_handler,
    retry_handler
))]
struct Docs;

pub fn create_docs() -> utoipa::openapi::OpenApi {
    Docs::openapi()
}

pub fn create_router() -> Router<HostState> {
    Router::new()
        .route("/", post(create_handler).get(list_handler))
        .route("/preview", post(preview_handler))
        .route("/running", get(running_handler))
        .route("/:id", get(get_handler))
        .route("/:id/logs", get(logs_handler))
        .route("/:id/stop", post(stop_handler))
        .route("/:id/retry", post(retry_handler))
}
