use axum::{
    debug_handler,
    extract::State,
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use utoipa::OpenApi;

use crate::{
    error::HostResult,
    server::api::acting_user,
    service::{ConnectionResponse, CreateConnectionRequest},
    HostState,
};

#[utoipa::path(
    post,
    path = "/",
    tag = "Connections",
    request_body = CreateConnectionRequest,
    responses (
        (status = 200, description = "Connection registered", body = ConnectionResponse),
    )
)]
#[debug_handler(state = HostState)]
/// Register a managed connection
///
/// The password is encrypted by the vault before it is stored and is never
/// returned by any endpoint.
async fn create_handler(
    State(state): State<HostState>,
    headers: HeaderMap,
    Json(request): Json<CreateConnectionRequest>,
) -> HostResult<Json<ConnectionResponse>> {
    let user = acting_user(&headers);
    let connection = state.service.create_connection(&request, &user).await?;
    Ok(Json(connection))
}

#[utoipa::path(
    get,
    path = "/",
    tag = "Connections",
    responses (
        (status = 200, description = "All managed connections", body = [ConnectionResponse]),
    )
)]
#[debug_handler(state = HostState)]
/// List managed connections
async fn list_handler(State(state): State<HostState>) -> HostResult<Json<Vec<ConnectionResponse>>> {
    Ok(Json(state.service.list_connections().await?))
}

#[derive(OpenApi)]
#[openapi(paths(create_handler, list_handler))]
struct Docs;

pub fn create_docs() -> utoipa::openapi::OpenApi {
    Docs::openapi()
}

pub fn create_router() -> Router<HostState> {
    Router::new().route("/", post(create_handler).get(list_handler))
}
