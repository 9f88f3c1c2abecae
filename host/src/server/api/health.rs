use axum::{debug_handler, http::StatusCode, routing::get, Router};
use utoipa::OpenApi;

use crate::HostState;

#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses (
        (status = 200, description = "Host is healthy"),
    )
)]
#[debug_handler(state = HostState)]
/// Health check
///
/// Currently only responds with an OK status.
async fn handler() -> StatusCode {
    StatusCode::OK
}

#[derive(OpenApi)]
#[openapi(paths(handler))]
struct Docs;

pub fn create_docs() -> utoipa::openapi::OpenApi {
    Docs::openapi()
}

pub fn create_router() -> Router<HostState> {
    Router::new().route("/", get(handler))
}
