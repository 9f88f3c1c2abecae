use axum::Router;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};
use utoipa_swagger_ui::SwaggerUi;

use crate::HostState;

mod connections;
mod executions;
mod health;
mod metrics;
mod ws;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "oscar API",
        version = "1.0",
        description = "Safe, observable online schema changes for managed MySQL fleets",
    ),
    components(
        schemas(
            crate::error::HostError,
            crate::service::ExecutionRequest,
            crate::service::PreviewResponse,
            crate::service::CreateConnectionRequest,
            crate::service::ConnectionResponse,
            oscar_lib::ExecutionRecord,
            oscar_lib::ExecutionParams,
            oscar_lib::ExecutionStatus,
            oscar_lib::DdlType,
            oscar_lib::Environment,
            oscar_lib::RiskAssessment,
            oscar_lib::RiskLevel,
            oscar_engine::TaskSnapshot,
            oscar_engine::ServerEvent,
            oscar_engine::ClientMessage,
            oscar_engine::ProgressEvent,
        )
    ),
    tags(
        (name = "Executions", description = "Routes that submit and supervise schema changes"),
        (name = "Connections", description = "Routes that manage database connections"),
        (name = "Subscriptions", description = "Routes that stream execution events"),
        (name = "Health", description = "Routes that report the server health status"),
        (name = "Metrics", description = "Routes that give detailed insight into the server")
    )
)]
/// The root API struct which is generated from the `OpenApi` derive macro.
pub struct Docs;

#[must_use]
pub fn create_docs() -> utoipa::openapi::OpenApi {
    [
        executions::create_docs(),
        connections::create_docs(),
        health::create_docs(),
        metrics::create_docs(),
    ]
    .into_iter()
    .fold(Docs::openapi(), |mut doc, sub_doc| {
        doc.merge(sub_doc);
        doc
    })
}

pub fn create_router() -> Router<HostState> {
    let docs = create_docs();

    Router::new()
        .nest("/v1/executions", executions::create_router())
        .nest("/v1/connections", connections::create_router())
        .nest("/v1/ws", ws::create_router())
        .nest("/v1/health", health::create_router())
        .nest("/v1/metrics", metrics::create_router())
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", docs.clone()))
        .merge(Scalar::with_url("/scalar", docs))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
}

/// The acting operator, taken from the `x-user` header until an auth layer
/// fronts this service.
pub(crate) fn acting_user(headers: &axum::http::HeaderMap) -> String {
    headers
        .get("x-user")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}
