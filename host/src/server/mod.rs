pub mod api;

use tokio::net::TcpListener;
use tracing::info;

use crate::HostState;

/// Bind and serve until a ctrl-c arrives. The caller shuts the orchestrator
/// down once this returns.
pub async fn serve(state: HostState, address: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(address).await?;
    info!("listening on http://{}", listener.local_addr()?);

    let router = api::create_router().with_state(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}
