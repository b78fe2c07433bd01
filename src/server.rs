//! Transport dispatch: wires the `RouterServer` handler up to whichever
//! transport the process was configured for.
//!
//! Stdio serves exactly one upstream agent over the process's own stdin and
//! stdout. SSE and streamable HTTP both bind a TCP listener and can serve any
//! number of concurrent upstream sessions; streamable HTTP is mounted at
//! `/mcp` and SSE at `/sse` + `/message`, matching how the teacher's HTTP
//! transport mounts its service under axum.

use crate::router::{Router as RouterState, RouterServer};
use anyhow::Result;
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpService,
};
use rmcp::transport::SseServer;
use rmcp::ServiceExt;
use std::sync::Arc;
use tracing::info;

/// Serve the router façade over stdio until the peer disconnects.
pub async fn serve_stdio(router: Arc<RouterState>) -> Result<()> {
    let handler = RouterServer::new(router);
    let service = handler.serve(rmcp::transport::io::stdio()).await?;
    service.waiting().await?;
    Ok(())
}

/// Serve the router façade over the legacy SSE transport, bound to `addr`.
/// Kept for backward compatibility alongside streamable HTTP per the
/// router's external interface.
pub async fn serve_sse(router: Arc<RouterState>, addr: &str) -> Result<()> {
    let bind: std::net::SocketAddr = addr.parse()?;
    info!(%addr, "serving MCP over SSE");
    let ct = SseServer::serve(bind).await?.with_service(move || {
        let router = router.clone();
        RouterServer::new(router)
    });
    ct.cancelled().await;
    Ok(())
}

/// Serve the router façade over streamable HTTP, mounted at `/mcp`.
pub async fn serve_streamable_http(router: Arc<RouterState>, addr: &str) -> Result<()> {
    let service = StreamableHttpService::new(
        move || {
            let router = router.clone();
            Ok(RouterServer::new(router))
        },
        LocalSessionManager::default().into(),
        Default::default(),
    );

    let app = axum::Router::new().nest_service("/mcp", service);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "serving MCP over streamable HTTP at /mcp");
    axum::serve(listener, app).await?;
    Ok(())
}
