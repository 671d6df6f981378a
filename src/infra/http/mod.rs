//! Dev server: every request is rendered on demand by the dev pool.

mod middleware;
mod pages;

pub use middleware::RequestContext;
pub use pages::{DevState, build_router};

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::infra::error::InfraError;

/// Bind `addr` and serve `router` until the process exits.
pub async fn serve(addr: SocketAddr, router: Router) -> Result<(), InfraError> {
    let listener = TcpListener::bind(addr).await?;
    info!(
        target = "frostline::http",
        address = %addr,
        "Dev server listening"
    );
    axum::serve(listener, router.into_make_service()).await?;
    Ok(())
}
