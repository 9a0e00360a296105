// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface: the agent backend, webhooks, badges and storage.
//!
//! Every route is also mounted under `/bk` for deployments behind a proxy
//! that forwards only that prefix.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::{Extensions, Method, Uri};
use axum::routing::post;
use axum::{Json, Router};
use kraken_protocol::messages::{AgentRequest, AgentResponse};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::backend::serve_agent_request;
use crate::context::ServerContext;
use crate::error::{Error, Result};
use crate::{badges, storage, webhooks};

fn api() -> Router<ServerContext> {
    Router::new()
        .route("/backend", post(backend))
        .merge(webhooks::routes())
        .merge(badges::routes())
        .merge(storage::routes())
}

/// Build the application router.
pub fn router(ctx: ServerContext) -> Router {
    Router::new()
        .merge(api())
        .nest("/bk", api())
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn backend(
    State(ctx): State<ServerContext>,
    extensions: Extensions,
    Json(request): Json<AgentRequest>,
) -> Result<Json<AgentResponse>> {
    let peer = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let response = serve_agent_request(&ctx, request, peer).await?;
    Ok(Json(response))
}

async fn not_found(method: Method, uri: Uri) -> Error {
    debug!(%method, %uri, "No route");
    Error::NotFound(format!("{} {}", method, uri.path()))
}

/// Serve `app` on `addr` until `shutdown` resolves.
pub async fn serve(
    app: Router,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    info!("HTTP server stopped");
    Ok(())
}
