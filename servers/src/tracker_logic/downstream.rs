use crate::tracker_logic::config::Config;
use crate::tracker_logic::pipeline::Pipeline;
use anyhow::Result;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use lib_common::connections::{self, ConnectionContext};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;

pub async fn run(config: Config, pipeline: Arc<Pipeline>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let app = router(pipeline);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port.unwrap_or(9010)));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Downstream server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Downstream server shutting down.");
        })
        .await?;
    Ok(())
}

pub fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/exchangers", get(exchangers_handler))
        .route("/stats", get(stats_handler))
        .with_state(pipeline)
}

async fn ws_handler(
    State(pipeline): State<Arc<Pipeline>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ctx = ConnectionContext::new(headers, query);
    connections::upgrade(pipeline.connections.clone(), &pipeline.resolver, ctx, ws)
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn exchangers_handler(State(pipeline): State<Arc<Pipeline>>) -> impl IntoResponse {
    Json(json!({
        "active": pipeline.exchangers.active_count(),
        "exchangers": pipeline.exchangers.connected(),
    }))
}

async fn stats_handler(State(pipeline): State<Arc<Pipeline>>) -> impl IntoResponse {
    let delivery = pipeline.connections.delivery_stats();
    Json(json!({
        "subscribers": pipeline.connections.connection_count(),
        "idle_workers": pipeline.workers.idle(),
        "workers": pipeline.workers.stats(),
        "delivery": {
            "delivered": delivery.delivered,
            "dropped_full": delivery.dropped_full,
            "dropped_unknown": delivery.dropped_unknown,
            "dropped_closed": delivery.dropped_closed,
        },
    }))
}
