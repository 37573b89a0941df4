//! # Axum WebSocket Adapter
//!
//! Bridges axum's WebSocket upgrade to the transport-agnostic
//! [`ConnectionManager`]:
//!
//! 1. The identity is resolved from the request *before* upgrading. A failed
//!    resolution answers `401 Unauthorized` and no connection is registered.
//! 2. A failed upgrade (bad handshake) answers with axum's rejection and is
//!    logged as an upgrade failure.
//! 3. The upgraded socket is split. Text and binary messages become inbound
//!    payloads, a close frame ends the inbound stream, and outbound payloads
//!    are sent as text when they are valid UTF-8, binary otherwise.

use std::future::ready;
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use uuid::Uuid;

use super::identity::{ConnectionContext, IdentityResolver};
use crate::core::connection_manager::ConnectionManager;
use crate::core::error::{PipelineError, Result};

/// Resolves the caller, upgrades the request and hands the socket to
/// `manager`.
pub fn upgrade(
    manager: Arc<ConnectionManager>,
    resolver: &dyn IdentityResolver,
    ctx: ConnectionContext,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let id = match resolver.resolve(&ctx) {
        Ok(id) => id,
        Err(e) => {
            log::warn!("Rejected subscriber: {}", e);
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            log::warn!("{}", PipelineError::UpgradeFailure(rejection.body_text()));
            return rejection.into_response();
        }
    };

    if manager.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Shutting down").into_response();
    }

    ws.on_failed_upgrade(move |e: axum::Error| {
        log::warn!("{}", PipelineError::UpgradeFailure(e.to_string()));
    })
    .on_upgrade(move |socket| async move {
        if let Err(e) = attach_socket(&manager, id, socket) {
            log::warn!("Subscriber '{}' dropped after upgrade: {}", id, e);
        }
    })
}

/// Registers an upgraded socket under `id`.
pub fn attach_socket(manager: &ConnectionManager, id: Uuid, socket: WebSocket) -> Result<()> {
    let (sink, stream) = socket.split();

    let reader = stream
        .take_while(|msg| ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().as_bytes().to_vec())),
                Ok(Message::Binary(bytes)) => Some(Ok(bytes.to_vec())),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
        });

    let writer = sink.with(|payload: Vec<u8>| ready(Ok::<_, axum::Error>(to_message(payload))));

    manager.attach(id, reader, writer)
}

fn to_message(payload: Vec<u8>) -> Message {
    match String::from_utf8(payload) {
        Ok(text) => Message::Text(text.into()),
        Err(e) => Message::Binary(e.into_bytes().into()),
    }
}
