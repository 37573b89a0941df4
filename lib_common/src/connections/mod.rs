//! # Connections Module
//!
//! The subscriber-facing edge of the pipeline.
//!
//! - **`identity`**: resolves the identity a connection is registered under.
//! - **`axum_ws`**: upgrades axum requests and attaches the sockets to the
//!   connection manager.

/// Axum WebSocket adapter for the connection manager.
pub mod axum_ws;
/// Subscriber identity resolution.
pub mod identity;

pub use axum_ws::{attach_socket, upgrade};
pub use identity::{ConnectionContext, IdentityResolver, SubscriberIdResolver};
