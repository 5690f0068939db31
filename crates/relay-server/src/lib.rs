//! # relay-server
//!
//! Real-time fan-out relay over WebSockets.
//!
//! - Upstream bus adapters (Redis pattern subscribe, in-process memory bus)
//! - Connection registry with an identity index
//! - Broadcast and per-identity routing of bus events
//! - Global ping/pong liveness sweep
//! - Axum HTTP server: `/ws`, `/health`, `/metrics`, graceful shutdown

#![deny(unsafe_code)]

pub mod auth;
pub mod bus;
pub mod errors;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;
