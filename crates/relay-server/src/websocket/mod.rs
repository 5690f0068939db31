//! WebSocket gateway: connection state, registry, routing, liveness and
//! per-socket lifecycle.

pub mod connection;
pub mod frame;
pub mod lifecycle;
pub mod liveness;
pub mod registry;
pub mod router;
