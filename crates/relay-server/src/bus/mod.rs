//! Upstream publish/subscribe bus.
//!
//! The relay only ever needs three things from its bus: pattern
//! subscriptions with callback delivery, publishing (used by tests and
//! tooling), and a clean shutdown. [`EventBus`] captures that surface;
//! [`RedisBus`] talks to a real Redis server and [`MemoryBus`] keeps
//! everything in-process.

pub mod backoff;
pub mod memory;
pub mod pattern;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use relay_settings::{BusKind, BusSettings};

use crate::errors::BusError;

pub use self::memory::MemoryBus;
pub use self::redis::RedisBus;

/// One message delivered to a subscription callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusMessage {
    /// The subscription pattern that matched.
    pub pattern: String,
    /// The concrete channel the message was published on.
    pub channel: String,
    /// Opaque payload, forwarded verbatim.
    pub payload: String,
}

/// Callback invoked once per matching message.
pub type MessageHandler = Arc<dyn Fn(BusMessage) + Send + Sync>;

/// A pattern-subscribing pub/sub transport.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Register `handler` for every channel matching `pattern`.
    ///
    /// Never fails: if the transport is unreachable the adapter logs a
    /// warning and the subscription takes effect once connectivity returns.
    async fn subscribe(&self, pattern: &str, handler: MessageHandler);

    /// Publish `payload` on `channel`, returning how many subscribers
    /// received it.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, BusError>;

    /// Release both the subscribing and the publishing side.
    ///
    /// Both sides are always attempted, even if one of them hangs or fails.
    async fn disconnect(&self);

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Build the bus selected by `settings.kind`.
pub fn bus_from_settings(settings: &BusSettings) -> Arc<dyn EventBus> {
    match settings.kind {
        BusKind::Redis => Arc::new(RedisBus::new(settings)),
        BusKind::Memory => Arc::new(MemoryBus::new()),
    }
}
