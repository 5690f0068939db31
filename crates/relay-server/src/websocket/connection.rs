//! Live WebSocket connection state.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::DeliveryError;

/// Identity assigned when the client supplies none.
pub const ANONYMOUS: &str = "anonymous";

/// Unique, immutable connection identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A frame queued for the connection's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// A text payload, shared across every recipient of a fan-out.
    Text(Arc<str>),
    /// A liveness probe (WebSocket ping).
    Ping,
}

/// Close status and reason sent to the peer when the connection is terminated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseReason {
    /// WebSocket close code.
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
}

/// Normal closure during server shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Identity verification failed.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Unexpected server-side condition.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Server at capacity or client too slow; retry later.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// One registered WebSocket session.
///
/// The registry and router hold `Arc<Connection>` handles but never touch the
/// socket: every write goes through the bounded outbound queue drained by the
/// lifecycle controller's writer task.
pub struct Connection {
    id: ConnectionId,
    identity: String,
    tx: mpsc::Sender<Outbound>,
    connected_at: Instant,
    is_alive: AtomicBool,
    terminated: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
    dropped_messages: AtomicU64,
}

impl Connection {
    /// Create a connection that starts out alive.
    pub fn new(id: ConnectionId, identity: impl Into<String>, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            identity: identity.into(),
            tx,
            connected_at: Instant::now(),
            is_alive: AtomicBool::new(true),
            terminated: CancellationToken::new(),
            close_reason: Mutex::new(None),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Registry key.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Routing identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether the connection can still accept outbound frames.
    ///
    /// False once close was requested or the writer task has gone away, even
    /// if the registry has not caught up yet.
    pub fn is_open(&self) -> bool {
        !self.terminated.is_cancelled() && !self.tx.is_closed()
    }

    /// Queue a text payload.
    pub fn send_text(&self, payload: Arc<str>) -> Result<(), DeliveryError> {
        self.enqueue(Outbound::Text(payload))
    }

    /// Queue a liveness probe.
    pub fn ping(&self) -> Result<(), DeliveryError> {
        self.enqueue(Outbound::Ping)
    }

    fn enqueue(&self, frame: Outbound) -> Result<(), DeliveryError> {
        if self.terminated.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(DeliveryError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    /// Request termination with the given close status.
    ///
    /// Bypasses the outbound queue so it works even when the queue is full.
    /// Only the first reason is kept.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(CloseReason {
                    code,
                    reason: reason.into(),
                });
            }
        }
        self.terminated.cancel();
    }

    /// The close status recorded by [`close`](Self::close), if any.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn terminated(&self) {
        self.terminated.cancelled().await;
    }

    /// Mark the connection as alive (pong received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    /// Read and clear the alive flag.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Current alive flag without resetting it.
    pub fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Relaxed)
    }

    /// Total messages dropped because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("open", &self.is_open())
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}
