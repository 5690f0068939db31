//! In-process bus backed by a `tokio::sync::broadcast` channel.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::pattern::glob_match;
use super::{BusMessage, EventBus, MessageHandler};
use crate::errors::BusError;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
struct Published {
    channel: String,
    payload: String,
}

/// Pattern-matching pub/sub inside one process.
///
/// Each subscription runs its own task that filters the shared stream with
/// Redis glob rules and invokes the handler, so handlers never run on the
/// publisher's task.
pub struct MemoryBus {
    tx: broadcast::Sender<Published>,
    patterns: Mutex<Vec<String>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl MemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            patterns: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.patterns.lock().len()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn subscribe(&self, pattern: &str, handler: MessageHandler) {
        if self.cancel.is_cancelled() {
            warn!(pattern, "subscribe on a disconnected memory bus ignored");
            return;
        }
        // Subscribe before spawning so a publish right after this call returns is seen.
        let mut rx = self.tx.subscribe();
        let cancel = self.cancel.clone();
        let pattern = pattern.to_owned();
        self.patterns.lock().push(pattern.clone());
        info!(pattern = %pattern, "memory bus subscribed");

        let _ = self.tasks.spawn(async move {
            loop {
                let published = tokio::select! {
                    () = cancel.cancelled() => break,
                    received = rx.recv() => received,
                };
                match published {
                    Ok(msg) => {
                        if glob_match(&pattern, &msg.channel) {
                            handler(BusMessage {
                                pattern: pattern.clone(),
                                channel: msg.channel,
                                payload: msg.payload,
                            });
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(pattern = %pattern, lagged = n, "memory bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(pattern = %pattern, "memory bus subscription ended");
        });
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, BusError> {
        if self.cancel.is_cancelled() {
            return Err(BusError::Disconnected);
        }
        let matching = self
            .patterns
            .lock()
            .iter()
            .filter(|p| glob_match(p, channel))
            .count();
        // An error only means there are no subscription tasks yet.
        let _ = self.tx.send(Published {
            channel: channel.to_owned(),
            payload: payload.to_owned(),
        });
        Ok(matching)
    }

    async fn disconnect(&self) {
        self.cancel.cancel();
        let _ = self.tasks.close();
        self.tasks.wait().await;
        self.patterns.lock().clear();
        info!("memory bus disconnected");
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
