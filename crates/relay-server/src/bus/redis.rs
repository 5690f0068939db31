//! Redis-backed bus: `PSUBSCRIBE` on a dedicated pub/sub connection and
//! `PUBLISH` on a multiplexed one.
//!
//! Construction never touches the network. The first `subscribe` spawns a
//! supervisor task that owns the pub/sub connection, re-subscribes every
//! known pattern after each reconnect and sleeps on a capped-linear backoff
//! while Redis is unreachable.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::{ConnectionLike, MultiplexedConnection, PubSub};
use relay_settings::BusSettings;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::ReconnectBackoff;
use super::{BusMessage, EventBus, MessageHandler};
use crate::errors::BusError;

/// Upper bound for each half of [`RedisBus::disconnect`].
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// A subscriber connection that lived this long resets the backoff.
const STABLE_CONNECTION: Duration = Duration::from_secs(5);

struct Subscription {
    pattern: String,
    handler: MessageHandler,
}

struct Shared {
    client: Option<redis::Client>,
    subscriptions: Mutex<Vec<Subscription>>,
    changed: Notify,
    cancel: CancellationToken,
    backoff: ReconnectBackoff,
}

impl Shared {
    fn patterns(&self) -> Vec<String> {
        let subs = self.subscriptions.lock();
        let mut seen = HashSet::new();
        subs.iter()
            .filter(|s| seen.insert(s.pattern.as_str()))
            .map(|s| s.pattern.clone())
            .collect()
    }

    fn dispatch(&self, msg: &redis::Msg) {
        let channel = msg.get_channel_name().to_owned();
        let pattern = if msg.from_pattern() {
            match msg.get_pattern::<String>() {
                Ok(p) => p,
                Err(err) => {
                    warn!(channel = %channel, error = %err, "bus message without readable pattern dropped");
                    return;
                }
            }
        } else {
            channel.clone()
        };
        let payload = match msg.get_payload::<String>() {
            Ok(p) => p,
            Err(err) => {
                warn!(channel = %channel, error = %err, "non-UTF-8 bus payload dropped");
                return;
            }
        };

        let handlers: Vec<MessageHandler> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|s| s.pattern == pattern)
            .map(|s| Arc::clone(&s.handler))
            .collect();
        for handler in handlers {
            handler(BusMessage {
                pattern: pattern.clone(),
                channel: channel.clone(),
                payload: payload.clone(),
            });
        }
    }
}

/// [`EventBus`] over a Redis server.
pub struct RedisBus {
    shared: Arc<Shared>,
    url: String,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    publisher: tokio::sync::Mutex<Option<MultiplexedConnection>>,
}

impl RedisBus {
    /// Create an adapter for `settings.url`.
    ///
    /// An unparseable URL is logged and leaves the adapter permanently
    /// unavailable rather than failing construction.
    pub fn new(settings: &BusSettings) -> Self {
        let client = match redis::Client::open(settings.url.as_str()) {
            Ok(client) => Some(client),
            Err(err) => {
                error!(url = %settings.url, error = %err, "invalid redis url, bus unavailable");
                None
            }
        };
        Self {
            shared: Arc::new(Shared {
                client,
                subscriptions: Mutex::new(Vec::new()),
                changed: Notify::new(),
                cancel: CancellationToken::new(),
                backoff: ReconnectBackoff::from_settings(settings),
            }),
            url: settings.url.clone(),
            supervisor: Mutex::new(None),
            publisher: tokio::sync::Mutex::new(None),
        }
    }

    fn ensure_supervisor(&self) {
        let mut slot = self.supervisor.lock();
        if slot.is_none() {
            let shared = Arc::clone(&self.shared);
            let url = self.url.clone();
            *slot = Some(tokio::spawn(run_subscriber(shared, url)));
        }
    }

    async fn publisher_connection(&self) -> Result<MultiplexedConnection, BusError> {
        let client = self
            .shared
            .client
            .as_ref()
            .ok_or_else(|| BusError::TransportUnavailable(format!("invalid redis url {}", self.url)))?;
        let mut slot = self.publisher.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url = %self.url, "bus publisher connected");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn shutdown_subscriber(&self) {
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(DISCONNECT_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!("bus subscriber stopped"),
                Ok(Err(err)) => warn!(error = %err, "bus subscriber task failed"),
                Err(_) => warn!("bus subscriber did not stop in time"),
            }
        }
    }

    async fn shutdown_publisher(&self) {
        let conn = self.publisher.lock().await.take();
        if let Some(mut conn) = conn {
            let quit = redis::cmd("QUIT");
            match tokio::time::timeout(DISCONNECT_TIMEOUT, conn.req_packed_command(&quit)).await {
                Ok(Ok(_)) => debug!("bus publisher closed"),
                Ok(Err(err)) => warn!(error = %err, "bus publisher close failed"),
                Err(_) => warn!("bus publisher did not close in time"),
            }
        }
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn subscribe(&self, pattern: &str, handler: MessageHandler) {
        if self.shared.cancel.is_cancelled() {
            warn!(pattern, "subscribe on a disconnected redis bus ignored");
            return;
        }
        if self.shared.client.is_none() {
            warn!(pattern, url = %self.url, "redis bus unavailable, subscription will never fire");
        }
        self.shared.subscriptions.lock().push(Subscription {
            pattern: pattern.to_owned(),
            handler,
        });
        self.shared.changed.notify_one();
        self.ensure_supervisor();
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, BusError> {
        if self.shared.cancel.is_cancelled() {
            return Err(BusError::Disconnected);
        }
        let mut conn = self.publisher_connection().await?;
        let published: redis::RedisResult<usize> = conn.publish(channel, payload).await;
        match published {
            Ok(receivers) => Ok(receivers),
            Err(err) => {
                // Force a fresh connection next time.
                let _ = self.publisher.lock().await.take();
                warn!(channel, error = %err, "bus publish failed");
                Err(err.into())
            }
        }
    }

    async fn disconnect(&self) {
        self.shared.cancel.cancel();
        let ((), ()) = tokio::join!(self.shutdown_subscriber(), self.shutdown_publisher());
        info!("redis bus disconnected");
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Supervisor loop: connect, subscribe, pump messages, reconnect on loss.
///
/// Every reconnect waits on the backoff. The attempt counter only resets
/// after a connection proved healthy by delivering a message or staying up
/// for [`STABLE_CONNECTION`].
async fn run_subscriber(shared: Arc<Shared>, url: String) {
    let Some(client) = shared.client.clone() else {
        return;
    };
    let mut attempt: u32 = 0;

    loop {
        if shared.cancel.is_cancelled() {
            return;
        }
        let connected = tokio::select! {
            () = shared.cancel.cancelled() => return,
            result = client.get_async_pubsub() => result,
        };
        let failure = match connected {
            Ok(mut pubsub) => {
                info!(url = %url, "bus subscriber connected");
                let connected_at = Instant::now();
                match pump(&shared, &mut pubsub).await {
                    PumpExit::Cancelled => return,
                    PumpExit::Lost { dispatched } => {
                        if dispatched || connected_at.elapsed() >= STABLE_CONNECTION {
                            attempt = 0;
                        }
                        "connection lost".to_owned()
                    }
                }
            }
            Err(err) => err.to_string(),
        };

        attempt = attempt.saturating_add(1);
        let delay = shared.backoff.delay(attempt);
        warn!(
            url = %url,
            attempt,
            retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %failure,
            "bus subscriber unavailable"
        );
        tokio::select! {
            () = shared.cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PumpExit {
    Cancelled,
    /// The connection dropped; `dispatched` tells whether it carried any message.
    Lost { dispatched: bool },
}

async fn pump(shared: &Shared, pubsub: &mut PubSub) -> PumpExit {
    let mut subscribed: HashSet<String> = HashSet::new();
    let mut dispatched = false;
    loop {
        for pattern in shared.patterns() {
            if subscribed.contains(&pattern) {
                continue;
            }
            if let Err(err) = pubsub.psubscribe(&pattern).await {
                warn!(pattern = %pattern, error = %err, "psubscribe failed");
                return PumpExit::Lost { dispatched };
            }
            info!(pattern = %pattern, "bus pattern subscribed");
            let _ = subscribed.insert(pattern);
        }

        let mut messages = pubsub.on_message();
        loop {
            tokio::select! {
                () = shared.cancel.cancelled() => return PumpExit::Cancelled,
                () = shared.changed.notified() => break,
                next = messages.next() => match next {
                    Some(msg) => {
                        dispatched = true;
                        shared.dispatch(&msg);
                    }
                    None => return PumpExit::Lost { dispatched },
                },
            }
        }
    }
}
