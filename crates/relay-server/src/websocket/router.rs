//! Fan-out of bus events to registered connections.

use std::sync::Arc;

use metrics::counter;
use relay_settings::BusSettings;
use tracing::{debug, warn};

use super::connection::{CLOSE_TRY_AGAIN_LATER, Connection};
use super::registry::ConnectionRegistry;
use crate::bus::{BusMessage, EventBus};
use crate::errors::{DeliveryError, RouteError};
use crate::metrics::{
    BUS_MESSAGES_TOTAL, DELIVERY_FAILURES_TOTAL, DISCONNECTIONS_TOTAL, DROPPED_EVENTS_TOTAL,
    MESSAGES_DELIVERED_TOTAL,
};

/// Lifetime queue-full drops after which a client is disconnected as too slow.
const MAX_TOTAL_DROPS: u64 = 100;

/// Outcome of routing one event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Connections selected by the route.
    pub matched: usize,
    /// Connections the payload was queued to.
    pub delivered: usize,
    /// Selected connections that were already closing.
    pub skipped_closed: usize,
    /// Selected connections whose queue rejected the payload.
    pub failed: usize,
}

/// Routes broadcast and targeted events to the matching connections.
pub struct EventRouter {
    registry: Arc<ConnectionRegistry>,
    broadcast_pattern: String,
    user_namespace: String,
}

impl EventRouter {
    /// Create a router for the given channel naming.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        broadcast_pattern: impl Into<String>,
        user_namespace: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            broadcast_pattern: broadcast_pattern.into(),
            user_namespace: user_namespace.into(),
        }
    }

    /// Create a router using the channel names from bus settings.
    pub fn from_settings(registry: Arc<ConnectionRegistry>, settings: &BusSettings) -> Self {
        Self::new(registry, &settings.broadcast_pattern, &settings.user_namespace)
    }

    /// Install the broadcast and targeted subscriptions on `bus`.
    pub async fn bind(self: &Arc<Self>, bus: &dyn EventBus) {
        let router = Arc::clone(self);
        bus.subscribe(
            &self.broadcast_pattern,
            Arc::new(move |msg: BusMessage| {
                counter!(BUS_MESSAGES_TOTAL, "route" => "broadcast").increment(1);
                let _ = router.route_broadcast(&msg.payload);
            }),
        )
        .await;

        let router = Arc::clone(self);
        bus.subscribe(
            &format!("{}:*", self.user_namespace),
            Arc::new(move |msg: BusMessage| {
                counter!(BUS_MESSAGES_TOTAL, "route" => "targeted").increment(1);
                let _ = router.route_targeted(&msg.channel, &msg.payload);
            }),
        )
        .await;
    }

    /// Deliver `payload` to every open connection.
    pub fn route_broadcast(&self, payload: &str) -> DeliveryReport {
        let payload: Arc<str> = Arc::from(payload);
        let mut report = DeliveryReport::default();
        self.registry
            .for_each(|conn| self.deliver(conn, &payload, "broadcast", &mut report));
        record(&report, "broadcast");
        debug!(
            matched = report.matched,
            delivered = report.delivered,
            skipped_closed = report.skipped_closed,
            failed = report.failed,
            "broadcast routed"
        );
        report
    }

    /// Deliver `payload` to the connections of the identity named by `channel`.
    ///
    /// A channel that is not `<namespace>:<identity>` is dropped with a
    /// warning and reported as an error; nothing is delivered.
    pub fn route_targeted(&self, channel: &str, payload: &str) -> Result<DeliveryReport, RouteError> {
        let identity = match self.parse_target(channel) {
            Ok(identity) => identity,
            Err(err) => {
                counter!(DROPPED_EVENTS_TOTAL, "reason" => "malformed_channel").increment(1);
                warn!(channel, error = %err, "dropping targeted event");
                return Err(err);
            }
        };

        let payload: Arc<str> = Arc::from(payload);
        let mut report = DeliveryReport::default();
        for conn in &self.registry.find_by_identity(identity) {
            self.deliver(conn, &payload, "targeted", &mut report);
        }
        record(&report, "targeted");
        debug!(
            identity,
            matched = report.matched,
            delivered = report.delivered,
            "targeted event routed"
        );
        Ok(report)
    }

    /// Extract the identity from a targeted channel name.
    ///
    /// The namespace is the text before the first `:` and must equal the
    /// configured one; the identity is everything after it and must be
    /// non-empty.
    pub fn parse_target<'a>(&self, channel: &'a str) -> Result<&'a str, RouteError> {
        let malformed = |reason| RouteError::MalformedChannel {
            channel: channel.to_owned(),
            reason,
        };
        let (namespace, identity) = channel
            .split_once(':')
            .ok_or_else(|| malformed("missing ':' separator"))?;
        if namespace != self.user_namespace {
            return Err(malformed("unexpected namespace"));
        }
        if identity.is_empty() {
            return Err(malformed("empty identity"));
        }
        Ok(identity)
    }

    fn deliver(
        &self,
        conn: &Arc<Connection>,
        payload: &Arc<str>,
        route: &'static str,
        report: &mut DeliveryReport,
    ) {
        report.matched += 1;
        if !conn.is_open() {
            report.skipped_closed += 1;
            return;
        }
        match conn.send_text(Arc::clone(payload)) {
            Ok(()) => report.delivered += 1,
            Err(DeliveryError::Closed) => report.skipped_closed += 1,
            Err(err @ DeliveryError::QueueFull) => {
                report.failed += 1;
                let drops = conn.drop_count();
                if drops >= MAX_TOTAL_DROPS {
                    warn!(connection_id = %conn.id(), route, drops, "disconnecting slow client");
                    conn.close(CLOSE_TRY_AGAIN_LATER, "client too slow");
                    if self.registry.deregister(conn.id()).is_some() {
                        counter!(DISCONNECTIONS_TOTAL, "reason" => "slow_client").increment(1);
                    }
                } else {
                    warn!(connection_id = %conn.id(), route, total_drops = drops, error = %err, "delivery failed");
                }
            }
        }
    }
}

fn record(report: &DeliveryReport, route: &'static str) {
    counter!(MESSAGES_DELIVERED_TOTAL, "route" => route).increment(report.delivered as u64);
    if report.failed > 0 {
        counter!(DELIVERY_FAILURES_TOTAL, "route" => route).increment(report.failed as u64);
    }
}
