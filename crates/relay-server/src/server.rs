//! Axum server: routes, shared state and the start/listen/shutdown lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_settings::{RelaySettings, ServerSettings};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::{ConnectParams, IdentityVerifier};
use crate::bus::EventBus;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::metrics::DISCONNECTIONS_TOTAL;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::connection::CLOSE_GOING_AWAY;
use crate::websocket::lifecycle::LifecycleController;
use crate::websocket::liveness::LivenessMonitor;
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::router::EventRouter;

/// How long to wait for the HTTP listener task after shutdown.
const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Live connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Accepts upgraded sockets.
    pub lifecycle: Arc<LifecycleController>,
    /// Shutdown signal and connection task tracking.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Server start time.
    pub start_time: Instant,
    /// Prometheus renderer, if a recorder was installed.
    pub metrics_handle: Option<PrometheusHandle>,
    /// Largest inbound WebSocket message accepted.
    pub max_message_size: usize,
}

/// The relay: owns the registry and wires bus, router, monitor and HTTP together.
pub struct RelayServer {
    settings: ServerSettings,
    bus: Arc<dyn EventBus>,
    registry: Arc<ConnectionRegistry>,
    event_router: Arc<EventRouter>,
    monitor: Arc<LivenessMonitor>,
    lifecycle: Arc<LifecycleController>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics_handle: Option<PrometheusHandle>,
}

impl RelayServer {
    /// Compose a server from settings, a bus and an identity verifier.
    pub fn new(
        settings: &RelaySettings,
        bus: Arc<dyn EventBus>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let event_router = Arc::new(EventRouter::from_settings(
            Arc::clone(&registry),
            &settings.bus,
        ));
        let monitor = Arc::new(LivenessMonitor::new(
            Arc::clone(&registry),
            Duration::from_secs(settings.server.heartbeat_interval_secs.max(1)),
        ));
        let lifecycle = Arc::new(
            LifecycleController::new(Arc::clone(&registry), verifier, &settings.server)
                .with_shutdown_token(shutdown.token()),
        );
        Self {
            settings: settings.server.clone(),
            bus,
            registry,
            event_router,
            monitor,
            lifecycle,
            shutdown,
            start_time: Instant::now(),
            metrics_handle: None,
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Build the HTTP router.
    pub fn router(&self) -> Router {
        let state = AppState {
            registry: Arc::clone(&self.registry),
            lifecycle: Arc::clone(&self.lifecycle),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            metrics_handle: self.metrics_handle.clone(),
            max_message_size: self.settings.max_message_size,
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(SetResponseHeaderLayer::overriding(
                header::X_CONTENT_TYPE_OPTIONS,
                HeaderValue::from_static("nosniff"),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                header::X_FRAME_OPTIONS,
                HeaderValue::from_static("DENY"),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                header::REFERRER_POLICY,
                HeaderValue::from_static("no-referrer"),
            ))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Install the bus subscriptions and start the liveness monitor.
    pub async fn start(&self) {
        self.event_router.bind(self.bus.as_ref()).await;
        self.monitor.start(self.shutdown.token());
        info!(
            bus = self.bus.name(),
            heartbeat_secs = self.monitor.period().as_secs(),
            "relay started"
        );
    }

    /// Bind the listener and serve in a background task.
    ///
    /// Returns the bound address (useful with port 0) and the serve task.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(err) = served {
                error!(error = %err, "http server failed");
            }
        });
        info!(addr = %local, "relay listening");
        Ok((local, handle))
    }

    /// Stop accepting, close every connection with 1001, release the bus.
    ///
    /// `listener` is the task returned by [`listen`](Self::listen), if any.
    pub async fn shutdown_gracefully(&self, listener: Option<JoinHandle<()>>) {
        info!(connections = self.registry.len(), "relay shutting down");
        self.shutdown.shutdown();
        self.monitor.stop().await;

        let drained = self.registry.drain();
        for conn in &drained {
            conn.close(CLOSE_GOING_AWAY, "server shutting down");
        }
        counter!(DISCONNECTIONS_TOTAL, "reason" => "shutdown").increment(drained.len() as u64);

        let timeout = Duration::from_secs(self.settings.shutdown_timeout_secs);
        let _ = self.shutdown.graceful_shutdown(Some(timeout)).await;

        self.bus.disconnect().await;

        if let Some(handle) = listener {
            match tokio::time::timeout(LISTENER_STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "listener task failed"),
                Err(_) => warn!("listener did not stop in time"),
            }
        }
        info!(closed = drained.len(), "relay stopped");
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The event router.
    pub fn event_router(&self) -> &Arc<EventRouter> {
        &self.event_router
    }

    /// The liveness monitor.
    pub fn monitor(&self) -> &Arc<LivenessMonitor> {
        &self.monitor
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The upstream bus.
    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    /// Listener and connection settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response();
    }
    let lifecycle = Arc::clone(&state.lifecycle);
    let shutdown = Arc::clone(&state.shutdown);
    ws.max_message_size(state.max_message_size)
        .max_frame_size(state.max_message_size)
        .on_upgrade(move |socket| async move {
            shutdown.spawn(lifecycle.serve(socket, params));
        })
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.registry.len(),
        state.shutdown.is_shutting_down(),
    ))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            crate::metrics::render(handle),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::QueryIdentityVerifier;
    use crate::bus::MemoryBus;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    fn make_server() -> RelayServer {
        let mut settings = RelaySettings::default();
        settings.server.host = "127.0.0.1".into();
        settings.server.port = 0;
        RelayServer::new(
            &settings,
            Arc::new(MemoryBus::new()),
            Arc::new(QueryIdentityVerifier),
        )
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server();
        let (status, body) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert!(body["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn health_reports_shutting_down() {
        let server = make_server();
        server.shutdown().shutdown();
        let (_, body) = get_json(server.router(), "/health").await;
        assert_eq!(body["status"], "shutting_down");
    }

    #[tokio::test]
    async fn security_headers_present() {
        let server = make_server();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        let headers = resp.headers();
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["x-frame-options"], "DENY");
        assert_eq!(headers["referrer-policy"], "no-referrer");
    }

    #[tokio::test]
    async fn cors_is_permissive() {
        let server = make_server();
        let req = Request::builder()
            .uri("/health")
            .header("origin", "https://example.com")
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.headers()["access-control-allow-origin"], "*");
    }

    #[tokio::test]
    async fn ws_without_upgrade_is_rejected() {
        let server = make_server();
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_unavailable() {
        let server = make_server();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_with_recorder_renders_text() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let server = make_server().with_metrics(handle);
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(
            resp.headers()["content-type"]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_binds_both_subscriptions() {
        let server = make_server();
        server.start().await;
        assert!(server.monitor().is_running());
        let published = server
            .bus()
            .publish("user-notifications:alice", "hi")
            .await
            .unwrap();
        assert_eq!(published, 1);
        assert_eq!(server.bus().publish("notifications", "all").await.unwrap(), 1);
        server.shutdown_gracefully(None).await;
        assert!(!server.monitor().is_running());
    }

    #[tokio::test]
    async fn listen_and_shutdown() {
        let server = make_server();
        server.start().await;
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        server.shutdown_gracefully(Some(handle)).await;
        assert!(server.shutdown().is_shutting_down());
        assert!(
            server.bus().publish("notifications", "late").await.is_err()
        );
    }
}
