//! Connection lifecycle: accept, inbound frames, pongs and close.
//!
//! [`LifecycleController::serve`] owns the socket. It splits it into a writer
//! task that drains the connection's outbound queue and a reader task that
//! feeds inbound frames back into the controller. Whichever side finishes
//! first ends the session and the connection is deregistered.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{Sink, SinkExt, StreamExt};
use metrics::counter;
use relay_settings::ServerSettings;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connection::{
    CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_POLICY_VIOLATION, CLOSE_TRY_AGAIN_LATER,
    CloseReason, Connection, ConnectionId, Outbound,
};
use super::frame::ClientFrame;
use super::registry::ConnectionRegistry;
use crate::auth::{AuthRejection, ConnectParams, IdentityVerifier};
use crate::errors::{FrameError, RegistryError};
use crate::metrics::{CONNECTIONS_TOTAL, DISCONNECTIONS_TOTAL};

/// Normal closure status.
const CLOSE_NORMAL: u16 = 1000;
/// Close reasons must fit in a control frame.
const MAX_CLOSE_REASON_BYTES: usize = 123;
/// How long to wait for the peer's close reply after sending ours.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Why a new socket was refused.
#[derive(Debug, Error)]
pub enum AcceptError {
    /// `max_connections` is reached.
    #[error("server at capacity ({0} connections)")]
    AtCapacity(usize),
    /// The identity verifier refused the credentials.
    #[error("{0}")]
    Rejected(#[from] AuthRejection),
    /// The generated id collided with a registered one.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl AcceptError {
    /// WebSocket close status sent to the refused client.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::AtCapacity(_) => CLOSE_TRY_AGAIN_LATER,
            Self::Rejected(_) => CLOSE_POLICY_VIOLATION,
            Self::Registry(_) => CLOSE_INTERNAL_ERROR,
        }
    }
}

/// Accepts sockets and keeps the registry in step with their lifetime.
pub struct LifecycleController {
    registry: Arc<ConnectionRegistry>,
    verifier: Arc<dyn IdentityVerifier>,
    max_connections: usize,
    send_queue_capacity: usize,
    shutdown: CancellationToken,
}

impl LifecycleController {
    /// Create a controller.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        verifier: Arc<dyn IdentityVerifier>,
        settings: &ServerSettings,
    ) -> Self {
        Self {
            registry,
            verifier,
            max_connections: settings.max_connections,
            send_queue_capacity: settings.send_queue_capacity.max(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Close every served connection with 1001 once `token` is cancelled.
    #[must_use]
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Verify, create and register a connection under a fresh id.
    pub async fn accept(
        &self,
        params: &ConnectParams,
    ) -> Result<(Arc<Connection>, mpsc::Receiver<Outbound>), AcceptError> {
        self.accept_with_id(ConnectionId::generate(), params).await
    }

    /// Verify, create and register a connection under `id`.
    pub async fn accept_with_id(
        &self,
        id: ConnectionId,
        params: &ConnectParams,
    ) -> Result<(Arc<Connection>, mpsc::Receiver<Outbound>), AcceptError> {
        // Fast refusal before the verifier runs; the registry re-checks
        // atomically since other accepts may land during verification.
        let active = self.registry.len();
        if active >= self.max_connections {
            return Err(AcceptError::AtCapacity(active));
        }
        let identity = self.verifier.verify(params).await?;

        let (tx, rx) = mpsc::channel(self.send_queue_capacity);
        let conn = Arc::new(Connection::new(id, identity, tx));
        match self
            .registry
            .register_bounded(Arc::clone(&conn), self.max_connections)
        {
            Ok(()) => {}
            Err(RegistryError::Full(active)) => return Err(AcceptError::AtCapacity(active)),
            Err(err) => return Err(err.into()),
        }

        counter!(CONNECTIONS_TOTAL).increment(1);
        info!(
            connection_id = %conn.id(),
            identity = conn.identity(),
            verifier = self.verifier.name(),
            "client connected"
        );
        Ok((conn, rx))
    }

    /// Handle an inbound text frame. Never closes the connection.
    pub fn on_text(&self, conn: &Connection, text: &str) {
        Self::handle_frame(conn, ClientFrame::parse(text));
    }

    /// Handle an inbound binary frame as UTF-8 text.
    pub fn on_binary(&self, conn: &Connection, bytes: &[u8]) {
        Self::handle_frame(conn, ClientFrame::from_binary(bytes));
    }

    fn handle_frame(conn: &Connection, frame: Result<ClientFrame, FrameError>) {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(connection_id = %conn.id(), error = %err, "malformed client frame");
                return;
            }
        };
        let kind = frame.kind();
        match frame {
            ClientFrame::Subscribe { channel } | ClientFrame::Unsubscribe { channel } => {
                debug!(connection_id = %conn.id(), frame = kind, channel = %channel, "channel request ignored");
            }
            ClientFrame::Unrecognized(value) => {
                debug!(connection_id = %conn.id(), frame = kind, body = %value, "unrecognized client frame");
            }
        }
    }

    /// Record a pong.
    pub fn on_pong(&self, conn: &Connection) {
        conn.mark_alive();
    }

    /// Deregister a connection whose transport closed.
    ///
    /// Safe to call for a connection the liveness sweep already removed.
    pub fn on_close(&self, conn: &Connection, reason: &str) {
        if self.registry.deregister(conn.id()).is_some() {
            counter!(DISCONNECTIONS_TOTAL, "reason" => "closed").increment(1);
        }
        info!(
            connection_id = %conn.id(),
            identity = conn.identity(),
            reason,
            duration_secs = conn.age().as_secs(),
            "client disconnected"
        );
    }

    /// Drive one upgraded socket until it closes.
    pub async fn serve(self: Arc<Self>, socket: WebSocket, params: ConnectParams) {
        let (mut sink, mut stream) = socket.split();

        let (conn, rx) = match self.accept(&params).await {
            Ok(accepted) => accepted,
            Err(err) => {
                if matches!(err, AcceptError::Registry(_)) {
                    error!(error = %err, "connection refused");
                } else {
                    warn!(error = %err, "connection refused");
                }
                let frame = close_frame(err.close_code(), &err.to_string());
                let _ = sink.send(Message::Close(Some(frame))).await;
                return;
            }
        };

        let mut writer = tokio::spawn(write_loop(
            Arc::clone(&conn),
            sink,
            rx,
            self.shutdown.clone(),
        ));

        let reader_conn = Arc::clone(&conn);
        let controller = Arc::clone(&self);
        let mut reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => controller.on_text(&reader_conn, text.as_str()),
                    Ok(Message::Binary(bytes)) => controller.on_binary(&reader_conn, &bytes),
                    Ok(Message::Pong(_)) => controller.on_pong(&reader_conn),
                    // The transport answers pings itself.
                    Ok(Message::Ping(_)) => {}
                    Ok(Message::Close(frame)) => {
                        return frame.map_or_else(
                            || "client closed".to_owned(),
                            |f| format!("client closed ({})", f.code),
                        );
                    }
                    Err(err) => return format!("transport error: {err}"),
                }
            }
            "stream ended".to_owned()
        });

        let reason = tokio::select! {
            _ = &mut writer => {
                // Our close frame is out; give the peer a moment to answer it.
                match tokio::time::timeout(CLOSE_GRACE, &mut reader).await {
                    Ok(Ok(reason)) => reason,
                    Ok(Err(_)) | Err(_) => {
                        reader.abort();
                        "closed by server".to_owned()
                    }
                }
            }
            finished = &mut reader => {
                writer.abort();
                finished.unwrap_or_else(|err| format!("reader task failed: {err}"))
            }
        };

        let reason = conn
            .close_reason()
            .map_or(reason, |r| format!("{} ({})", r.reason, r.code));
        self.on_close(&conn, &reason);
    }
}

/// Drain the outbound queue into `sink` until the connection is terminated.
///
/// Termination interrupts a send that is stuck on a peer that stopped
/// reading, and the final close frame gets at most [`CLOSE_GRACE`].
async fn write_loop<S>(
    conn: Arc<Connection>,
    mut sink: S,
    mut rx: mpsc::Receiver<Outbound>,
    shutdown: CancellationToken,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        let message = tokio::select! {
            biased;
            () = conn.terminated() => break,
            // Covers sockets accepted while the registry was being drained.
            () = shutdown.cancelled() => {
                conn.close(CLOSE_GOING_AWAY, "server shutting down");
                continue;
            }
            frame = rx.recv() => match frame {
                Some(Outbound::Text(payload)) => Message::Text(payload.as_ref().into()),
                Some(Outbound::Ping) => Message::Ping(Vec::new().into()),
                None => return,
            },
        };
        tokio::select! {
            biased;
            () = conn.terminated() => {
                debug!(connection_id = %conn.id(), "pending write abandoned on termination");
                break;
            }
            () = shutdown.cancelled() => {
                conn.close(CLOSE_GOING_AWAY, "server shutting down");
                break;
            }
            sent = sink.send(message) => {
                if let Err(err) = sent {
                    debug!(connection_id = %conn.id(), error = %err, "write failed");
                    return;
                }
            }
        }
    }

    let CloseReason { code, reason } = conn.close_reason().unwrap_or(CloseReason {
        code: CLOSE_NORMAL,
        reason: String::new(),
    });
    let close = sink.send(Message::Close(Some(close_frame(code, &reason))));
    if tokio::time::timeout(CLOSE_GRACE, close).await.is_err() {
        debug!(connection_id = %conn.id(), "close frame not flushed in time");
    }
}

fn close_frame(code: u16, reason: &str) -> CloseFrame {
    let mut end = reason.len().min(MAX_CLOSE_REASON_BYTES);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    CloseFrame {
        code,
        reason: reason[..end].into(),
    }
}
