//! Connection handlers for the Rakewire server.
//!
//! This module handles the connection lifecycle: handshake authentication,
//! the per-connection task that is the only writer to its socket, and the
//! HTTP routes next to the WebSocket endpoint.

use crate::config::{Config, ConfigError};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use rakewire_core::{
    outbound_channel, telemetry, AuthError, ConnectionAuthenticator, Handshake, Hub, Identity,
    JwtValidator, LivenessMonitor, Outbound, RolePolicy,
};
use rakewire_protocol::CloseReason;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Longest a single socket write may take before the peer is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared server state.
pub struct AppState {
    /// Connection hub.
    pub hub: Arc<Hub>,
    /// Handshake authenticator.
    pub authenticator: ConnectionAuthenticator,
    /// Server configuration.
    pub config: Config,
}

/// A configured server that has not started listening yet.
pub struct Server {
    state: Arc<AppState>,
    monitor: LivenessMonitor,
}

impl Server {
    /// Build the hub, authenticator and access policy from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if auth is required but no secret is configured.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        let authenticator = if config.auth.required {
            let secret = config
                .auth
                .jwt_secret
                .as_deref()
                .ok_or(ConfigError::MissingJwtSecret)?;
            let validator =
                JwtValidator::new(secret.as_bytes()).with_leeway(config.auth.leeway_secs);
            ConnectionAuthenticator::new(Arc::new(validator))
        } else {
            warn!("Authentication disabled, every connection is anonymous");
            ConnectionAuthenticator::disabled()
        };

        let policy: RolePolicy = config
            .access
            .channels
            .iter()
            .map(|(channel, roles)| (channel.clone(), roles.clone()))
            .collect();
        info!(restricted_channels = policy.len(), "Access policy loaded");

        let (hub, monitor) = Hub::new(config.hub_config(), Arc::new(policy));

        Ok(Self {
            state: Arc::new(AppState {
                hub: Arc::new(hub),
                authenticator,
                config,
            }),
            monitor,
        })
    }

    /// Shared state, for embedding event sources.
    #[must_use]
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// HTTP routes.
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.state.config.transport.websocket_path, get(ws_handler))
            .route("/health", get(health_handler))
            .route("/stats", get(stats_handler))
            .with_state(Arc::clone(&self.state))
    }

    /// Serve on `listener` until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let Server { state, monitor } = self;

        let monitor_task = tokio::spawn(monitor.run());

        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Rakewire server listening");
            info!(
                "WebSocket endpoint: ws://{}{}",
                addr, state.config.transport.websocket_path
            );
        }

        let hub = Arc::clone(&state.hub);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("Shutting down, closing all connections");
                hub.shutdown();
            })
            .await?;

        monitor_task.abort();
        Ok(())
    }
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    config.validate()?;

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            warn!(error = %e, "Failed to start metrics server");
        }
    }

    let addr = config.bind_addr()?;
    let server = Server::new(config)?;
    let listener = TcpListener::bind(addr).await?;

    server
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Connection and channel counts.
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.hub.stats())
}

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct HandshakeQuery {
    /// Bearer token, for clients that cannot set headers.
    pub token: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HandshakeQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let handshake = Handshake {
        authorization: headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
        query_token: query.token.as_deref(),
    };
    let result = state.authenticator.authenticate(&handshake).await;

    // Headroom over the frame limit so oversized frames get an error reply
    // from the hub instead of a transport abort.
    ws.max_message_size(state.config.limits.max_message_size.saturating_mul(2))
        .on_upgrade(move |socket| async move {
            match result {
                Ok(identity) => handle_websocket(socket, state, identity).await,
                Err(e) => reject(socket, &e).await,
            }
        })
}

/// Close an unauthenticated socket.
async fn reject(mut socket: WebSocket, error: &AuthError) {
    warn!(error = %error, "Handshake rejected");
    metrics::record_error("auth");
    let _ = socket.send(close_message(CloseReason::AuthFailed)).await;
}

fn close_message(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: reason.code(),
        reason: reason.reason().into(),
    }))
}

/// Handle an authenticated WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, identity: Identity) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let (outbound, mut queue) = outbound_channel(state.config.limits.outbound_queue);

    let (mut sender, mut receiver) = socket.split();

    let connection_id = match state.hub.connect(identity, outbound) {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "Connection refused");
            let _ = sender.send(close_message(CloseReason::AtCapacity)).await;
            return;
        }
    };

    debug!(connection = %connection_id, "WebSocket connected");

    loop {
        tokio::select! {
            biased;

            // Frames queued by the hub for this connection
            item = queue.recv() => {
                let message = match item {
                    Some(Outbound::Frame(text)) => {
                        telemetry::record_message("outbound", text.len());
                        Message::Text(text.to_string())
                    }
                    Some(Outbound::Ping) => Message::Ping(Vec::new()),
                    Some(Outbound::Close(reason)) => {
                        debug!(connection = %connection_id, reason = %reason, "Closing connection");
                        let _ = tokio::time::timeout(WRITE_TIMEOUT, sender.send(close_message(reason))).await;
                        break;
                    }
                    None => break,
                };

                match tokio::time::timeout(WRITE_TIMEOUT, sender.send(message)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(connection = %connection_id, error = %e, "Socket write failed");
                        break;
                    }
                    Err(_) => {
                        warn!(connection = %connection_id, "Socket write timed out");
                        metrics::record_error("write_timeout");
                        break;
                    }
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        state.hub.handle_text(&connection_id, &text);
                        metrics::record_latency(start.elapsed());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        state.hub.handle_text(&connection_id, &String::from_utf8_lossy(&data));
                    }
                    Some(Ok(Message::Pong(_) | Message::Ping(_))) => {
                        state.hub.mark_alive(&connection_id);
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Cascades through every channel; a no-op if the hub already removed it.
    state.hub.disconnect(&connection_id, CloseReason::Normal);

    debug!(connection = %connection_id, "WebSocket disconnected");
}
