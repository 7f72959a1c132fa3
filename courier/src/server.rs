//! HTTP surface of the Courier server.
//!
//! The broker itself is transport-agnostic; this layer authenticates
//! the stream endpoint by client token, enforces the origin policy
//! before the upgrade, and exposes a publish endpoint that feeds the
//! dispatcher.

use std::sync::Arc;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use courier_core::models::{ClientToken, OutboundMessage, Recipient};
use courier_core::Config;
use courier_stream::Broker;

use crate::ws;

/// Maximum inbound WebSocket message size. Clients only send control
/// traffic upstream, so 64KB is generous.
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

#[derive(Clone)]
struct AppState {
    broker: Arc<Broker>,
}

/// Serve HTTP until a shutdown signal arrives, then close the broker.
pub async fn serve(config: &Config, broker: Arc<Broker>) -> anyhow::Result<()> {
    let state = AppState {
        broker: Arc::clone(&broker),
    };

    let app = Router::new()
        .route("/stream", get(stream_handler))
        .route("/publish", post(publish_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = config.http_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(broker))
        .await?;
    Ok(())
}

async fn shutdown_signal(broker: Arc<Broker>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("Shutdown signal received");
    broker.close().await;
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    token: Option<String>,
}

/// Long-lived client stream: `GET /stream?token=<client-token>`.
async fn stream_handler(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    // Token authentication proper lives with the management API; here
    // the token is the connection's identity.
    let Some(token) = query.token.filter(|t| !t.is_empty()) else {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };

    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok());
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !state.broker.origin_allowed(origin, host) {
        debug!(?origin, "Origin rejected");
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let token = ClientToken::from_string(token);
    upgrade
        .max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| async move {
            let (stream, sink) = ws::split(socket);
            if let Err(e) = state.broker.open_connection(token, stream, sink) {
                // Shutdown won the race; dropping the socket closes it.
                debug!("Connection refused: {e}");
            }
        })
}

#[derive(Debug, Deserialize)]
struct PublishRequest {
    /// Target client token; omit to broadcast to every client.
    token: Option<String>,
    message: String,
}

#[derive(Debug, Serialize)]
struct PublishResponse {
    delivered: usize,
    dropped_slow: usize,
}

/// Fan a freshly persisted message out to live connections.
async fn publish_handler(
    State(state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> Json<PublishResponse> {
    let recipient = match request.token {
        Some(token) => Recipient::Client(ClientToken::from_string(token)),
        None => Recipient::Broadcast,
    };
    let outcome = state
        .broker
        .dispatch(&OutboundMessage::new(recipient, request.message));

    Json(PublishResponse {
        delivered: outcome.delivered,
        dropped_slow: outcome.dropped_slow,
    })
}

async fn health_handler() -> &'static str {
    "ok"
}
