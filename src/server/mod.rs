//! WebSocket delivery for the broadcast hub.
//!
//! Only the two socket endpoints live here; the dashboard's REST/JSON
//! surface and assets belong to the HTTP collaborator. When first-party
//! auth is enabled, an upgrade requires a session cookie and an Origin
//! matching the configured public base URL — enforced here, before any
//! subscription is created.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info};

use crate::config::AccessControlConfig;
use crate::hub::Hub;
use crate::ops::connect::ConnectionManager;
use crate::ops::resolve::ResolveDeps;
use crate::session::SessionManager;

pub const SESSION_COOKIE: &str = "schmux_session";

pub struct ServerState {
    pub hub: Arc<Hub>,
    pub sessions: Arc<SessionManager>,
    pub access: AccessControlConfig,
    pub public_base_url: Option<String>,
    /// Held here so HTTP collaborators routed alongside can reach them
    pub connections: Arc<ConnectionManager>,
    pub resolve: Option<Arc<ResolveDeps>>,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/ws/dashboard", get(ws_dashboard))
        .route("/ws/session/:id", get(ws_session))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: Arc<ServerState>, bind_address: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr, "websocket endpoints listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Auth/origin gate applied before any subscription exists.
fn check_upgrade(state: &ServerState, headers: &HeaderMap) -> Result<(), StatusCode> {
    if !state.access.enabled {
        return Ok(());
    }

    let expected = state
        .public_base_url
        .as_deref()
        .map(|url| url.trim_end_matches('/'));
    let origin = headers
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_end_matches('/'));
    match (expected, origin) {
        (Some(expected), Some(origin)) if origin == expected => {}
        _ => {
            debug!(?origin, ?expected, "websocket origin rejected");
            return Err(StatusCode::FORBIDDEN);
        }
    }

    let has_cookie = headers
        .get("cookie")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|cookies| {
            cookies
                .split(';')
                .any(|c| c.trim_start().starts_with(&format!("{SESSION_COOKIE}=")))
        });
    if !has_cookie {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn ws_dashboard(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if let Err(status) = check_upgrade(&state, &headers) {
        return status.into_response();
    }
    ws.on_upgrade(move |socket| dashboard_stream(socket, state))
        .into_response()
}

async fn dashboard_stream(socket: WebSocket, state: Arc<ServerState>) {
    let (mut sender, mut receiver) = socket.split();
    let (sub_id, mut rx) = state.hub.subscribe_dashboard();

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
            payload = rx.recv() => {
                match payload {
                    Some(json) => {
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    state.hub.unsubscribe_dashboard(sub_id);
}

async fn ws_session(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if let Err(status) = check_upgrade(&state, &headers) {
        return status.into_response();
    }
    // Unknown session: refuse before upgrading
    if let Err(e) = state.sessions.scrollback(&session_id) {
        debug!(session_id, "session socket refused: {e}");
        return StatusCode::NOT_FOUND.into_response();
    }
    ws.on_upgrade(move |socket| session_stream(socket, state, session_id))
        .into_response()
}

async fn session_stream(socket: WebSocket, state: Arc<ServerState>, session_id: String) {
    let (mut sender, mut receiver) = socket.split();

    // Bootstrap: last N lines of scrollback, then live tail
    if let Ok(bootstrap) = state.sessions.scrollback(&session_id) {
        if !bootstrap.is_empty() && sender.send(Message::Binary(bootstrap)).await.is_err() {
            return;
        }
    }

    let (sub_id, mut rx) = state.hub.subscribe_session(&session_id);
    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
            bytes = rx.recv() => {
                match bytes {
                    Some(bytes) => {
                        if sender.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    state.hub.unsubscribe_session(&session_id, sub_id);
}
