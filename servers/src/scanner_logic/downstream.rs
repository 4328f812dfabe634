//! Client-facing WebSocket and HTTP surface.
//!
//! One inbound handler task and one outbound writer task per connection; the
//! writer owns the socket sink and drains the bounded frame queue, so socket
//! writes are never concurrent. Handshake authentication happens before the
//! connection enters the registry, which is why auth failures need no
//! cleanup.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use lib_common::now_iso8601;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

use crate::scanner_logic::config::Config;
use crate::scanner_logic::model::{ClientAction, ServerEvent};
use crate::scanner_logic::registry::ConnHandle;
use crate::scanner_logic::state::AppState;

pub async fn run(config: Config, state: AppState, mut shutdown: broadcast::Receiver<()>) {
    let app = Router::new()
        .route("/ws/scanner", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/clear_cache", post(clear_cache_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    log::info!("Downstream server listening on {}", addr);

    if let (Some(cert_path), Some(key_path)) = (config.tls_cert_path, config.tls_key_path) {
        let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .expect("Failed to load TLS configuration");

        axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service())
            .await
            .unwrap();
    } else {
        let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.recv().await.ok();
                log::info!("Downstream server shutting down.");
            })
            .await
            .unwrap();
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.registry.len(),
        "timestamp": now_iso8601(),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct ClearCacheRequest {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    date: Option<String>,
}

async fn clear_cache_handler(
    State(state): State<AppState>,
    body: Option<Json<ClearCacheRequest>>,
) -> impl IntoResponse {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let cleared = state.lists.clear();
    log::info!(
        "Snapshot cache cleared ({} entries), reason: {}",
        cleared,
        body.reason.as_deref().unwrap_or("unspecified")
    );
    Json(json!({
        "success": true,
        "caches_cleared": cleared,
        "reason": body.reason,
        "date": body.date,
    }))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, params: HashMap<String, String>) {
    let principal = match state
        .auth
        .authenticate(params.get("token").map(String::as_str))
        .await
    {
        Ok(principal) => principal,
        Err(e) => {
            log::warn!("WebSocket handshake rejected: {}", e);
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: e.close_code(),
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    let (handle, frames) = state
        .registry
        .register(principal.subject, state.config.outbound_queue);
    match handle.subject() {
        Some(subject) => log::info!("Client {} connected as {}", handle.id, subject),
        None => log::info!("Client {} connected", handle.id),
    }

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, frames, handle.close_signal()));

    handle.push(&ServerEvent::Connected {
        client_id: handle.id,
        timestamp: now_iso8601(),
    });

    read_loop(&state, &handle, stream).await;

    state.disconnect(handle.id);
    // The writer exits once every sender is gone; drop ours before waiting.
    drop(handle);
    let _ = writer.await;
}

async fn read_loop(state: &AppState, handle: &Arc<ConnHandle>, mut stream: SplitStream<WebSocket>) {
    loop {
        let message = tokio::select! {
            // Server-side teardown (slow consumer, scan deletion, shutdown)
            // must unwind this task even when the client is silent.
            _ = handle.wait_closed() => break,
            message = stream.next() => message,
        };
        let message = match message {
            Some(Ok(message)) => message,
            _ => break,
        };
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientAction>(&text) {
                Ok(action) => dispatch_action(state, handle, action).await,
                Err(e) => {
                    log::warn!("Failed to parse message from client {}: {}", handle.id, e);
                    state.send_to(
                        handle,
                        &ServerEvent::Error {
                            action: "unknown".to_string(),
                            message: "Invalid message format".to_string(),
                            timestamp: now_iso8601(),
                        },
                    );
                }
            },
            Message::Close(_) => break,
            // Ping/pong frames are handled by the protocol layer.
            _ => {}
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<Arc<str>>,
    close_code: Arc<AtomicU16>,
) {
    while let Some(frame) = frames.recv().await {
        if sink.send(Message::Text(frame.as_ref().into())).await.is_err() {
            return; // client disconnected
        }
    }
    // Queue drained after teardown: close with the code the teardown chose.
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: close_code.load(Ordering::Relaxed),
            reason: "".into(),
        })))
        .await;
}

async fn dispatch_action(state: &AppState, conn: &Arc<ConnHandle>, action: ClientAction) {
    let action_name = action.name();
    match action {
        ClientAction::SubscribeList { list } => {
            if let Err(reason) = state.subscribe_list(conn, &list).await {
                state.send_to(
                    conn,
                    &ServerEvent::Error {
                        action: action_name.to_string(),
                        message: reason,
                        timestamp: now_iso8601(),
                    },
                );
            }
        }
        ClientAction::UnsubscribeList { list } => state.unsubscribe_list(conn, &list),
        ClientAction::Resync { list } => {
            if let Err(reason) = state.resync_list(conn, &list).await {
                state.send_to(
                    conn,
                    &ServerEvent::Error {
                        action: action_name.to_string(),
                        message: reason,
                        timestamp: now_iso8601(),
                    },
                );
            }
        }
        ClientAction::SubscribeQuote { symbol } => state.subscribe_quotes(conn, vec![symbol]),
        ClientAction::SubscribeQuotes { symbols } => state.subscribe_quotes(conn, symbols),
        ClientAction::UnsubscribeQuote { symbol } => state.unsubscribe_quotes(conn, vec![symbol]),
        ClientAction::UnsubscribeQuotes { symbols } => state.unsubscribe_quotes(conn, symbols),
        ClientAction::SubscribeChart { symbol } => state.subscribe_chart(conn, &symbol),
        ClientAction::UnsubscribeChart { symbol } => state.unsubscribe_chart(conn, &symbol),
        ClientAction::SubscribeSecFilings => conn.filings.store(true, Ordering::Relaxed),
        ClientAction::UnsubscribeSecFilings => conn.filings.store(false, Ordering::Relaxed),
        ClientAction::SubscribeNews => conn.news.store(true, Ordering::Relaxed),
        ClientAction::UnsubscribeNews => conn.news.store(false, Ordering::Relaxed),
        ClientAction::Ping { timestamp } => {
            let echo = timestamp.unwrap_or_else(|| Value::String(now_iso8601()));
            state.send_to(conn, &ServerEvent::Pong { timestamp: echo });
        }
        ClientAction::Pong => {}
        ClientAction::RefreshToken { token } => match state.auth.verify(&token).await {
            Ok(principal) => {
                conn.set_subject(principal.subject);
                state.send_to(
                    conn,
                    &ServerEvent::TokenRefreshed {
                        timestamp: now_iso8601(),
                    },
                );
            }
            Err(e) => {
                state.send_to(
                    conn,
                    &ServerEvent::TokenRefreshFailed {
                        reason: e.to_string(),
                        timestamp: now_iso8601(),
                    },
                );
            }
        },
    }
}
