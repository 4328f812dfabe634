//! Redis pub/sub listener.
//!
//! Runs on its own client: a subscriber connection must not issue other
//! commands. Reconnects with a short backoff when the subscription drops.

use std::time::Duration;

use futures_util::StreamExt;
use lib_common::now_iso8601;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::scanner_logic::model::{ScanChange, ServerEvent};
use crate::scanner_logic::state::AppState;

const CHANNEL_NEW_DAY: &str = "trading:new_day";
const CHANNEL_SESSION: &str = "events:session:changed";
const CHANNEL_MORNING_NEWS: &str = "notifications:morning_news";
const CHANNEL_USER_SCANS: &str = "ws:user_scans:changed";

pub async fn run(state: AppState, mut shutdown: broadcast::Receiver<()>) {
    loop {
        if shutdown.try_recv().is_ok() {
            break;
        }

        match state.redis.pubsub().await {
            Ok(mut pubsub) => {
                let channels = [
                    CHANNEL_NEW_DAY,
                    CHANNEL_SESSION,
                    CHANNEL_MORNING_NEWS,
                    CHANNEL_USER_SCANS,
                ];
                match pubsub.subscribe(&channels[..]).await {
                    Ok(()) => {
                        log::info!("Pub/sub listener subscribed to {} channels", channels.len());
                        let mut messages = pubsub.on_message();
                        loop {
                            tokio::select! {
                                _ = shutdown.recv() => return,
                                message = messages.next() => {
                                    match message {
                                        Some(message) => handle_message(&state, message),
                                        None => break,
                                    }
                                }
                            }
                        }
                        log::warn!("Pub/sub connection lost; reconnecting");
                    }
                    Err(e) => log::error!("Pub/sub subscribe failed: {}", e),
                }
            }
            Err(e) => log::error!("Pub/sub connection failed: {}", e),
        }

        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }
    log::info!("Pub/sub listener stopped");
}

fn handle_message(state: &AppState, message: redis::Msg) {
    let channel = message.get_channel_name().to_string();
    let payload: String = message.get_payload().unwrap_or_default();

    match channel.as_str() {
        CHANNEL_NEW_DAY => {
            let cleared = state.lists.clear();
            log::info!("New trading day; cleared {} cached snapshots", cleared);
        }
        CHANNEL_SESSION => {
            let state = state.clone();
            tokio::spawn(async move {
                let data = session_payload(&state, &payload).await;
                state.broadcast_all(&ServerEvent::MarketSessionChange {
                    data,
                    timestamp: now_iso8601(),
                });
            });
        }
        CHANNEL_MORNING_NEWS => {
            let data = parse_or_wrap(&payload);
            state.broadcast_all(&ServerEvent::MorningNewsCall {
                data,
                timestamp: now_iso8601(),
            });
        }
        CHANNEL_USER_SCANS => match serde_json::from_str::<ScanChange>(&payload) {
            Ok(change) => handle_scan_change(state, change),
            Err(e) => log::warn!("Malformed user-scan notification: {}", e),
        },
        other => log::debug!("Ignoring message on unexpected channel {}", other),
    }
}

/// Payloads on broadcast channels are usually JSON but not contractually so.
fn parse_or_wrap(payload: &str) -> Value {
    serde_json::from_str(payload).unwrap_or_else(|_| Value::String(payload.to_string()))
}

/// The session-change publish often has no body of its own; the session
/// document (trading date, current session) lives under its own key.
async fn session_payload(state: &AppState, payload: &str) -> Value {
    if let Ok(value) = serde_json::from_str::<Value>(payload) {
        if value.is_object() {
            return value;
        }
    }
    let mut conn = state.redis.commands();
    match conn
        .get::<_, Option<String>>("market:session:status")
        .await
    {
        Ok(Some(raw)) => parse_or_wrap(&raw),
        Ok(None) => Value::String(payload.to_string()),
        Err(e) => {
            log::warn!("Failed to read market session status: {}", e);
            Value::String(payload.to_string())
        }
    }
}

fn handle_scan_change(state: &AppState, change: ScanChange) {
    let list = change.list_name();
    match change.action.as_str() {
        "created" => {
            if let Some(user_id) = change.user_id {
                state
                    .owners
                    .lock()
                    .expect("owners lock poisoned")
                    .insert(change.scan_id, user_id);
            }
        }
        "updated" => {
            let mut owners = state.owners.lock().expect("owners lock poisoned");
            match change.user_id {
                Some(user_id) => {
                    owners.insert(change.scan_id.clone(), user_id);
                }
                // Without the owner in the payload, drop the entry so the
                // next subscribe re-reads it from Redis.
                None => {
                    owners.remove(&change.scan_id);
                }
            }
            drop(owners);
            state.lists.invalidate(&list);
        }
        "deleted" => {
            let event = ServerEvent::ScanDeleted {
                list: list.clone(),
                timestamp: now_iso8601(),
            };
            if let Some(frame) = event.to_frame() {
                for conn_id in state.index.list_subscribers(&list) {
                    if let Some(handle) = state.registry.get(conn_id) {
                        let _ = handle.push_frame(frame.clone());
                        handle
                            .lists
                            .lock()
                            .expect("lists lock poisoned")
                            .remove(&list);
                    }
                }
            }
            state.index.purge_list(&list);
            state
                .owners
                .lock()
                .expect("owners lock poisoned")
                .remove(&change.scan_id);
            state.lists.invalidate(&list);
            log::info!("User scan {} deleted; subscribers notified", list);
        }
        other => log::debug!("Ignoring user-scan action {}", other),
    }
}
