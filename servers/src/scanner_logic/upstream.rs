//! Upstream subscription publisher.
//!
//! Ref-count transitions in the subscription index arrive here through an
//! unbounded channel (in transition order) and are appended to the control
//! streams the external market-data connector consumes. The gateway never
//! derives these commands from list membership; the scanner owns that
//! demand.

use lib_common::now_iso8601;
use redis::{AsyncCommands, RedisResult};
use tokio::sync::{broadcast, mpsc};

use crate::scanner_logic::index::{SubCommand, SubKind};
use crate::scanner_logic::state::AppState;

const STREAM_CHART_SUBSCRIPTIONS: &str = "polygon_ws:subscriptions";
const STREAM_QUOTE_SUBSCRIPTIONS: &str = "polygon_ws:quote_subscriptions";

pub async fn run(
    state: AppState,
    mut commands: mpsc::UnboundedReceiver<SubCommand>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut conn = state.redis.commands();
    log::info!("Upstream subscription publisher started");

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            command = commands.recv() => {
                match command {
                    Some(command) => publish(&mut conn, command).await,
                    None => break,
                }
            }
        }
    }
    log::info!("Upstream subscription publisher stopped");
}

async fn publish(conn: &mut redis::aio::ConnectionManager, command: SubCommand) {
    let stream = match command.kind {
        SubKind::Chart => STREAM_CHART_SUBSCRIPTIONS,
        SubKind::Quote => STREAM_QUOTE_SUBSCRIPTIONS,
    };
    let timestamp = now_iso8601();
    let result: RedisResult<String> = conn
        .xadd(
            stream,
            "*",
            &[
                ("action", command.action.as_str()),
                ("symbol", command.symbol.as_str()),
                ("timestamp", timestamp.as_str()),
            ],
        )
        .await;
    match result {
        Ok(_) => log::debug!(
            "Published {} {} to {}",
            command.action.as_str(),
            command.symbol,
            stream
        ),
        Err(e) => log::error!(
            "Failed to publish {} {} to {}: {}",
            command.action.as_str(),
            command.symbol,
            stream,
            e
        ),
    }
}
