//! Periodic status broadcaster.
//!
//! Polls the market-data connector for its current subscription set and
//! relays it to every client as `polygon_subscription_status`. The first
//! broadcast waits a couple of seconds so startup subscriptions settle.

use std::time::Duration;

use lib_common::now_iso8601;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant};

use crate::scanner_logic::model::ServerEvent;
use crate::scanner_logic::state::AppState;

const POLL_INTERVAL: Duration = Duration::from_secs(10);
const INITIAL_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct ConnectorStatus {
    #[serde(default)]
    subscribed_tickers: Vec<String>,
}

pub async fn run(state: AppState, mut shutdown: broadcast::Receiver<()>) {
    let client = reqwest::Client::new();
    let url = format!(
        "{}/subscriptions",
        state.config.connector_url.trim_end_matches('/')
    );
    let mut tick = interval_at(Instant::now() + INITIAL_DELAY, POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tick.tick() => {
                match fetch_status(&client, &url).await {
                    Ok(status) => {
                        state.broadcast_all(&ServerEvent::PolygonSubscriptionStatus {
                            subscribed_tickers: status.subscribed_tickers,
                            timestamp: now_iso8601(),
                        });
                    }
                    Err(e) => log::warn!("Connector status poll failed: {}", e),
                }
            }
        }
    }
    log::info!("Status broadcaster stopped");
}

async fn fetch_status(client: &reqwest::Client, url: &str) -> Result<ConnectorStatus, String> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| e.to_string())?
        .error_for_status()
        .map_err(|e| e.to_string())?;
    response
        .json::<ConnectorStatus>()
        .await
        .map_err(|e| e.to_string())
}
