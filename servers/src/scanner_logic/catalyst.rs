//! Catalyst snapshot recorder.
//!
//! The aggregates consumer keeps a last-trade table up to date as a side
//! effect of dispatch; every 30 seconds the recorder persists the entries
//! that are still fresh to capped, expiring Redis lists so catalyst tooling
//! can look back at recent prints without holding market data long-term.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use lib_common::epoch_millis;
use redis::RedisResult;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::scanner_logic::state::AppState;

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);
/// Only symbols traded within this window are persisted each tick.
const FRESHNESS: Duration = Duration::from_secs(5);
const KEEP_ENTRIES: i64 = 20;
const TTL_SECS: i64 = 900;

#[derive(Debug, Clone)]
pub struct LastTrade {
    pub price: f64,
    pub volume: f64,
    pub rvol: f64,
    pub at: Instant,
}

pub type LastTradeTable = DashMap<String, LastTrade>;

/// Updates the last-trade table from an aggregate payload. Entries without a
/// price are ignored.
pub fn record_trade(table: &LastTradeTable, symbol: &str, data: &Value) {
    let price = data
        .get("close")
        .or_else(|| data.get("price"))
        .and_then(Value::as_f64);
    let Some(price) = price else { return };
    table.insert(
        symbol.to_string(),
        LastTrade {
            price,
            volume: data.get("volume").and_then(Value::as_f64).unwrap_or(0.0),
            rvol: data.get("rvol").and_then(Value::as_f64).unwrap_or(0.0),
            at: Instant::now(),
        },
    );
}

pub async fn run(state: AppState, mut shutdown: broadcast::Receiver<()>) {
    let mut conn = state.redis.commands();
    let mut tick = tokio::time::interval(SNAPSHOT_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tick.tick() => {
                // Entries nobody refreshed within the Redis TTL are dead weight.
                state
                    .trades
                    .retain(|_, trade| trade.at.elapsed() < Duration::from_secs(TTL_SECS as u64));

                let now = Instant::now();
                let ts = epoch_millis();
                let mut pipe = redis::pipe();
                let mut count = 0usize;
                for entry in state.trades.iter() {
                    if now.duration_since(entry.at) >= FRESHNESS {
                        continue;
                    }
                    let key = format!("catalyst:snapshot:{}", entry.key());
                    let record = json!({
                        "price": entry.price,
                        "volume": entry.volume,
                        "rvol": entry.rvol,
                        "ts": ts,
                    })
                    .to_string();
                    pipe.cmd("LPUSH").arg(&key).arg(record).ignore();
                    pipe.cmd("LTRIM").arg(&key).arg(0).arg(KEEP_ENTRIES - 1).ignore();
                    pipe.cmd("EXPIRE").arg(&key).arg(TTL_SECS).ignore();
                    count += 1;
                }
                if count > 0 {
                    let result: RedisResult<()> = pipe.query_async(&mut conn).await;
                    match result {
                        Ok(()) => log::debug!("Recorded {} catalyst snapshots", count),
                        Err(e) => log::error!("Catalyst snapshot batch failed: {}", e),
                    }
                }
            }
        }
    }
    log::info!("Catalyst snapshot recorder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_close_or_price_field() {
        let table = LastTradeTable::new();
        record_trade(&table, "AAPL", &json!({"close": 101.5, "volume": 1200.0, "rvol": 2.5}));
        let trade = table.get("AAPL").unwrap();
        assert_eq!(trade.price, 101.5);
        assert_eq!(trade.volume, 1200.0);

        record_trade(&table, "TSLA", &json!({"price": 250.0}));
        assert_eq!(table.get("TSLA").unwrap().price, 250.0);
        assert_eq!(table.get("TSLA").unwrap().rvol, 0.0);
    }

    #[test]
    fn ignores_payloads_without_a_price() {
        let table = LastTradeTable::new();
        record_trade(&table, "AAPL", &json!({"volume": 5.0}));
        assert!(table.get("AAPL").is_none());
    }

    #[test]
    fn latest_trade_wins() {
        let table = LastTradeTable::new();
        record_trade(&table, "AAPL", &json!({"close": 100.0}));
        record_trade(&table, "AAPL", &json!({"close": 102.0}));
        assert_eq!(table.get("AAPL").unwrap().price, 102.0);
    }
}
