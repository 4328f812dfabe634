//! Redis Stream consumers.
//!
//! One task per stream, each owning its own connection: a blocking read
//! stalls whatever connection it runs on. The ranked/aggregate/quote streams
//! use durable consumer groups with batch ACKs; filings and news are
//! read-only tails started at `$`. A missing consumer group is recreated
//! from the beginning of the stream and the read retried immediately.

use std::time::Duration;

use lib_common::now_iso8601;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisResult};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::scanner_logic::catalyst;
use crate::scanner_logic::model::{
    AggregateRecord, QuoteRecord, RankingKind, RankingRecord, ServerEvent,
};
use crate::scanner_logic::registry::ConnId;
use crate::scanner_logic::snapshot;
use crate::scanner_logic::state::AppState;

const STREAM_RANKING: &str = "stream:ranking:deltas";
const GROUP_RANKING: &str = "websocket_server_deltas";
const STREAM_AGGREGATES: &str = "stream:realtime:aggregates";
const GROUP_AGGREGATES: &str = "websocket_server_aggregates";
const STREAM_QUOTES: &str = "stream:realtime:quotes";
const GROUP_QUOTES: &str = "websocket_server_quotes";
const STREAM_FILINGS: &str = "stream:sec:filings";
const STREAM_NEWS: &str = "stream:benzinga:news";

const CONSUMER_NAME: &str = "gateway_1";
const READ_BLOCK_MS: usize = 100;
const READ_COUNT: usize = 64;
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub async fn run_ranking(state: AppState, shutdown: broadcast::Receiver<()>) {
    consume_group(state, STREAM_RANKING, GROUP_RANKING, shutdown, |state, entry| {
        match decode_ranking(entry) {
            Some(record) => {
                snapshot::handle_ranking(state, record);
                true
            }
            None => false,
        }
    })
    .await;
}

pub async fn run_aggregates(state: AppState, shutdown: broadcast::Receiver<()>) {
    consume_group(
        state,
        STREAM_AGGREGATES,
        GROUP_AGGREGATES,
        shutdown,
        |state, entry| {
            let Some(record) = decode_aggregate(entry) else {
                return false;
            };
            catalyst::record_trade(&state.trades, &record.symbol, &record.data);

            // Chart subscribers get every bar immediately; list subscribers
            // go through the sampler's throttle.
            let chart_conns = state.index.chart_subscribers(&record.symbol);
            if !chart_conns.is_empty() {
                let event = ServerEvent::ChartAggregate {
                    symbol: record.symbol.clone(),
                    data: record.data.clone(),
                    timestamp: now_iso8601(),
                };
                push_to_all(state, &event, chart_conns);
            }

            state.sampler.ingest(&record.symbol, record.data);
            true
        },
    )
    .await;
}

pub async fn run_quotes(state: AppState, shutdown: broadcast::Receiver<()>) {
    consume_group(state, STREAM_QUOTES, GROUP_QUOTES, shutdown, |state, entry| {
        let Some(record) = decode_quote(entry) else {
            return false;
        };
        let subscribers = state.index.quote_subscribers(&record.symbol);
        if !subscribers.is_empty() {
            let event = ServerEvent::Quote {
                symbol: record.symbol,
                data: record.data,
                timestamp: now_iso8601(),
            };
            push_to_all(state, &event, subscribers);
        }
        true
    })
    .await;
}

pub async fn run_filings(state: AppState, shutdown: broadcast::Receiver<()>) {
    consume_tail(state, STREAM_FILINGS, shutdown, |state, entry| {
        let Some(data) = decode_payload(entry) else {
            return;
        };
        let event = ServerEvent::SecFiling {
            data,
            timestamp: now_iso8601(),
        };
        push_to_flagged(state, &event, |handle| {
            handle.filings.load(std::sync::atomic::Ordering::Relaxed)
        });
    })
    .await;
}

pub async fn run_news(state: AppState, shutdown: broadcast::Receiver<()>) {
    consume_tail(state, STREAM_NEWS, shutdown, |state, entry| {
        let Some(data) = decode_payload(entry) else {
            return;
        };
        // The news stream also carries catalyst alerts, relayed as their own
        // message type.
        let event = if data.get("type").and_then(Value::as_str) == Some("catalyst_alert") {
            ServerEvent::CatalystAlert {
                data,
                timestamp: now_iso8601(),
            }
        } else {
            ServerEvent::BenzingaNews {
                data,
                timestamp: now_iso8601(),
            }
        };
        push_to_flagged(state, &event, |handle| {
            handle.news.load(std::sync::atomic::Ordering::Relaxed)
        });
    })
    .await;
}

// --- shared loops -----------------------------------------------------------

async fn consume_group<F>(
    state: AppState,
    stream: &str,
    group: &str,
    mut shutdown: broadcast::Receiver<()>,
    handle_entry: F,
) where
    F: Fn(&AppState, &StreamId) -> bool,
{
    let Some(mut conn) = connect(&state, stream, &mut shutdown).await else {
        return;
    };
    log::info!("Consumer for {} started (group {})", stream, group);

    loop {
        if shutdown.try_recv().is_ok() {
            break;
        }

        let opts = StreamReadOptions::default()
            .group(group, CONSUMER_NAME)
            .block(READ_BLOCK_MS)
            .count(READ_COUNT);
        let reply: RedisResult<StreamReadReply> =
            conn.xread_options(&[stream], &[">"], &opts).await;

        match reply {
            Ok(reply) => {
                let mut acked: Vec<String> = Vec::new();
                for key in reply.keys {
                    for entry in key.ids {
                        if handle_entry(&state, &entry) {
                            acked.push(entry.id.clone());
                        } else {
                            log::warn!("Skipping malformed entry {} on {}", entry.id, stream);
                        }
                    }
                }
                if !acked.is_empty() {
                    let result: RedisResult<u64> = conn.xack(stream, group, &acked).await;
                    if let Err(e) = result {
                        log::error!("XACK failed on {}: {}", stream, e);
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) if is_nogroup(&e) => {
                log::warn!("Consumer group {} missing on {}; recreating", group, stream);
                let result: RedisResult<()> =
                    conn.xgroup_create_mkstream(stream, group, "0").await;
                if let Err(e) = result {
                    log::error!("Failed to recreate group {} on {}: {}", group, stream, e);
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
            Err(e) => {
                log::error!("Read error on {}: {}", stream, e);
                tokio::time::sleep(ERROR_BACKOFF).await;
                match connect(&state, stream, &mut shutdown).await {
                    Some(fresh) => conn = fresh,
                    None => break,
                }
            }
        }
    }
    log::info!("Consumer for {} stopped", stream);
}

async fn consume_tail<F>(
    state: AppState,
    stream: &str,
    mut shutdown: broadcast::Receiver<()>,
    handle_entry: F,
) where
    F: Fn(&AppState, &StreamId),
{
    let Some(mut conn) = connect(&state, stream, &mut shutdown).await else {
        return;
    };
    log::info!("Consumer for {} started (tail)", stream);
    let mut last_id = "$".to_string();

    loop {
        if shutdown.try_recv().is_ok() {
            break;
        }

        let opts = StreamReadOptions::default().block(READ_BLOCK_MS).count(READ_COUNT);
        let reply: RedisResult<StreamReadReply> = conn
            .xread_options(&[stream], &[last_id.as_str()], &opts)
            .await;

        match reply {
            Ok(reply) => {
                for key in reply.keys {
                    for entry in key.ids {
                        last_id = entry.id.clone();
                        handle_entry(&state, &entry);
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => {
                log::error!("Read error on {}: {}", stream, e);
                tokio::time::sleep(ERROR_BACKOFF).await;
                match connect(&state, stream, &mut shutdown).await {
                    Some(fresh) => conn = fresh,
                    None => break,
                }
            }
        }
    }
    log::info!("Consumer for {} stopped", stream);
}

/// Opens the task's dedicated connection, retrying until it succeeds or the
/// shutdown signal arrives.
async fn connect(
    state: &AppState,
    stream: &str,
    shutdown: &mut broadcast::Receiver<()>,
) -> Option<MultiplexedConnection> {
    loop {
        match state.redis.dedicated().await {
            Ok(conn) => return Some(conn),
            Err(e) => {
                log::error!("Failed to open connection for {}: {}", stream, e);
            }
        }
        tokio::select! {
            _ = shutdown.recv() => return None,
            _ = tokio::time::sleep(ERROR_BACKOFF) => {}
        }
    }
}

fn is_nogroup(e: &redis::RedisError) -> bool {
    e.code() == Some("NOGROUP")
}

// --- dispatch helpers --------------------------------------------------------

fn push_to_all(state: &AppState, event: &ServerEvent, conn_ids: Vec<ConnId>) {
    let Some(frame) = event.to_frame() else { return };
    let mut failed = Vec::new();
    for conn_id in conn_ids {
        if let Some(handle) = state.registry.get(conn_id) {
            if !handle.push_frame(frame.clone()) {
                failed.push(conn_id);
            }
        }
    }
    for conn_id in failed {
        state.disconnect(conn_id);
    }
}

fn push_to_flagged<P>(state: &AppState, event: &ServerEvent, wants: P)
where
    P: Fn(&crate::scanner_logic::registry::ConnHandle) -> bool,
{
    let Some(frame) = event.to_frame() else { return };
    let mut failed = Vec::new();
    for handle in state.registry.handles() {
        if wants(&handle) && !handle.push_frame(frame.clone()) {
            failed.push(handle.id);
        }
    }
    for conn_id in failed {
        state.disconnect(conn_id);
    }
}

// --- typed decoding at the consumer boundary ---------------------------------

fn field(entry: &StreamId, name: &str) -> Option<String> {
    entry.get::<String>(name)
}

fn decode_ranking(entry: &StreamId) -> Option<RankingRecord> {
    let category = field(entry, "category")?;
    let kind = match field(entry, "type")?.as_str() {
        "snapshot" => RankingKind::Snapshot,
        "delta" => RankingKind::Delta,
        other => {
            log::warn!("Unknown ranking message type: {}", other);
            return None;
        }
    };
    let sequence = field(entry, "sequence")?.parse::<u64>().ok()?;
    let payload = field(entry, "payload")?;
    Some(RankingRecord {
        category,
        kind,
        sequence,
        payload,
    })
}

fn decode_aggregate(entry: &StreamId) -> Option<AggregateRecord> {
    let symbol = field(entry, "symbol")?;
    let data = serde_json::from_str(&field(entry, "payload")?).ok()?;
    Some(AggregateRecord { symbol, data })
}

fn decode_quote(entry: &StreamId) -> Option<QuoteRecord> {
    let symbol = field(entry, "symbol")?;
    let data = serde_json::from_str(&field(entry, "payload")?).ok()?;
    Some(QuoteRecord { symbol, data })
}

fn decode_payload(entry: &StreamId) -> Option<Value> {
    serde_json::from_str(&field(entry, "payload")?).ok()
}
