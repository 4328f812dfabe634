//! Snapshot + delta engine.
//!
//! Ranked lists reach clients as a sequence-tagged snapshot followed by
//! deltas whose sequences increase by exactly one. The engine caches
//! snapshots, serves cold subscribers from Redis (deriving missing
//! categories from the filtered universe), and detects per-connection gaps:
//! a client that misses a delta gets its sequence bumped first and a fresh
//! snapshot afterwards, so continued delta arrival cannot loop the resync.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lib_common::now_iso8601;
use redis::AsyncCommands;
use serde_json::Value;

use crate::scanner_logic::filters;
use crate::scanner_logic::model::{DeltaOp, RankingKind, RankingRecord, ServerEvent};
use crate::scanner_logic::state::AppState;

#[derive(Clone)]
pub struct CachedList {
    pub rows: Arc<Vec<Value>>,
    pub sequence: u64,
    fetched_at: Instant,
}

/// In-memory snapshot cache with a staleness bound.
pub struct ListCache {
    entries: Mutex<HashMap<String, CachedList>>,
    max_age: Duration,
}

impl ListCache {
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_age,
        }
    }

    pub fn get_fresh(&self, list: &str) -> Option<CachedList> {
        let entries = self.entries.lock().expect("list cache lock poisoned");
        entries
            .get(list)
            .filter(|c| c.fetched_at.elapsed() < self.max_age)
            .cloned()
    }

    pub fn insert(&self, list: &str, cached: CachedList) {
        self.entries
            .lock()
            .expect("list cache lock poisoned")
            .insert(list.to_string(), cached);
    }

    pub fn invalidate(&self, list: &str) {
        self.entries
            .lock()
            .expect("list cache lock poisoned")
            .remove(list);
    }

    /// Drops every cached snapshot, returning how many were held.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock().expect("list cache lock poisoned");
        let count = entries.len();
        entries.clear();
        count
    }
}

/// Loads the current snapshot of a list: memory cache first, then the
/// per-category Redis key, then the filtered universe put through the
/// canonical category filter.
pub async fn load(state: &AppState, list: &str) -> anyhow::Result<CachedList> {
    if let Some(hit) = state.lists.get_fresh(list) {
        return Ok(hit);
    }

    let mut conn = state.redis.commands();
    let raw: Option<String> = conn.get(format!("scanner:category:{}", list)).await?;
    let rows: Vec<Value> = match raw {
        Some(raw) => serde_json::from_str(&raw)?,
        None => fallback_rows(state, list).await?,
    };

    let sequence = conn
        .get::<_, Option<String>>(format!("scanner:sequence:{}", list))
        .await?
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let cached = CachedList {
        rows: Arc::new(rows),
        sequence,
        fetched_at: Instant::now(),
    };
    state.lists.insert(list, cached.clone());
    state.index.set_list_symbols(list, row_symbols(&cached.rows));
    Ok(cached)
}

async fn fallback_rows(state: &AppState, list: &str) -> anyhow::Result<Vec<Value>> {
    let mut conn = state.redis.commands();
    let raw: Option<String> = conn.get("scanner:filtered_complete:LAST").await?;
    let Some(raw) = raw else {
        log::warn!("No category cache and no filtered universe for {}", list);
        return Ok(Vec::new());
    };
    let envelope: Value = serde_json::from_str(&raw)?;
    let universe = envelope
        .get("tickers")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    Ok(filters::apply(list, &universe))
}

pub fn row_symbols(rows: &[Value]) -> HashSet<String> {
    rows.iter()
        .filter_map(|r| r.get("symbol").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

/// Dispatches one message from `stream:ranking:deltas`.
pub fn handle_ranking(state: &AppState, record: RankingRecord) {
    match record.kind {
        RankingKind::Snapshot => {
            let rows: Vec<Value> = match serde_json::from_str(&record.payload) {
                Ok(rows) => rows,
                Err(e) => {
                    log::warn!("Malformed snapshot payload for {}: {}", record.category, e);
                    return;
                }
            };
            let cached = CachedList {
                rows: Arc::new(rows),
                sequence: record.sequence,
                fetched_at: Instant::now(),
            };
            state
                .index
                .set_list_symbols(&record.category, row_symbols(&cached.rows));
            state.lists.insert(&record.category, cached.clone());
            broadcast_snapshot(state, &record.category, &cached);
        }
        RankingKind::Delta => {
            let ops: Vec<DeltaOp> = match serde_json::from_str(&record.payload) {
                Ok(ops) => ops,
                Err(e) => {
                    log::warn!("Malformed delta payload for {}: {}", record.category, e);
                    return;
                }
            };
            for op in &ops {
                state.index.apply_delta_op(&record.category, op);
            }
            // Cold subscribers must re-read the amended state from Redis.
            state.lists.invalidate(&record.category);
            broadcast_delta(state, &record.category, record.sequence, ops);
        }
    }
}

fn broadcast_snapshot(state: &AppState, list: &str, cached: &CachedList) {
    let event = ServerEvent::Snapshot {
        list: list.to_string(),
        sequence: cached.sequence,
        rows: (*cached.rows).clone(),
        timestamp: now_iso8601(),
    };
    let Some(frame) = event.to_frame() else { return };

    let mut failed = Vec::new();
    for conn_id in state.index.list_subscribers(list) {
        let Some(handle) = state.registry.get(conn_id) else {
            continue;
        };
        let delivered = {
            let mut lists = handle.lists.lock().expect("lists lock poisoned");
            match lists.get_mut(list) {
                Some(last) if cached.sequence >= *last => {
                    *last = cached.sequence;
                    handle.push_frame(frame.clone())
                }
                // Stale snapshot or raced unsubscribe: nothing to send.
                _ => true,
            }
        };
        if !delivered {
            failed.push(conn_id);
        }
    }
    for conn_id in failed {
        state.disconnect(conn_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryDecision {
    /// Duplicate or out-of-date delta.
    Drop,
    /// The next expected sequence.
    Deliver,
    /// A gap: bump the sequence and resynchronize with a snapshot.
    Resync,
}

pub(crate) fn gap_decision(last: u64, incoming: u64) -> DeliveryDecision {
    if incoming <= last {
        DeliveryDecision::Drop
    } else if incoming == last + 1 {
        DeliveryDecision::Deliver
    } else {
        DeliveryDecision::Resync
    }
}

fn broadcast_delta(state: &AppState, list: &str, sequence: u64, ops: Vec<DeltaOp>) {
    let event = ServerEvent::Delta {
        list: list.to_string(),
        sequence,
        ops,
        timestamp: now_iso8601(),
    };
    let Some(frame) = event.to_frame() else { return };

    let mut failed = Vec::new();
    for conn_id in state.index.list_subscribers(list) {
        let Some(handle) = state.registry.get(conn_id) else {
            continue;
        };

        enum Outcome {
            Done,
            PushFailed,
            NeedsResync,
        }
        let outcome = {
            let mut lists = handle.lists.lock().expect("lists lock poisoned");
            match lists.get_mut(list) {
                None => Outcome::Done,
                Some(last) => match gap_decision(*last, sequence) {
                    DeliveryDecision::Drop => Outcome::Done,
                    DeliveryDecision::Deliver => {
                        *last = sequence;
                        if handle.push_frame(frame.clone()) {
                            Outcome::Done
                        } else {
                            Outcome::PushFailed
                        }
                    }
                    DeliveryDecision::Resync => {
                        // Advance before the async snapshot send so further
                        // deltas cannot re-trigger the resync.
                        *last = sequence;
                        Outcome::NeedsResync
                    }
                },
            }
        };
        match outcome {
            Outcome::Done => {}
            Outcome::PushFailed => failed.push(conn_id),
            Outcome::NeedsResync => {
                log::warn!(
                    "Client {} gapped on {} (sequence {}); resyncing",
                    conn_id,
                    list,
                    sequence
                );
                let state = state.clone();
                let list = list.to_string();
                tokio::spawn(async move {
                    resync_subscriber(state, conn_id, list).await;
                });
            }
        }
    }
    for conn_id in failed {
        state.disconnect(conn_id);
    }
}

async fn resync_subscriber(state: AppState, conn_id: u64, list: String) {
    let snap = match load(&state, &list).await {
        Ok(snap) => snap,
        Err(e) => {
            log::warn!("Resync load failed for {}: {}", list, e);
            return;
        }
    };
    let Some(handle) = state.registry.get(conn_id) else {
        return;
    };
    let event = ServerEvent::Snapshot {
        list: list.clone(),
        sequence: snap.sequence,
        rows: (*snap.rows).clone(),
        timestamp: now_iso8601(),
    };
    let delivered = {
        let mut lists = handle.lists.lock().expect("lists lock poisoned");
        match lists.get_mut(&list) {
            Some(last) => {
                *last = (*last).max(snap.sequence);
                handle.push(&event)
            }
            // Unsubscribed while the snapshot was loading.
            None => true,
        }
    };
    if !delivered {
        state.disconnect(conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn gap_decisions_follow_sequence_contract() {
        // Duplicate and stale deltas are dropped.
        assert_eq!(gap_decision(10, 10), DeliveryDecision::Drop);
        assert_eq!(gap_decision(10, 7), DeliveryDecision::Drop);
        // The next sequence is delivered.
        assert_eq!(gap_decision(10, 11), DeliveryDecision::Deliver);
        // Scenario: client at 10 sees 13 arrive; it must be resynced, not
        // handed the delta.
        assert_eq!(gap_decision(10, 13), DeliveryDecision::Resync);
        // Fresh subscriptions start at the snapshot's sequence.
        assert_eq!(gap_decision(0, 1), DeliveryDecision::Deliver);
    }

    #[test]
    fn cache_entries_expire() {
        let cache = ListCache::new(Duration::ZERO);
        cache.insert(
            "gappers_up",
            CachedList {
                rows: Arc::new(vec![]),
                sequence: 4,
                fetched_at: Instant::now(),
            },
        );
        // A zero staleness bound makes everything stale immediately.
        assert!(cache.get_fresh("gappers_up").is_none());

        let cache = ListCache::new(Duration::from_secs(300));
        cache.insert(
            "gappers_up",
            CachedList {
                rows: Arc::new(vec![]),
                sequence: 4,
                fetched_at: Instant::now(),
            },
        );
        assert_eq!(cache.get_fresh("gappers_up").unwrap().sequence, 4);
    }

    #[test]
    fn clear_reports_dropped_entries() {
        let cache = ListCache::new(Duration::from_secs(300));
        for list in ["a", "b", "c"] {
            cache.insert(
                list,
                CachedList {
                    rows: Arc::new(vec![]),
                    sequence: 1,
                    fetched_at: Instant::now(),
                },
            );
        }
        assert_eq!(cache.clear(), 3);
        assert_eq!(cache.clear(), 0);
    }

    #[test]
    fn invalidate_forces_cold_read() {
        let cache = ListCache::new(Duration::from_secs(300));
        cache.insert(
            "momentum_up",
            CachedList {
                rows: Arc::new(vec![json!({"symbol": "AAPL"})]),
                sequence: 9,
                fetched_at: Instant::now(),
            },
        );
        cache.invalidate("momentum_up");
        assert!(cache.get_fresh("momentum_up").is_none());
    }

    #[test]
    fn row_symbols_extracts_unique_symbols() {
        let rows = vec![
            json!({"symbol": "AAPL", "change": 1.0}),
            json!({"symbol": "TSLA"}),
            json!({"change": 2.0}),
            json!({"symbol": "AAPL"}),
        ];
        let symbols = row_symbols(&rows);
        assert_eq!(symbols.len(), 2);
        assert!(symbols.contains("AAPL") && symbols.contains("TSLA"));
    }
}
