//! Wire protocol for the scanner gateway.
//!
//! Client-inbound messages are a tagged variant on `action`, server-outbound
//! messages a tagged variant on `type`. Unknown fields are tolerated on the
//! way in; every outbound message carries an ISO-8601 `timestamp`.

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Everything a client may send over the WebSocket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
    SubscribeList { list: String },
    UnsubscribeList { list: String },
    Resync { list: String },
    SubscribeQuote { symbol: String },
    SubscribeQuotes { symbols: Vec<String> },
    UnsubscribeQuote { symbol: String },
    UnsubscribeQuotes { symbols: Vec<String> },
    SubscribeChart { symbol: String },
    UnsubscribeChart { symbol: String },
    SubscribeSecFilings,
    UnsubscribeSecFilings,
    // The benzinga aliases are legacy client vocabulary.
    #[serde(alias = "subscribe_benzinga_news")]
    SubscribeNews,
    #[serde(alias = "unsubscribe_benzinga_news")]
    UnsubscribeNews,
    Ping {
        #[serde(default)]
        timestamp: Option<Value>,
    },
    Pong,
    RefreshToken { token: String },
}

impl ClientAction {
    /// The wire name of the action, used in `error` replies.
    pub fn name(&self) -> &'static str {
        match self {
            ClientAction::SubscribeList { .. } => "subscribe_list",
            ClientAction::UnsubscribeList { .. } => "unsubscribe_list",
            ClientAction::Resync { .. } => "resync",
            ClientAction::SubscribeQuote { .. } => "subscribe_quote",
            ClientAction::SubscribeQuotes { .. } => "subscribe_quotes",
            ClientAction::UnsubscribeQuote { .. } => "unsubscribe_quote",
            ClientAction::UnsubscribeQuotes { .. } => "unsubscribe_quotes",
            ClientAction::SubscribeChart { .. } => "subscribe_chart",
            ClientAction::UnsubscribeChart { .. } => "unsubscribe_chart",
            ClientAction::SubscribeSecFilings => "subscribe_sec_filings",
            ClientAction::UnsubscribeSecFilings => "unsubscribe_sec_filings",
            ClientAction::SubscribeNews => "subscribe_news",
            ClientAction::UnsubscribeNews => "unsubscribe_news",
            ClientAction::Ping { .. } => "ping",
            ClientAction::Pong => "pong",
            ClientAction::RefreshToken { .. } => "refresh_token",
        }
    }
}

/// Everything the server may push to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        client_id: u64,
        timestamp: String,
    },
    SubscribedList {
        list: String,
        timestamp: String,
    },
    UnsubscribedList {
        list: String,
        timestamp: String,
    },
    Snapshot {
        list: String,
        sequence: u64,
        rows: Vec<Value>,
        timestamp: String,
    },
    Delta {
        list: String,
        sequence: u64,
        ops: Vec<DeltaOp>,
        timestamp: String,
    },
    Aggregate {
        symbol: String,
        data: Value,
        timestamp: String,
    },
    ChartAggregate {
        symbol: String,
        data: Value,
        timestamp: String,
    },
    Quote {
        symbol: String,
        data: Value,
        timestamp: String,
    },
    SecFiling {
        data: Value,
        timestamp: String,
    },
    BenzingaNews {
        data: Value,
        timestamp: String,
    },
    CatalystAlert {
        data: Value,
        timestamp: String,
    },
    MarketSessionChange {
        data: Value,
        timestamp: String,
    },
    MorningNewsCall {
        data: Value,
        timestamp: String,
    },
    PolygonSubscriptionStatus {
        subscribed_tickers: Vec<String>,
        timestamp: String,
    },
    ScanDeleted {
        list: String,
        timestamp: String,
    },
    TokenRefreshed {
        timestamp: String,
    },
    TokenRefreshFailed {
        reason: String,
        timestamp: String,
    },
    Pong {
        timestamp: Value,
    },
    Error {
        action: String,
        message: String,
        timestamp: String,
    },
}

impl ServerEvent {
    /// Serializes the event once so broadcasts can share the bytes across
    /// every subscriber's outbound queue.
    pub fn to_frame(&self) -> Option<Arc<str>> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Arc::from(json)),
            Err(e) => {
                log::error!("Failed to serialize outbound event: {}", e);
                None
            }
        }
    }
}

/// One entry of a ranked-list delta. Applying the entries of sequence `s` to
/// the list state at `s-1` yields the state at `s`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeltaOp {
    Add {
        symbol: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        row: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rank: Option<u64>,
    },
    Remove {
        symbol: String,
    },
    Update {
        symbol: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        row: Option<Value>,
    },
    Rerank {
        symbol: String,
        rank: u64,
    },
}

impl DeltaOp {
    pub fn symbol(&self) -> &str {
        match self {
            DeltaOp::Add { symbol, .. }
            | DeltaOp::Remove { symbol }
            | DeltaOp::Update { symbol, .. }
            | DeltaOp::Rerank { symbol, .. } => symbol,
        }
    }

    /// Whether this entry removes the symbol from the list.
    pub fn is_removal(&self) -> bool {
        matches!(self, DeltaOp::Remove { .. })
    }
}

/// Whether a ranking stream message replaces state or amends it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankingKind {
    Snapshot,
    Delta,
}

/// Typed form of one `stream:ranking:deltas` entry.
#[derive(Debug, Clone)]
pub struct RankingRecord {
    pub category: String,
    pub kind: RankingKind,
    pub sequence: u64,
    /// JSON body: an array of rows for snapshots, of delta entries for deltas.
    pub payload: String,
}

/// Typed form of one `stream:realtime:aggregates` entry.
#[derive(Debug, Clone)]
pub struct AggregateRecord {
    pub symbol: String,
    pub data: Value,
}

/// Typed form of one `stream:realtime:quotes` entry.
#[derive(Debug, Clone)]
pub struct QuoteRecord {
    pub symbol: String,
    pub data: Value,
}

/// Notification published on `ws:user_scans:changed`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanChange {
    pub action: String,
    #[serde(deserialize_with = "string_or_number")]
    pub scan_id: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl ScanChange {
    /// The list name the scan is published under.
    pub fn list_name(&self) -> String {
        self.category
            .clone()
            .unwrap_or_else(|| format!("{}{}", crate::scanner_logic::state::USER_SCAN_PREFIX, self.scan_id))
    }
}

/// Producers send scan ids as either JSON strings or numbers.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number for scan id, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscribe_list() {
        let action: ClientAction =
            serde_json::from_str(r#"{"action":"subscribe_list","list":"gappers_up"}"#).unwrap();
        match action {
            ClientAction::SubscribeList { list } => assert_eq!(list, "gappers_up"),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn tolerates_unknown_fields() {
        let action: ClientAction = serde_json::from_str(
            r#"{"action":"subscribe_quote","symbol":"AAPL","client_version":"3.1"}"#,
        )
        .unwrap();
        assert_eq!(action.name(), "subscribe_quote");
    }

    #[test]
    fn accepts_legacy_benzinga_alias() {
        let action: ClientAction =
            serde_json::from_str(r#"{"action":"subscribe_benzinga_news"}"#).unwrap();
        assert!(matches!(action, ClientAction::SubscribeNews));
        let action: ClientAction =
            serde_json::from_str(r#"{"action":"unsubscribe_benzinga_news"}"#).unwrap();
        assert!(matches!(action, ClientAction::UnsubscribeNews));
    }

    #[test]
    fn rejects_unknown_action() {
        assert!(serde_json::from_str::<ClientAction>(r#"{"action":"dance"}"#).is_err());
    }

    #[test]
    fn ping_timestamp_is_optional() {
        let action: ClientAction = serde_json::from_str(r#"{"action":"ping"}"#).unwrap();
        assert!(matches!(action, ClientAction::Ping { timestamp: None }));
        let action: ClientAction =
            serde_json::from_str(r#"{"action":"ping","timestamp":1712000000}"#).unwrap();
        match action {
            ClientAction::Ping { timestamp } => assert_eq!(timestamp.unwrap(), 1712000000),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn outbound_events_are_tagged_by_type() {
        let event = ServerEvent::SubscribedList {
            list: "momentum_up".into(),
            timestamp: "2025-01-01T00:00:00.000Z".into(),
        };
        let json: Value = serde_json::from_str(&event.to_frame().unwrap()).unwrap();
        assert_eq!(json["type"], "subscribed_list");
        assert_eq!(json["list"], "momentum_up");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn delta_ops_round_trip() {
        let ops: Vec<DeltaOp> = serde_json::from_str(
            r#"[
                {"type":"remove","symbol":"NVDA"},
                {"type":"add","symbol":"AMD","row":{"symbol":"AMD","change":4.2},"rank":2},
                {"type":"rerank","symbol":"TSLA","rank":0},
                {"type":"update","symbol":"AAPL","row":{"symbol":"AAPL","change":1.0}}
            ]"#,
        )
        .unwrap();
        assert_eq!(ops.len(), 4);
        assert!(ops[0].is_removal());
        assert_eq!(ops[1].symbol(), "AMD");
        let json = serde_json::to_string(&ops).unwrap();
        assert!(json.contains(r#""type":"rerank""#));
        // Absent optionals stay off the wire.
        assert!(!json.contains(r#""row":null"#));
    }

    #[test]
    fn scan_change_accepts_numeric_ids() {
        let change: ScanChange = serde_json::from_str(
            r#"{"action":"deleted","scan_id":42,"category":"uscan_42"}"#,
        )
        .unwrap();
        assert_eq!(change.scan_id, "42");
        assert_eq!(change.list_name(), "uscan_42");

        let change: ScanChange =
            serde_json::from_str(r#"{"action":"created","scan_id":"77","user_id":"user_a"}"#)
                .unwrap();
        assert_eq!(change.list_name(), "uscan_77");
    }
}
