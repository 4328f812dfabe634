use chrono::{Duration, Utc};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Monitors scanner gateway WebSocket throughput", long_about = None)]
struct Args {
    /// Gateway WebSocket URL, including the token when auth is enabled.
    #[clap(
        short,
        long,
        default_value = "ws://127.0.0.1:8765/ws/scanner"
    )]
    url: String,

    /// Lists to subscribe to.
    #[clap(short, long, default_values_t = vec!["gappers_up".to_string(), "momentum_up".to_string()])]
    lists: Vec<String>,

    /// Symbols to subscribe to for quotes.
    #[clap(short, long, default_values_t = vec!["AAPL".to_string(), "TSLA".to_string(), "NVDA".to_string()])]
    symbols: Vec<String>,

    /// Reporting interval in minutes. A summary of messages per minute will be printed at this interval.
    #[clap(short, long, default_value_t = 1)]
    report_interval_minutes: u64,
}

#[derive(Debug, Deserialize)]
/// The envelope every gateway message shares: a `type` tag, and `list` or
/// `symbol` where applicable.
struct GatewayMessage {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    list: Option<String>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    sequence: Option<u64>,
}

/// Holds the collected message timestamps for calculating throughput rates.
struct Stats {
    global_timestamps: VecDeque<chrono::DateTime<Utc>>,
    type_timestamps: HashMap<String, VecDeque<chrono::DateTime<Utc>>>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let stats = Arc::new(Mutex::new(Stats {
        global_timestamps: VecDeque::new(),
        type_timestamps: HashMap::new(),
    }));

    let stats_reporter = Arc::clone(&stats);
    let report_interval_seconds = args.report_interval_minutes * 60;
    tokio::spawn(async move {
        loop {
            sleep(std::time::Duration::from_secs(report_interval_seconds)).await;
            let now = Utc::now();
            let one_minute_ago = now - Duration::minutes(1);

            let mut data = stats_reporter.lock().unwrap();

            while data
                .global_timestamps
                .front()
                .map_or(false, |&t| t < one_minute_ago)
            {
                data.global_timestamps.pop_front();
            }
            let global_rate = data.global_timestamps.len();

            let mut rates: Vec<(String, usize)> = Vec::new();
            for (msg_type, dq) in data.type_timestamps.iter_mut() {
                while dq.front().map_or(false, |&t| t < one_minute_ago) {
                    dq.pop_front();
                }
                if !dq.is_empty() {
                    rates.push((msg_type.clone(), dq.len()));
                }
            }

            rates.sort_by(|a, b| b.1.cmp(&a.1));

            let report = rates
                .iter()
                .map(|(t, r)| format!("{}: {} msg/min", t, r))
                .collect::<Vec<_>>()
                .join(", ");

            println!("\n----- 1-Minute Summary -----");
            println!("Global rate: {} msg/min", global_rate);
            println!(
                "Types: {}",
                if report.is_empty() { "No data" } else { &report }
            );
            println!("----------------------------\n");
        }
    });

    // Main WebSocket Loop
    println!("Connecting to {}...", args.url);
    let (ws_stream, _) = connect_async(args.url.as_str())
        .await
        .expect("Failed to connect");
    let (mut write, mut read) = ws_stream.split();

    // Subscribe to the requested lists and quote symbols
    for list in &args.lists {
        let msg = json!({ "action": "subscribe_list", "list": list }).to_string();
        write
            .send(Message::Text(msg.into()))
            .await
            .expect("Failed to send subscribe_list");
    }
    let msg = json!({ "action": "subscribe_quotes", "symbols": args.symbols }).to_string();
    write
        .send(Message::Text(msg.into()))
        .await
        .expect("Failed to send subscribe_quotes");
    println!("Subscribed. Press Ctrl+C to stop.");

    // Handle incoming messages
    while let Some(Ok(msg)) = read.next().await {
        if let Message::Text(text) = msg {
            if let Ok(parsed) = serde_json::from_str::<GatewayMessage>(&text) {
                if parsed.msg_type == "snapshot" {
                    println!(
                        "Snapshot for {} at sequence {}",
                        parsed.list.as_deref().unwrap_or("?"),
                        parsed.sequence.unwrap_or(0)
                    );
                }
                if parsed.msg_type == "error" {
                    println!("Server error: {}", text);
                }
                let _ = parsed.symbol;
                let now = Utc::now();
                let mut data = stats.lock().unwrap();
                data.global_timestamps.push_back(now);
                data.type_timestamps
                    .entry(parsed.msg_type)
                    .or_insert_with(VecDeque::new)
                    .push_back(now);
            }
        }
    }
}
