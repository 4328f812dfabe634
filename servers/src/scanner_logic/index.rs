//! Inverted subscription indices and per-symbol reference counts.
//!
//! One coarse lock guards the four structures so that a ref-count transition
//! and the upstream command it produces are observed in the same order they
//! happened. Commands go into an unbounded channel while the lock is held;
//! the publisher task (`upstream.rs`) drains it.
//!
//! The index stores connection ids, never handles, so there is no reference
//! cycle with the registry.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::scanner_logic::model::DeltaOp;
use crate::scanner_logic::registry::ConnId;

/// Which upstream channel a subscription command belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubKind {
    Quote,
    Chart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAction {
    Subscribe,
    Unsubscribe,
}

impl SubAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubAction::Subscribe => "subscribe",
            SubAction::Unsubscribe => "unsubscribe",
        }
    }
}

/// A demand change relayed to the external market-data connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubCommand {
    pub kind: SubKind,
    pub action: SubAction,
    pub symbol: String,
}

#[derive(Default)]
struct Inner {
    list_subscribers: HashMap<String, HashSet<ConnId>>,
    /// symbol -> lists currently containing it (scanner-driven demand).
    symbol_lists: HashMap<String, HashSet<String>>,
    /// list -> symbols, kept to diff snapshots and to purge deleted lists.
    list_symbols: HashMap<String, HashSet<String>>,
    quote_subscribers: HashMap<String, HashSet<ConnId>>,
    chart_subscribers: HashMap<String, HashSet<ConnId>>,
}

pub struct SubscriptionIndex {
    inner: Mutex<Inner>,
    commands: mpsc::UnboundedSender<SubCommand>,
}

impl SubscriptionIndex {
    pub fn new(commands: mpsc::UnboundedSender<SubCommand>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            commands,
        }
    }

    fn publish(&self, kind: SubKind, action: SubAction, symbol: &str) {
        // Send failures only happen during shutdown, when the publisher task
        // is already gone.
        let _ = self.commands.send(SubCommand {
            kind,
            action,
            symbol: symbol.to_string(),
        });
    }

    // --- list subscriptions -------------------------------------------------

    pub fn add_list_subscriber(&self, list: &str, conn: ConnId) {
        let mut inner = self.inner.lock().expect("index lock poisoned");
        inner
            .list_subscribers
            .entry(list.to_string())
            .or_default()
            .insert(conn);
    }

    pub fn remove_list_subscriber(&self, list: &str, conn: ConnId) {
        let mut inner = self.inner.lock().expect("index lock poisoned");
        let emptied = match inner.list_subscribers.get_mut(list) {
            Some(subs) => {
                subs.remove(&conn);
                subs.is_empty()
            }
            None => false,
        };
        if emptied {
            inner.list_subscribers.remove(list);
        }
    }

    pub fn list_subscribers(&self, list: &str) -> Vec<ConnId> {
        let inner = self.inner.lock().expect("index lock poisoned");
        inner
            .list_subscribers
            .get(list)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    // --- quote ref-counts ---------------------------------------------------

    pub fn subscribe_quote(&self, symbol: &str, conn: ConnId) {
        let mut inner = self.inner.lock().expect("index lock poisoned");
        let subs = inner
            .quote_subscribers
            .entry(symbol.to_string())
            .or_default();
        if subs.insert(conn) && subs.len() == 1 {
            self.publish(SubKind::Quote, SubAction::Subscribe, symbol);
        }
    }

    pub fn unsubscribe_quote(&self, symbol: &str, conn: ConnId) {
        let mut inner = self.inner.lock().expect("index lock poisoned");
        let emptied = match inner.quote_subscribers.get_mut(symbol) {
            Some(subs) => subs.remove(&conn) && subs.is_empty(),
            None => false,
        };
        if emptied {
            inner.quote_subscribers.remove(symbol);
            self.publish(SubKind::Quote, SubAction::Unsubscribe, symbol);
        }
    }

    pub fn quote_subscribers(&self, symbol: &str) -> Vec<ConnId> {
        let inner = self.inner.lock().expect("index lock poisoned");
        inner
            .quote_subscribers
            .get(symbol)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    // --- chart ref-counts ---------------------------------------------------

    // Chart demand shares the connector's aggregate feed with the scanner,
    // and the scanner owns it: while a symbol sits in any list, the gateway
    // must not publish subscription commands for it in either direction.

    pub fn subscribe_chart(&self, symbol: &str, conn: ConnId) {
        let mut inner = self.inner.lock().expect("index lock poisoned");
        let scanner_held = inner.symbol_lists.contains_key(symbol);
        let subs = inner
            .chart_subscribers
            .entry(symbol.to_string())
            .or_default();
        if subs.insert(conn) && subs.len() == 1 && !scanner_held {
            self.publish(SubKind::Chart, SubAction::Subscribe, symbol);
        }
    }

    pub fn unsubscribe_chart(&self, symbol: &str, conn: ConnId) {
        let mut inner = self.inner.lock().expect("index lock poisoned");
        let scanner_held = inner.symbol_lists.contains_key(symbol);
        let emptied = match inner.chart_subscribers.get_mut(symbol) {
            Some(subs) => subs.remove(&conn) && subs.is_empty(),
            None => false,
        };
        if emptied {
            inner.chart_subscribers.remove(symbol);
            if !scanner_held {
                self.publish(SubKind::Chart, SubAction::Unsubscribe, symbol);
            }
        }
    }

    pub fn chart_subscribers(&self, symbol: &str) -> Vec<ConnId> {
        let inner = self.inner.lock().expect("index lock poisoned");
        inner
            .chart_subscribers
            .get(symbol)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    // --- symbol -> lists ----------------------------------------------------

    /// Replaces the symbol set of a list after a full snapshot, diffing the
    /// previous membership.
    pub fn set_list_symbols(&self, list: &str, symbols: HashSet<String>) {
        let mut inner = self.inner.lock().expect("index lock poisoned");
        let old = inner
            .list_symbols
            .insert(list.to_string(), symbols.clone())
            .unwrap_or_default();

        for gone in old.difference(&symbols) {
            remove_symbol_from_list(&mut inner, gone, list);
        }
        for added in symbols.difference(&old) {
            inner
                .symbol_lists
                .entry(added.clone())
                .or_default()
                .insert(list.to_string());
        }
    }

    /// Applies one delta entry to the symbol index.
    pub fn apply_delta_op(&self, list: &str, op: &DeltaOp) {
        let mut inner = self.inner.lock().expect("index lock poisoned");
        let symbol = op.symbol().to_string();
        if op.is_removal() {
            if let Some(symbols) = inner.list_symbols.get_mut(list) {
                symbols.remove(&symbol);
            }
            remove_symbol_from_list(&mut inner, &symbol, list);
        } else {
            inner
                .list_symbols
                .entry(list.to_string())
                .or_default()
                .insert(symbol.clone());
            inner
                .symbol_lists
                .entry(symbol)
                .or_default()
                .insert(list.to_string());
        }
    }

    /// Lists currently containing the symbol (sampler routing).
    pub fn lists_for_symbol(&self, symbol: &str) -> Vec<String> {
        let inner = self.inner.lock().expect("index lock poisoned");
        inner
            .symbol_lists
            .get(symbol)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes a list entirely: its subscriber set, its symbol memberships,
    /// and any symbol that belonged to no other list. Used when a user scan
    /// is deleted.
    pub fn purge_list(&self, list: &str) {
        let mut inner = self.inner.lock().expect("index lock poisoned");
        inner.list_subscribers.remove(list);
        if let Some(symbols) = inner.list_symbols.remove(list) {
            for symbol in symbols {
                remove_symbol_from_list(&mut inner, &symbol, list);
            }
        }
    }
}

fn remove_symbol_from_list(inner: &mut Inner, symbol: &str, list: &str) {
    if let Some(lists) = inner.symbol_lists.get_mut(symbol) {
        lists.remove(list);
        if lists.is_empty() {
            inner.symbol_lists.remove(symbol);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn index() -> (SubscriptionIndex, mpsc::UnboundedReceiver<SubCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SubscriptionIndex::new(tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SubCommand>) -> Vec<SubCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            out.push(cmd);
        }
        out
    }

    #[test]
    fn quote_refcount_drives_upstream_edges() {
        // Scenario: c1 subscribes (0->1), c2 subscribes (1->2), c1 leaves
        // (2->1), c2 leaves (1->0). Exactly one subscribe and one
        // unsubscribe reach the connector, in that order.
        let (index, mut rx) = index();
        index.subscribe_quote("XYZ", 1);
        index.subscribe_quote("XYZ", 2);
        index.unsubscribe_quote("XYZ", 1);
        index.unsubscribe_quote("XYZ", 2);

        let commands = drain(&mut rx);
        assert_eq!(
            commands,
            vec![
                SubCommand {
                    kind: SubKind::Quote,
                    action: SubAction::Subscribe,
                    symbol: "XYZ".into()
                },
                SubCommand {
                    kind: SubKind::Quote,
                    action: SubAction::Unsubscribe,
                    symbol: "XYZ".into()
                },
            ]
        );
    }

    #[test]
    fn duplicate_subscribe_does_not_inflate_refcount() {
        let (index, mut rx) = index();
        index.subscribe_quote("XYZ", 1);
        index.subscribe_quote("XYZ", 1);
        index.unsubscribe_quote("XYZ", 1);
        let commands = drain(&mut rx);
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1].action, SubAction::Unsubscribe);
        assert!(index.quote_subscribers("XYZ").is_empty());
    }

    #[test]
    fn chart_commands_suppressed_while_scanner_holds_symbol() {
        let (index, mut rx) = index();
        index.set_list_symbols("gappers_up", ["AAPL".to_string()].into_iter().collect());

        index.subscribe_chart("AAPL", 1);
        index.unsubscribe_chart("AAPL", 1);
        assert!(drain(&mut rx).is_empty());

        // A symbol the scanner does not hold publishes both edges.
        index.subscribe_chart("MSFT", 1);
        index.unsubscribe_chart("MSFT", 1);
        let commands = drain(&mut rx);
        assert_eq!(commands.len(), 2);
        assert!(commands.iter().all(|c| c.kind == SubKind::Chart));
    }

    #[test]
    fn snapshot_diff_updates_symbol_lists() {
        let (index, _rx) = index();
        index.set_list_symbols(
            "gappers_up",
            ["AAPL", "TSLA"].iter().map(|s| s.to_string()).collect(),
        );
        index.set_list_symbols(
            "momentum_up",
            ["TSLA"].iter().map(|s| s.to_string()).collect(),
        );
        assert_eq!(index.lists_for_symbol("TSLA").len(), 2);

        // TSLA drops out of gappers_up on the next snapshot.
        index.set_list_symbols(
            "gappers_up",
            ["AAPL", "NVDA"].iter().map(|s| s.to_string()).collect(),
        );
        assert_eq!(index.lists_for_symbol("TSLA"), vec!["momentum_up"]);
        assert!(!index.lists_for_symbol("NVDA").is_empty());
    }

    #[test]
    fn delta_ops_maintain_symbol_index() {
        let (index, _rx) = index();
        index.set_list_symbols(
            "gappers_up",
            ["AAPL", "NVDA"].iter().map(|s| s.to_string()).collect(),
        );

        index.apply_delta_op(
            "gappers_up",
            &DeltaOp::Remove {
                symbol: "NVDA".into(),
            },
        );
        assert!(index.lists_for_symbol("NVDA").is_empty());

        index.apply_delta_op(
            "gappers_up",
            &DeltaOp::Add {
                symbol: "AMD".into(),
                row: None,
                rank: Some(2),
            },
        );
        assert_eq!(index.lists_for_symbol("AMD"), vec!["gappers_up"]);

        // Rerank and update keep membership intact.
        index.apply_delta_op(
            "gappers_up",
            &DeltaOp::Rerank {
                symbol: "AAPL".into(),
                rank: 0,
            },
        );
        assert!(!index.lists_for_symbol("AAPL").is_empty());
    }

    #[test]
    fn purge_list_erases_orphan_symbols() {
        let (index, _rx) = index();
        index.add_list_subscriber("uscan_42", 7);
        index.set_list_symbols(
            "uscan_42",
            ["AAPL", "TSLA"].iter().map(|s| s.to_string()).collect(),
        );
        index.set_list_symbols(
            "gappers_up",
            ["AAPL"].iter().map(|s| s.to_string()).collect(),
        );

        index.purge_list("uscan_42");
        assert!(index.list_subscribers("uscan_42").is_empty());
        // TSLA belonged to no other list and is gone; AAPL survives via
        // gappers_up.
        assert!(index.lists_for_symbol("TSLA").is_empty());
        assert_eq!(index.lists_for_symbol("AAPL"), vec!["gappers_up"]);
    }
}
