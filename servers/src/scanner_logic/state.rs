//! Shared application state and the subscription operations driven by the
//! per-connection inbound handlers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lib_common::{now_iso8601, CacheHandler};
use redis::AsyncCommands;
use tokio::sync::mpsc;

use crate::scanner_logic::auth::Authenticator;
use crate::scanner_logic::catalyst::LastTradeTable;
use crate::scanner_logic::config::Config;
use crate::scanner_logic::index::{SubCommand, SubscriptionIndex};
use crate::scanner_logic::model::ServerEvent;
use crate::scanner_logic::registry::{ConnHandle, ConnId, ConnectionRegistry};
use crate::scanner_logic::sampler::AggregateSampler;
use crate::scanner_logic::snapshot::{self, ListCache};

/// Lists with this prefix are owned by a single user and require an
/// ownership check on subscribe.
pub const USER_SCAN_PREFIX: &str = "uscan_";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub redis: CacheHandler,
    pub registry: Arc<ConnectionRegistry>,
    pub index: Arc<SubscriptionIndex>,
    pub lists: Arc<ListCache>,
    /// scan_id -> owning user id, filled lazily from Redis and maintained by
    /// the pub/sub listener.
    pub owners: Arc<Mutex<HashMap<String, String>>>,
    pub auth: Arc<Authenticator>,
    pub sampler: Arc<AggregateSampler>,
    pub trades: Arc<LastTradeTable>,
}

impl AppState {
    pub fn new(
        config: Config,
        redis: CacheHandler,
        commands: mpsc::UnboundedSender<SubCommand>,
    ) -> Self {
        let auth = Authenticator::new(&config);
        let sampler = AggregateSampler::new(
            config.sampler_capacity,
            Duration::from_millis(config.throttle_ms),
        );
        Self {
            config: Arc::new(config),
            redis,
            registry: Arc::new(ConnectionRegistry::new()),
            index: Arc::new(SubscriptionIndex::new(commands)),
            lists: Arc::new(ListCache::new(Duration::from_secs(300))),
            owners: Arc::new(Mutex::new(HashMap::new())),
            auth: Arc::new(auth),
            sampler: Arc::new(sampler),
            trades: Arc::new(LastTradeTable::new()),
        }
    }

    // --- delivery ----------------------------------------------------------

    /// Queues an event for one connection, tearing it down on queue overflow.
    pub fn send_to(&self, conn: &ConnHandle, event: &ServerEvent) {
        if !conn.push(event) {
            self.disconnect(conn.id);
        }
    }

    /// Serializes once and fans the frame out to every open connection.
    pub fn broadcast_all(&self, event: &ServerEvent) {
        let Some(frame) = event.to_frame() else { return };
        let mut failed = Vec::new();
        for handle in self.registry.handles() {
            if !handle.push_frame(frame.clone()) {
                failed.push(handle.id);
            }
        }
        for id in failed {
            self.disconnect(id);
        }
    }

    /// Idempotent close cleanup: removes the connection from the registry,
    /// every index it appears in, and every ref-count it contributed to
    /// (publishing upstream unsubscribes where counts hit zero).
    pub fn disconnect(&self, id: ConnId) {
        let Some(handle) = self.registry.remove(id) else {
            return;
        };
        let lists: Vec<String> = handle
            .lists
            .lock()
            .expect("lists lock poisoned")
            .keys()
            .cloned()
            .collect();
        for list in lists {
            self.index.remove_list_subscriber(&list, id);
        }
        let quotes: Vec<String> = handle
            .quotes
            .lock()
            .expect("quotes lock poisoned")
            .drain()
            .collect();
        for symbol in quotes {
            self.index.unsubscribe_quote(&symbol, id);
        }
        let charts: Vec<String> = handle
            .charts
            .lock()
            .expect("charts lock poisoned")
            .drain()
            .collect();
        for symbol in charts {
            self.index.unsubscribe_chart(&symbol, id);
        }
        handle.notify_closed();
        log::info!("Client {} disconnected", id);
    }

    // --- list subscriptions -------------------------------------------------

    pub async fn subscribe_list(&self, conn: &Arc<ConnHandle>, list: &str) -> Result<(), String> {
        if list.starts_with(USER_SCAN_PREFIX) {
            self.authorize_scan(list, conn.subject().as_deref()).await?;
        }

        let snap = match snapshot::load(self, list).await {
            Ok(snap) => snap,
            Err(e) => {
                log::warn!("Failed to load snapshot for {}: {}", list, e);
                return Err("Failed to load list snapshot".to_string());
            }
        };

        // The ack and the initial snapshot are queued while the sequence map
        // lock is held so a racing delta broadcast cannot slip in between.
        let delivered = {
            let mut lists = conn.lists.lock().expect("lists lock poisoned");
            self.index.add_list_subscriber(list, conn.id);
            lists.insert(list.to_string(), snap.sequence);
            conn.push(&ServerEvent::SubscribedList {
                list: list.to_string(),
                timestamp: now_iso8601(),
            }) && conn.push(&ServerEvent::Snapshot {
                list: list.to_string(),
                sequence: snap.sequence,
                rows: (*snap.rows).clone(),
                timestamp: now_iso8601(),
            })
        };
        if !delivered {
            self.disconnect(conn.id);
        }
        Ok(())
    }

    pub fn unsubscribe_list(&self, conn: &Arc<ConnHandle>, list: &str) {
        conn.lists.lock().expect("lists lock poisoned").remove(list);
        self.index.remove_list_subscriber(list, conn.id);
        self.send_to(
            conn,
            &ServerEvent::UnsubscribedList {
                list: list.to_string(),
                timestamp: now_iso8601(),
            },
        );
    }

    /// Resends the current snapshot for a list the client already holds.
    pub async fn resync_list(&self, conn: &Arc<ConnHandle>, list: &str) -> Result<(), String> {
        let snap = match snapshot::load(self, list).await {
            Ok(snap) => snap,
            Err(e) => {
                log::warn!("Failed to resync {}: {}", list, e);
                return Err("Failed to load list snapshot".to_string());
            }
        };
        let delivered = {
            let mut lists = conn.lists.lock().expect("lists lock poisoned");
            match lists.get_mut(list) {
                Some(last) => {
                    *last = (*last).max(snap.sequence);
                    conn.push(&ServerEvent::Snapshot {
                        list: list.to_string(),
                        sequence: snap.sequence,
                        rows: (*snap.rows).clone(),
                        timestamp: now_iso8601(),
                    })
                }
                // Resync on a list the client never subscribed to is a no-op.
                None => true,
            }
        };
        if !delivered {
            self.disconnect(conn.id);
        }
        Ok(())
    }

    // --- quote and chart subscriptions -------------------------------------

    pub fn subscribe_quotes(&self, conn: &Arc<ConnHandle>, symbols: Vec<String>) {
        for symbol in symbols {
            let added = conn
                .quotes
                .lock()
                .expect("quotes lock poisoned")
                .insert(symbol.clone());
            if added {
                self.index.subscribe_quote(&symbol, conn.id);
            }
        }
    }

    pub fn unsubscribe_quotes(&self, conn: &Arc<ConnHandle>, symbols: Vec<String>) {
        for symbol in symbols {
            let removed = conn
                .quotes
                .lock()
                .expect("quotes lock poisoned")
                .remove(&symbol);
            if removed {
                self.index.unsubscribe_quote(&symbol, conn.id);
            }
        }
    }

    pub fn subscribe_chart(&self, conn: &Arc<ConnHandle>, symbol: &str) {
        let added = conn
            .charts
            .lock()
            .expect("charts lock poisoned")
            .insert(symbol.to_string());
        if added {
            self.index.subscribe_chart(symbol, conn.id);
        }
    }

    pub fn unsubscribe_chart(&self, conn: &Arc<ConnHandle>, symbol: &str) {
        let removed = conn
            .charts
            .lock()
            .expect("charts lock poisoned")
            .remove(symbol);
        if removed {
            self.index.unsubscribe_chart(symbol, conn.id);
        }
    }

    // --- user-scan authorization -------------------------------------------

    /// Owner-only rule for `uscan_` lists. Skipped entirely when
    /// authentication is disabled.
    pub async fn authorize_scan(
        &self,
        list: &str,
        subject: Option<&str>,
    ) -> Result<(), String> {
        if !self.auth.enabled() {
            return Ok(());
        }
        let scan_id = list.trim_start_matches(USER_SCAN_PREFIX).to_string();
        let Some(subject) = subject else {
            return Err("Not authorized to view this scan".to_string());
        };

        let cached = self
            .owners
            .lock()
            .expect("owners lock poisoned")
            .get(&scan_id)
            .cloned();
        let owner = match cached {
            Some(owner) => owner,
            None => {
                let mut conn = self.redis.commands();
                let owner: Option<String> = conn
                    .get(format!("user_scan:owner:{}", scan_id))
                    .await
                    .map_err(|e| {
                        log::warn!("Failed to read scan owner for {}: {}", scan_id, e);
                        "Failed to verify scan ownership".to_string()
                    })?;
                match owner.filter(|o| !o.is_empty()) {
                    Some(owner) => {
                        self.owners
                            .lock()
                            .expect("owners lock poisoned")
                            .insert(scan_id.clone(), owner.clone());
                        owner
                    }
                    None => return Err("Scan not found".to_string()),
                }
            }
        };

        if owner == subject {
            Ok(())
        } else {
            Err("Not authorized to view this scan".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // AppState construction needs a live Redis connection, so these tests
    // exercise the pieces that stand alone.

    #[test]
    fn user_scan_prefix_matches_wire_names() {
        assert!("uscan_42".starts_with(USER_SCAN_PREFIX));
        assert!(!"gappers_up".starts_with(USER_SCAN_PREFIX));
    }
}
