//! Per-connection state and the registry owning it.
//!
//! Each connection has exactly one inbound handler task and one outbound
//! writer task; everything else talks to it through the bounded frame queue
//! held here. Frames are pre-serialized `Arc<str>` so a broadcast serializes
//! once and fans the same bytes out to every subscriber.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};

use crate::scanner_logic::model::ServerEvent;

pub type ConnId = u64;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Normal close, sent when the server tears a connection down on purpose.
pub const CLOSE_NORMAL: u16 = 1000;
/// Server-side failure close, also used for slow consumers.
pub const CLOSE_SERVER_ERROR: u16 = 1011;

pub struct ConnHandle {
    pub id: ConnId,
    frames: mpsc::Sender<Arc<str>>,
    /// Authenticated subject; `None` while authentication is disabled.
    /// Replaced atomically by `refresh_token`.
    subject: Mutex<Option<String>>,
    /// Subscribed lists mapped to the last sequence delivered on this socket.
    pub lists: Mutex<HashMap<String, u64>>,
    pub quotes: Mutex<HashSet<String>>,
    pub charts: Mutex<HashSet<String>>,
    pub news: AtomicBool,
    pub filings: AtomicBool,
    /// Shared with the writer task, which must not hold the whole handle:
    /// that would keep the frame sender alive and the queue would never
    /// drain closed.
    close_code: Arc<AtomicU16>,
    /// Wakes the inbound handler when the server tears the connection down
    /// while the client is silent.
    closed: Notify,
}

impl ConnHandle {
    /// Queues a pre-serialized frame. Returns `false` when the queue is full
    /// (slow consumer) or the writer is gone; the caller is expected to tear
    /// the connection down.
    pub fn push_frame(&self, frame: Arc<str>) -> bool {
        match self.frames.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Client {} outbound queue overflow", self.id);
                self.close_code.store(CLOSE_SERVER_ERROR, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Serializes and queues a single-recipient event.
    pub fn push(&self, event: &ServerEvent) -> bool {
        match event.to_frame() {
            Some(frame) => self.push_frame(frame),
            None => true,
        }
    }

    pub fn subject(&self) -> Option<String> {
        self.subject.lock().expect("subject lock poisoned").clone()
    }

    pub fn set_subject(&self, subject: Option<String>) {
        *self.subject.lock().expect("subject lock poisoned") = subject;
    }

    /// The close-code cell alone, for the writer task.
    pub fn close_signal(&self) -> Arc<AtomicU16> {
        self.close_code.clone()
    }

    /// Signals the inbound handler that the connection is gone. `notify_one`
    /// stores a permit, so a handler that is not currently waiting still
    /// observes the close on its next check.
    pub fn notify_closed(&self) {
        self.closed.notify_one();
    }

    pub async fn wait_closed(&self) {
        self.closed.notified().await;
    }
}

pub struct ConnectionRegistry {
    conns: Mutex<HashMap<ConnId, Arc<ConnHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a connection record and returns the receiving half of its
    /// outbound queue for the writer task.
    pub fn register(
        &self,
        subject: Option<String>,
        queue_limit: usize,
    ) -> (Arc<ConnHandle>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(queue_limit.max(1));
        let handle = Arc::new(ConnHandle {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            frames: tx,
            subject: Mutex::new(subject),
            lists: Mutex::new(HashMap::new()),
            quotes: Mutex::new(HashSet::new()),
            charts: Mutex::new(HashSet::new()),
            news: AtomicBool::new(false),
            filings: AtomicBool::new(false),
            close_code: Arc::new(AtomicU16::new(CLOSE_NORMAL)),
            closed: Notify::new(),
        });
        let mut conns = self.conns.lock().expect("registry lock poisoned");
        conns.insert(handle.id, handle.clone());
        (handle, rx)
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<ConnHandle>> {
        self.conns
            .lock()
            .expect("registry lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Removes the record. Returns `None` on repeat calls, which makes the
    /// close-cleanup path idempotent.
    pub fn remove(&self, id: ConnId) -> Option<Arc<ConnHandle>> {
        self.conns
            .lock()
            .expect("registry lock poisoned")
            .remove(&id)
    }

    /// Snapshot of every live connection, for broadcast paths.
    pub fn handles(&self) -> Vec<Arc<ConnHandle>> {
        self.conns
            .lock()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.conns.lock().expect("registry lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_idempotent_remove() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = registry.register(Some("user_a".into()), 8);
        assert_eq!(registry.len(), 1);
        assert_eq!(handle.subject().as_deref(), Some("user_a"));

        assert!(registry.remove(handle.id).is_some());
        assert!(registry.remove(handle.id).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn queue_overflow_reports_slow_consumer() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = registry.register(None, 2);
        let frame: Arc<str> = Arc::from("{}");
        assert!(handle.push_frame(frame.clone()));
        assert!(handle.push_frame(frame.clone()));
        // Third frame exceeds the bound: dropped, and the close code flips
        // to the server-error policy for the writer to use.
        assert!(!handle.push_frame(frame));
        assert_eq!(
            handle.close_signal().load(Ordering::Relaxed),
            CLOSE_SERVER_ERROR
        );
    }

    #[test]
    fn push_fails_after_receiver_drops() {
        let registry = ConnectionRegistry::new();
        let (handle, rx) = registry.register(None, 2);
        drop(rx);
        assert!(!handle.push_frame(Arc::from("{}")));
    }

    #[test]
    fn refresh_replaces_subject() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = registry.register(Some("user_a".into()), 2);
        handle.set_subject(Some("user_b".into()));
        assert_eq!(handle.subject().as_deref(), Some("user_b"));
    }
}
