// History — the bounded, durable log of accepted messages that drives
// duplicate suppression.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use super::backend::StorageBackend;
use crate::message::{Message, StoredMessage, StoredRecord};

/// Storage key for the persisted history list
pub const HISTORY_KEY: &[u8] = b"vuelink_saved_messages_json";

/// Default bounded history length
pub const DEFAULT_CAPACITY: usize = 50;

/// Default number of recent entries scanned by the duplicate check
pub const DEFAULT_DEDUP_WINDOW: usize = 10;

/// Bounded, time-ordered log of accepted messages.
///
/// Newest entries sit at the front. The log is mirrored to the backend on
/// every mutation as a JSON array whose elements are parsed independently
/// on load, so a corrupt entry is skipped rather than wiping the log.
#[derive(Clone)]
pub struct HistoryStore {
    backend: Arc<dyn StorageBackend>,
    entries: Arc<RwLock<VecDeque<StoredMessage>>>,
    capacity: usize,
    dedup_window: usize,
}

impl HistoryStore {
    pub fn new(backend: Arc<dyn StorageBackend>, capacity: usize, dedup_window: usize) -> Self {
        let store = Self {
            backend,
            entries: Arc::new(RwLock::new(VecDeque::new())),
            capacity,
            dedup_window,
        };
        store.load();
        store
    }

    fn load(&self) {
        let bytes = match self.backend.get(HISTORY_KEY) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(error = %e, "history load failed, starting empty");
                return;
            }
        };
        let values: Vec<serde_json::Value> = match serde_json::from_slice(&bytes) {
            Ok(values) => values,
            Err(e) => {
                tracing::error!(error = %e, "history list unreadable, starting empty");
                return;
            }
        };
        let mut entries = self.entries.write();
        for value in values {
            let stored = serde_json::from_value::<StoredRecord>(value)
                .map_err(|e| e.to_string())
                .and_then(StoredRecord::into_stored);
            match stored {
                Ok(stored) => entries.push_back(stored),
                Err(e) => tracing::warn!(error = %e, "corrupt history entry skipped"),
            }
        }
        entries.truncate(self.capacity);
        tracing::info!(entries = entries.len(), "history loaded");
    }

    fn persist(&self, entries: &VecDeque<StoredMessage>) {
        let records: Vec<StoredRecord> = entries.iter().map(StoredRecord::from).collect();
        let bytes = match serde_json::to_vec(&records) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "history serialization failed");
                return;
            }
        };
        if let Err(e) = self
            .backend
            .put(HISTORY_KEY, &bytes)
            .and_then(|_| self.backend.flush())
        {
            tracing::error!(error = %e, "history persist failed");
        }
    }

    /// Accept policy over the most recent entries.
    ///
    /// A novel payload is always accepted. A duplicate is accepted only if
    /// it carries the repeat flag and no equivalent history entry does —
    /// one retransmission may re-enter circulation, an already-repeated
    /// message may not loop again.
    pub fn accept(&self, message: &Message) -> bool {
        let entries = self.entries.read();
        let mut dup = false;
        let mut dup_with_repeat = false;
        for stored in entries.iter().take(self.dedup_window) {
            if stored.message.content_eq(message) {
                dup = true;
                if stored.message.repeat() {
                    dup_with_repeat = true;
                }
            }
        }
        !dup || (message.repeat() && !dup_with_repeat)
    }

    /// Append an accepted message at the head, evicting the oldest entry
    /// past capacity, and mirror the log to storage.
    pub fn record(&self, message: Message) -> StoredMessage {
        let stored = StoredMessage::new(message, Utc::now());
        let mut entries = self.entries.write();
        entries.push_front(stored.clone());
        entries.truncate(self.capacity);
        self.persist(&entries);
        stored
    }

    /// Stored messages, newest first
    pub fn list(&self) -> Vec<StoredMessage> {
        self.entries.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Remove the in-memory log and its persisted mirror.
    pub fn clear(&self) {
        let mut entries = self.entries.write();
        entries.clear();
        if let Err(e) = self
            .backend
            .remove(HISTORY_KEY)
            .and_then(|_| self.backend.flush())
        {
            tracing::error!(error = %e, "history clear failed to reach storage");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Priority;
    use crate::store::backend::{MemoryStorage, SledStorage};

    fn memory_store() -> HistoryStore {
        HistoryStore::new(
            Arc::new(MemoryStorage::new()),
            DEFAULT_CAPACITY,
            DEFAULT_DEDUP_WINDOW,
        )
    }

    #[test]
    fn test_novel_message_accepted_and_heads_history() {
        let store = memory_store();
        let msg = Message::text("gate change B4", false, Priority::Medium);
        assert!(store.accept(&msg));
        store.record(msg.clone());
        assert_eq!(store.len(), 1);
        assert_eq!(store.list()[0].message, msg);
    }

    #[test]
    fn test_duplicate_rejected() {
        let store = memory_store();
        let msg = Message::text("duplicate me", false, Priority::Medium);
        store.record(msg.clone());
        assert!(!store.accept(&msg));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_repeat_reenters_once() {
        let store = memory_store();
        let msg = Message::text("say again", false, Priority::Medium);
        store.record(msg.clone());

        // Same content with the repeat flag: accepted once
        let repeated = msg.with_repeat(true);
        assert!(store.accept(&repeated));
        store.record(repeated.clone());
        assert_eq!(store.len(), 2);

        // A second identical repeat is suppressed
        assert!(!store.accept(&repeated));
    }

    #[test]
    fn test_repeated_entry_blocks_looping() {
        let store = memory_store();
        let msg = Message::text("loop guard", true, Priority::Medium);
        store.record(msg.clone());
        assert!(!store.accept(&msg));
    }

    #[test]
    fn test_accept_only_scans_recent_window() {
        let store = memory_store();
        let old = Message::text("old news", false, Priority::Medium);
        store.record(old.clone());
        for i in 0..DEFAULT_DEDUP_WINDOW {
            store.record(Message::text(format!("filler {i}"), false, Priority::Low));
        }
        // The equivalent entry fell outside the 10-entry window
        assert!(store.accept(&old));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let store = memory_store();
        let first = Message::text("first in", false, Priority::Low);
        store.record(first.clone());
        for i in 0..DEFAULT_CAPACITY {
            store.record(Message::text(format!("msg {i}"), false, Priority::Low));
        }
        assert_eq!(store.len(), DEFAULT_CAPACITY);
        assert!(!store.list().iter().any(|s| s.message.content_eq(&first)));
    }

    #[test]
    fn test_clear_wipes_memory_and_storage() {
        let backend = Arc::new(MemoryStorage::new());
        let store = HistoryStore::new(backend.clone(), DEFAULT_CAPACITY, DEFAULT_DEDUP_WINDOW);
        store.record(Message::text("wipe me", false, Priority::Low));
        assert!(backend.get(HISTORY_KEY).unwrap().is_some());

        store.clear();
        assert!(store.is_empty());
        assert!(backend.get(HISTORY_KEY).unwrap().is_none());
    }

    #[test]
    fn test_history_survives_reload() {
        let backend = Arc::new(MemoryStorage::new());
        {
            let store =
                HistoryStore::new(backend.clone(), DEFAULT_CAPACITY, DEFAULT_DEDUP_WINDOW);
            store.record(Message::text("older", false, Priority::Low));
            store.record(Message::flight_update(
                "FL12",
                crate::message::FlightUpdateType::Boarding,
                true,
                Priority::High,
            ));
        }
        let reloaded = HistoryStore::new(backend, DEFAULT_CAPACITY, DEFAULT_DEDUP_WINDOW);
        let list = reloaded.list();
        assert_eq!(list.len(), 2);
        // Order preserved: newest first
        assert_eq!(
            list[0].message.message_type(),
            crate::message::MessageType::FlightUpdate
        );
        // Dedup still sees the reloaded entries
        assert!(!reloaded.accept(&Message::text("older", false, Priority::Low)));
    }

    #[test]
    fn test_history_survives_restart_on_sled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_string_lossy().to_string();
        {
            let backend = Arc::new(SledStorage::open(&path).unwrap());
            let store = HistoryStore::new(backend, DEFAULT_CAPACITY, DEFAULT_DEDUP_WINDOW);
            store.record(Message::text("durable", true, Priority::Urgent));
        }
        let backend = Arc::new(SledStorage::open(&path).unwrap());
        let reloaded = HistoryStore::new(backend, DEFAULT_CAPACITY, DEFAULT_DEDUP_WINDOW);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(
            reloaded.list()[0].message,
            Message::text("durable", true, Priority::Urgent)
        );
    }

    #[test]
    fn test_corrupt_entry_skipped_on_load() {
        let backend = Arc::new(MemoryStorage::new());
        let good = serde_json::to_value(StoredRecord::from(&StoredMessage::new(
            Message::text("still here", false, Priority::Low),
            Utc::now(),
        )))
        .unwrap();
        let corrupt = serde_json::json!({ "messageType": "notAType" });
        let list = serde_json::to_vec(&vec![good, corrupt]).unwrap();
        backend.put(HISTORY_KEY, &list).unwrap();

        let store = HistoryStore::new(backend, DEFAULT_CAPACITY, DEFAULT_DEDUP_WINDOW);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.list()[0].message,
            Message::text("still here", false, Priority::Low)
        );
    }

    #[test]
    fn test_unreadable_list_starts_empty() {
        let backend = Arc::new(MemoryStorage::new());
        backend.put(HISTORY_KEY, b"{not json").unwrap();
        let store = HistoryStore::new(backend, DEFAULT_CAPACITY, DEFAULT_DEDUP_WINDOW);
        assert!(store.is_empty());
    }
}
