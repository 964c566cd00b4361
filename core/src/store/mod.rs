// Store module — history persistence and duplicate suppression

pub mod backend;
pub mod history;

pub use backend::{MemoryStorage, SledStorage, StorageBackend};
pub use history::{HistoryStore, DEFAULT_CAPACITY, DEFAULT_DEDUP_WINDOW, HISTORY_KEY};
