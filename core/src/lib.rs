// Vuelink Core — advertisement-only BLE mesh for flight operations
//
// No connections, no sessions: every message rides as manufacturer data
// inside short BLE advertisements, hopping device to device until each
// hop's history suppresses it. Best-effort broadcast, nothing more.

pub mod adapter;
pub mod advertiser;
pub mod config;
pub mod message;
pub mod pipeline;
pub mod reassembly;
pub mod snapshot;
pub mod store;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, watch};

pub use adapter::{
    AdapterState, AdvertisementEvent, BleAdapter, LoopbackAdapter, LoopbackBus, ManufacturerRecord,
};
pub use advertiser::{AdvertiseSequencer, SequencerState};
pub use config::{ConfigError, VuelinkConfig};
pub use message::{
    CodecError, FlightUpdateType, Message, MessageType, Priority, StoredMessage,
};
pub use pipeline::ReceivedMessage;
pub use snapshot::{SnapshotEntry, SnapshotError};
pub use store::{HistoryStore, MemoryStorage, SledStorage, StorageBackend};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum VuelinkError {
    #[error("bluetooth permission denied")]
    PermissionDenied,

    #[error("adapter refused the operation")]
    AdapterRefused,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("storage error: {0}")]
    Storage(String),
}

// ============================================================================
// CORE HANDLE
// ============================================================================

/// One Vuelink node: outbound sequencing, inbound pipeline, history.
///
/// The platform hands in a [`BleAdapter`]; the host drives this handle.
/// History is an injected store, not a hidden global, so nodes compose
/// freely in tests and multi-node processes.
pub struct Vuelink {
    adapter: Arc<dyn BleAdapter>,
    history: HistoryStore,
    sequencer: Arc<AdvertiseSequencer>,
    pipeline: pipeline::ScannerPipeline,
    forwarding_enabled: Arc<AtomicBool>,
    /// None until the platform has been probed; then the cached verdict
    permission: Mutex<Option<bool>>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

impl Vuelink {
    /// Node with in-memory history.
    pub fn new(adapter: Arc<dyn BleAdapter>, config: VuelinkConfig) -> Result<Self, VuelinkError> {
        Self::with_backend(adapter, config, Arc::new(MemoryStorage::new()))
    }

    /// Node with sled-backed history at `path`, durable across restarts.
    pub fn with_storage(
        adapter: Arc<dyn BleAdapter>,
        config: VuelinkConfig,
        path: &str,
    ) -> Result<Self, VuelinkError> {
        let backend = SledStorage::open(path).map_err(VuelinkError::Storage)?;
        Self::with_backend(adapter, config, Arc::new(backend))
    }

    /// Node with a caller-provided storage backend.
    pub fn with_backend(
        adapter: Arc<dyn BleAdapter>,
        config: VuelinkConfig,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Self, VuelinkError> {
        init_tracing();
        config.validate()?;
        let history = HistoryStore::new(backend, config.history_capacity, config.dedup_window);
        let forwarding_enabled = Arc::new(AtomicBool::new(true));
        let sequencer = Arc::new(AdvertiseSequencer::new(
            Arc::clone(&adapter),
            config.clone(),
        ));
        let pipeline = pipeline::ScannerPipeline::new(
            Arc::clone(&adapter),
            config,
            history.clone(),
            Arc::clone(&sequencer),
            Arc::clone(&forwarding_enabled),
        );
        Ok(Self {
            adapter,
            history,
            sequencer,
            pipeline,
            forwarding_enabled,
            permission: Mutex::new(None),
        })
    }

    // ------------------------------------------------------------------------
    // PERMISSIONS
    // ------------------------------------------------------------------------

    /// Probe the platform for Bluetooth permissions and cache the verdict.
    /// Scan and advertise stay disabled while the verdict is a denial;
    /// calling this again after the user grants access re-enables them.
    pub async fn request_permissions(&self) -> bool {
        let granted = self.adapter.request_permissions().await;
        *self.permission.lock() = Some(granted);
        if !granted {
            tracing::warn!("bluetooth permission denied, radio operations disabled");
        }
        granted
    }

    async fn ensure_permitted(&self) -> Result<(), VuelinkError> {
        let cached = *self.permission.lock();
        let granted = match cached {
            Some(granted) => granted,
            None => self.request_permissions().await,
        };
        if granted {
            Ok(())
        } else {
            Err(VuelinkError::PermissionDenied)
        }
    }

    // ------------------------------------------------------------------------
    // OUTBOUND
    // ------------------------------------------------------------------------

    /// Advertise a message, chunk by chunk. Returns a completion receiver
    /// resolving `true` after the last chunk leaves the air. A message
    /// already in flight is cancelled first.
    pub async fn advertise(
        &self,
        message: Message,
        dwell: Option<Duration>,
    ) -> Result<oneshot::Receiver<bool>, VuelinkError> {
        self.ensure_permitted().await?;
        Ok(self.sequencer.advertise(message, dwell)?)
    }

    /// Cancel the in-flight advertisement sequence, if any. Idempotent.
    pub async fn cancel_advertise(&self) -> bool {
        self.sequencer.cancel().await
    }

    /// Observable sequencer state stream.
    pub fn advertiser_state(&self) -> watch::Receiver<SequencerState> {
        self.sequencer.state()
    }

    // ------------------------------------------------------------------------
    // INBOUND
    // ------------------------------------------------------------------------

    pub async fn scan_start(&self) -> Result<(), VuelinkError> {
        self.ensure_permitted().await?;
        if self.pipeline.scan_start().await {
            Ok(())
        } else {
            Err(VuelinkError::AdapterRefused)
        }
    }

    pub async fn scan_stop(&self) -> bool {
        self.pipeline.scan_stop().await
    }

    pub fn is_scanning(&self) -> bool {
        self.pipeline.is_scanning()
    }

    /// Subscribe to messages accepted off the air (and snapshot imports).
    pub fn subscribe(&self) -> broadcast::Receiver<ReceivedMessage> {
        self.pipeline.subscribe()
    }

    /// Parsed Vuelink advertisements seen so far, fragments included.
    pub fn received_count(&self) -> u64 {
        self.pipeline.received_count()
    }

    /// Platform radio state stream.
    pub fn adapter_state(&self) -> watch::Receiver<AdapterState> {
        self.adapter.state()
    }

    // ------------------------------------------------------------------------
    // FORWARDING
    // ------------------------------------------------------------------------

    pub fn set_forwarding_enabled(&self, enabled: bool) {
        self.forwarding_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_forwarding_enabled(&self) -> bool {
        self.forwarding_enabled.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------------
    // HISTORY & SNAPSHOTS
    // ------------------------------------------------------------------------

    /// Accepted messages, newest first.
    pub fn history(&self) -> Vec<StoredMessage> {
        self.history.list()
    }

    /// Wipe the history, in memory and on disk.
    pub fn clear_history(&self) {
        self.history.clear()
    }

    /// Export recent history as a deep-linkable snapshot string. The
    /// forward flag captures whether each message would qualify for
    /// forwarding on the importing device.
    pub fn export_snapshot(&self) -> Result<String, VuelinkError> {
        let entries: Vec<SnapshotEntry> = self
            .history
            .list()
            .into_iter()
            .take(snapshot::MAX_SNAPSHOT_MESSAGES)
            .map(|stored| SnapshotEntry {
                should_forward: pipeline::forward::should_forward(&stored.message, true),
                message: stored.message,
            })
            .collect();
        Ok(snapshot::encode(&entries)?)
    }

    /// Import a snapshot received out-of-band. Each decoded message runs
    /// through the normal accept/record/emit path; nothing is rebroadcast.
    /// Returns how many messages were new.
    pub fn import_snapshot(&self, data: &str) -> Result<usize, VuelinkError> {
        let entries = snapshot::decode(data)?;
        let pairs = entries
            .into_iter()
            .map(|entry| (entry.message, entry.should_forward))
            .collect();
        let accepted = self.pipeline.ingest_offline("import", pairs);
        tracing::info!(accepted, "snapshot imported");
        Ok(accepted)
    }
}

// ============================================================================
// TESTS
// ============================================================================
