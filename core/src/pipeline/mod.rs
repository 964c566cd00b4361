//! Scanner pipeline — the inbound half of the mesh
//!
//! One pump task consumes the adapter's discovery stream and runs each
//! advertisement to completion before the next: manufacturer filter, packet
//! decode, duplicate suppression, reassembly, then emission to subscribers
//! and the forwarding decision. History is therefore never read in a torn
//! state. The same task ticks the reassembly garbage collector.

pub mod forward;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::adapter::{AdvertisementEvent, BleAdapter};
use crate::advertiser::AdvertiseSequencer;
use crate::config::VuelinkConfig;
use crate::message::{self, Message};
use crate::reassembly::Reassembler;
use crate::store::HistoryStore;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A message accepted off the air, as seen by subscribers
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Best-effort originator identifier from the advertisement
    pub source: String,
    pub received_at: DateTime<Utc>,
    pub message: Message,
    /// True signal strength when the platform reported one
    pub rssi: Option<i16>,
    /// Whether this message was combined from multiple fragments
    pub reassembled: bool,
    /// Whether the forwarder will rebroadcast it
    pub will_forward: bool,
}

struct PumpHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Inbound processing: adapter discovery stream through to subscribers
pub struct ScannerPipeline {
    adapter: Arc<dyn BleAdapter>,
    config: VuelinkConfig,
    history: HistoryStore,
    sequencer: Arc<AdvertiseSequencer>,
    forwarding_enabled: Arc<AtomicBool>,
    received_count: Arc<AtomicU64>,
    events: broadcast::Sender<ReceivedMessage>,
    pump: Mutex<Option<PumpHandle>>,
}

impl ScannerPipeline {
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        config: VuelinkConfig,
        history: HistoryStore,
        sequencer: Arc<AdvertiseSequencer>,
        forwarding_enabled: Arc<AtomicBool>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            adapter,
            config,
            history,
            sequencer,
            forwarding_enabled,
            received_count: Arc::new(AtomicU64::new(0)),
            events,
            pump: Mutex::new(None),
        }
    }

    /// Subscribe to accepted messages.
    pub fn subscribe(&self) -> broadcast::Receiver<ReceivedMessage> {
        self.events.subscribe()
    }

    /// Parsed Vuelink advertisements seen so far (fragments included)
    pub fn received_count(&self) -> u64 {
        self.received_count.load(Ordering::Relaxed)
    }

    pub fn is_scanning(&self) -> bool {
        self.pump.lock().is_some()
    }

    /// Start discovery and the pump task. Idempotent.
    pub async fn scan_start(&self) -> bool {
        if self.pump.lock().is_some() {
            return true;
        }
        if !self.adapter.start_scanning().await {
            tracing::warn!("adapter refused to start scanning");
            return false;
        }

        let mut advertisements = self.adapter.advertisements();
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let mut reassembler = Reassembler::new(self.config.fragment_timeout.as_millis() as u64);
        let gc_interval = self.config.gc_interval;
        let ctx = PumpCtx {
            manufacturer_id: self.config.manufacturer_id,
            forward_dwell: self.config.dwell,
            history: self.history.clone(),
            sequencer: Arc::clone(&self.sequencer),
            forwarding_enabled: Arc::clone(&self.forwarding_enabled),
            received_count: Arc::clone(&self.received_count),
            events: self.events.clone(),
        };

        let task = tokio::spawn(async move {
            let mut gc = tokio::time::interval(gc_interval);
            gc.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    _ = gc.tick() => {
                        reassembler.gc(now_ms());
                    }
                    event = advertisements.recv() => match event {
                        Ok(event) => ctx.process(event, &mut reassembler),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "scanner lagged, advertisements dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!("scanner pump stopped");
        });

        self.pump.lock().replace(PumpHandle {
            cancel: cancel_tx,
            task,
        });
        true
    }

    /// Stop discovery and the pump task. Idempotent.
    pub async fn scan_stop(&self) -> bool {
        let Some(handle) = self.pump.lock().take() else {
            return false;
        };
        let _ = handle.cancel.send(true);
        let _ = handle.task.await;
        self.adapter.stop_scanning().await
    }

    /// Run decoded messages through accept/record/emit without the radio.
    /// Used by the shared-snapshot import path. Returns accepted count.
    pub fn ingest_offline(&self, source: &str, entries: Vec<(Message, bool)>) -> usize {
        let ctx = PumpCtx {
            manufacturer_id: self.config.manufacturer_id,
            forward_dwell: self.config.dwell,
            history: self.history.clone(),
            sequencer: Arc::clone(&self.sequencer),
            forwarding_enabled: Arc::clone(&self.forwarding_enabled),
            received_count: Arc::clone(&self.received_count),
            events: self.events.clone(),
        };
        let mut accepted = 0;
        for (message, should_forward) in entries {
            if !ctx.history.accept(&message) {
                continue;
            }
            ctx.emit(message, source, None, false, should_forward);
            accepted += 1;
        }
        accepted
    }
}

impl Drop for ScannerPipeline {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.lock().take() {
            let _ = handle.cancel.send(true);
            handle.task.abort();
        }
    }
}

struct PumpCtx {
    manufacturer_id: u16,
    forward_dwell: Duration,
    history: HistoryStore,
    sequencer: Arc<AdvertiseSequencer>,
    forwarding_enabled: Arc<AtomicBool>,
    received_count: Arc<AtomicU64>,
    events: broadcast::Sender<ReceivedMessage>,
}

impl PumpCtx {
    fn process(&self, event: AdvertisementEvent, reassembler: &mut Reassembler) {
        let source = event
            .device_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        for record in &event.manufacturer_data {
            if record.id != self.manufacturer_id {
                continue;
            }
            let Some(fragment) = message::decode(&record.bytes) else {
                // Malformed advertisements are dropped silently, uncounted
                continue;
            };
            self.received_count.fetch_add(1, Ordering::Relaxed);

            if !self.history.accept(&fragment.message) {
                tracing::debug!(%source, "duplicate advertisement suppressed");
                continue;
            }

            let will_forward = forward::should_forward(
                &fragment.message,
                self.forwarding_enabled.load(Ordering::SeqCst),
            );
            if fragment.is_single() {
                self.accept_and_emit(fragment.message, &source, event.rssi, false, will_forward);
            } else if let Some(completed) =
                reassembler.insert(&source, fragment, now_ms(), will_forward)
            {
                // Fragments pass the dedup window individually; the combined
                // whole gets its own check before entering history.
                if self.history.accept(&completed.message) {
                    self.accept_and_emit(
                        completed.message,
                        &source,
                        event.rssi,
                        true,
                        completed.will_forward,
                    );
                } else {
                    tracing::debug!(%source, "reassembled duplicate suppressed");
                }
            }
        }
    }

    fn accept_and_emit(
        &self,
        message: Message,
        source: &str,
        rssi: Option<i16>,
        reassembled: bool,
        will_forward: bool,
    ) {
        self.emit(message.clone(), source, rssi, reassembled, will_forward);
        if will_forward {
            // Re-encode the logical message, never the observed bytes, with
            // the repeat flag forced on.
            let forwarded = message.with_repeat(true);
            match self.sequencer.advertise(forwarded, Some(self.forward_dwell)) {
                Ok(_done) => tracing::debug!(source, "message handed to forwarder"),
                Err(e) => tracing::warn!(error = %e, "forward re-encode failed"),
            }
        }
    }

    fn emit(
        &self,
        message: Message,
        source: &str,
        rssi: Option<i16>,
        reassembled: bool,
        will_forward: bool,
    ) {
        let stored = self.history.record(message.clone());
        tracing::info!(
            source,
            message_type = ?message.message_type(),
            reassembled,
            will_forward,
            "message accepted"
        );
        let _ = self.events.send(ReceivedMessage {
            source: source.to_string(),
            received_at: stored.received_at,
            message,
            rssi,
            reassembled,
            will_forward,
        });
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{LoopbackBus, ManufacturerRecord};
    use crate::message::{encode, split, Fragment, Priority};
    use crate::store::MemoryStorage;

    struct Node {
        pipeline: ScannerPipeline,
        bus: LoopbackBus,
    }

    fn node_with_config(config: VuelinkConfig) -> Node {
        let bus = LoopbackBus::new();
        let adapter = Arc::new(bus.adapter("node-a"));
        let history = HistoryStore::new(
            Arc::new(MemoryStorage::new()),
            config.history_capacity,
            config.dedup_window,
        );
        let sequencer = Arc::new(AdvertiseSequencer::new(adapter.clone(), config.clone()));
        let pipeline = ScannerPipeline::new(
            adapter,
            config,
            history,
            sequencer,
            Arc::new(AtomicBool::new(true)),
        );
        Node { pipeline, bus }
    }

    fn node() -> Node {
        node_with_config(VuelinkConfig::default())
    }

    fn vuelink_record(payload: Vec<u8>) -> AdvertisementEvent {
        AdvertisementEvent {
            device_name: Some("peer".to_string()),
            manufacturer_data: vec![ManufacturerRecord {
                id: 0xFFFF,
                bytes: payload,
            }],
            rssi: Some(-63),
        }
    }

    async fn settle() {
        // Let the pump task drain its queue
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_single_message_flows_to_subscriber() {
        let node = node();
        let mut events = node.pipeline.subscribe();
        assert!(node.pipeline.scan_start().await);

        let msg = Message::text("gate A4 open", false, Priority::Medium);
        let payload = encode(&Fragment::single(msg.clone())).unwrap();
        node.bus.inject(vuelink_record(payload));

        let received = events.recv().await.unwrap();
        assert_eq!(received.message, msg);
        assert_eq!(received.source, "peer");
        assert_eq!(received.rssi, Some(-63));
        assert!(!received.reassembled);
        assert!(!received.will_forward);
        assert_eq!(node.pipeline.received_count(), 1);
        assert_eq!(node.pipeline.history.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_foreign_manufacturer_ignored() {
        let node = node();
        let mut events = node.pipeline.subscribe();
        node.pipeline.scan_start().await;

        let payload =
            encode(&Fragment::single(Message::text("not ours", false, Priority::Low))).unwrap();
        node.bus.inject(AdvertisementEvent {
            device_name: Some("peer".to_string()),
            manufacturer_data: vec![ManufacturerRecord {
                id: 0x004C,
                bytes: payload,
            }],
            rssi: None,
        });
        settle().await;

        assert_eq!(node.pipeline.received_count(), 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_malformed_advertisement_not_counted() {
        let node = node();
        node.pipeline.scan_start().await;
        node.bus.inject(vuelink_record(vec![0x09]));
        settle().await;
        assert_eq!(node.pipeline.received_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_duplicate_suppressed() {
        let node = node();
        let mut events = node.pipeline.subscribe();
        node.pipeline.scan_start().await;

        let payload = encode(&Fragment::single(Message::text(
            "once only",
            false,
            Priority::Medium,
        )))
        .unwrap();
        node.bus.inject(vuelink_record(payload.clone()));
        node.bus.inject(vuelink_record(payload));
        settle().await;

        assert!(events.recv().await.is_ok());
        assert!(events.try_recv().is_err());
        assert_eq!(node.pipeline.received_count(), 2);
        assert_eq!(node.pipeline.history.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_multi_part_message_reassembles() {
        let node = node();
        let mut events = node.pipeline.subscribe();
        node.pipeline.scan_start().await;

        let msg = Message::text("A".repeat(63), false, Priority::Medium);
        for fragment in split(&msg).unwrap() {
            node.bus.inject(vuelink_record(encode(&fragment).unwrap()));
        }

        let received = events.recv().await.unwrap();
        assert_eq!(received.message, msg);
        assert!(received.reassembled);
        assert_eq!(node.pipeline.history.len(), 1);
        // One event only, despite three fragments
        settle().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_urgent_message_forwarded_to_mesh() {
        let node = node();
        let mut events = node.pipeline.subscribe();
        node.pipeline.scan_start().await;

        // A third party watching the same bus sees the rebroadcast
        let observer = node.bus.adapter("observer");
        observer.start_scanning().await;
        let mut observed = observer.advertisements();

        let msg = Message::flight_update("FL1", crate::message::FlightUpdateType::Delay, false, Priority::Urgent);
        let payload = encode(&Fragment::single(msg.clone())).unwrap();
        node.bus.inject(vuelink_record(payload));

        let received = events.recv().await.unwrap();
        assert!(received.will_forward);

        // The observer sees the injected original first, then the rebroadcast
        let original = observed.recv().await.unwrap();
        assert!(!message::decode(&original.manufacturer_data[0].bytes)
            .unwrap()
            .message
            .repeat());
        let rebroadcast = observed.recv().await.unwrap();
        let fragment = message::decode(&rebroadcast.manufacturer_data[0].bytes).unwrap();
        // The rebroadcast is re-encoded with repeat forced on
        assert!(fragment.message.repeat());
        assert!(fragment.message.content_eq(&msg));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scan_stop_is_idempotent() {
        let node = node();
        assert!(node.pipeline.scan_start().await);
        assert!(node.pipeline.is_scanning());
        assert!(node.pipeline.scan_stop().await);
        assert!(!node.pipeline.is_scanning());
        assert!(!node.pipeline.scan_stop().await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stale_fragments_never_complete() {
        // Short timeout and fast GC so the bucket expires between fragments
        let config = VuelinkConfig::default()
            .with_fragment_timeout(Duration::from_millis(100))
            .with_gc_interval(Duration::from_millis(30));
        let node = node_with_config(config);
        let mut events = node.pipeline.subscribe();
        node.pipeline.scan_start().await;

        let msg = Message::text("B".repeat(50), false, Priority::Medium);
        let fragments = split(&msg).unwrap();
        assert_eq!(fragments.len(), 3);

        node.bus
            .inject(vuelink_record(encode(&fragments[0]).unwrap()));
        tokio::time::sleep(Duration::from_millis(400)).await;

        node.bus
            .inject(vuelink_record(encode(&fragments[1]).unwrap()));
        node.bus
            .inject(vuelink_record(encode(&fragments[2]).unwrap()));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The first bucket expired; parts 2 and 3 opened a new one that can
        // never complete. No message is emitted.
        assert!(events.try_recv().is_err());
        assert_eq!(node.pipeline.history.len(), 0);
    }
}
