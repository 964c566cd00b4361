// Loopback adapter — an in-process radio for tests and demos.
//
// A LoopbackBus connects any number of adapters: every advertisement one
// adapter starts is delivered once to every *other* adapter that is
// currently scanning. Advertisement repetition while dwelling is not
// modeled; the dedup layer upstream makes repeats invisible anyway.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};

use super::{AdapterState, AdvertisementEvent, BleAdapter, ManufacturerRecord};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Default simulated signal strength
const LOOPBACK_RSSI: i16 = -42;

/// Shared medium connecting loopback adapters. Cloning yields another
/// handle onto the same bus.
#[derive(Clone, Default)]
pub struct LoopbackBus {
    peers: Arc<RwLock<Vec<Weak<AdapterShared>>>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an adapter attached to this bus.
    pub fn adapter(&self, name: &str) -> LoopbackAdapter {
        let (state_tx, state_rx) = watch::channel(AdapterState::PoweredOn);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(AdapterShared {
            name: name.to_string(),
            advertising: AtomicBool::new(false),
            scanning: AtomicBool::new(false),
            fail_advertising: AtomicBool::new(false),
            permissions_granted: AtomicBool::new(true),
            events,
            state_tx,
            state_rx,
        });
        self.peers.write().push(Arc::downgrade(&shared));
        LoopbackAdapter {
            bus: self.clone(),
            shared,
        }
    }

    /// Deliver an event to every scanning peer except the originator.
    fn deliver(&self, from: &Arc<AdapterShared>, event: AdvertisementEvent) {
        let mut peers = self.peers.write();
        peers.retain(|peer| peer.strong_count() > 0);
        for peer in peers.iter().filter_map(Weak::upgrade) {
            if Arc::ptr_eq(&peer, from) || !peer.scanning.load(Ordering::SeqCst) {
                continue;
            }
            let _ = peer.events.send(event.clone());
        }
    }

    /// Inject a raw advertisement into every scanning adapter, as if a
    /// foreign device had broadcast it.
    pub fn inject(&self, event: AdvertisementEvent) {
        let peers = self.peers.read();
        for peer in peers.iter().filter_map(Weak::upgrade) {
            if peer.scanning.load(Ordering::SeqCst) {
                let _ = peer.events.send(event.clone());
            }
        }
    }
}

struct AdapterShared {
    name: String,
    advertising: AtomicBool,
    scanning: AtomicBool,
    fail_advertising: AtomicBool,
    permissions_granted: AtomicBool,
    events: broadcast::Sender<AdvertisementEvent>,
    state_tx: watch::Sender<AdapterState>,
    state_rx: watch::Receiver<AdapterState>,
}

/// An in-process [`BleAdapter`] attached to a [`LoopbackBus`]
pub struct LoopbackAdapter {
    bus: LoopbackBus,
    shared: Arc<AdapterShared>,
}

impl LoopbackAdapter {
    /// Make subsequent start_advertising calls fail, simulating a platform
    /// refusal.
    pub fn set_fail_advertising(&self, fail: bool) {
        self.shared.fail_advertising.store(fail, Ordering::SeqCst);
    }

    /// Simulate the platform denying Bluetooth permissions.
    pub fn deny_permissions(&self) {
        self.shared
            .permissions_granted
            .store(false, Ordering::SeqCst);
        let _ = self.shared.state_tx.send(AdapterState::Unauthorized);
    }

    /// Push a radio state change to state subscribers.
    pub fn set_state(&self, state: AdapterState) {
        let _ = self.shared.state_tx.send(state);
    }
}

#[async_trait]
impl BleAdapter for LoopbackAdapter {
    async fn start_advertising(
        &self,
        _name: &str,
        manufacturer_id: u16,
        payload: &[u8],
        _include_service_uuid: bool,
    ) -> bool {
        if self.shared.fail_advertising.load(Ordering::SeqCst) {
            return false;
        }
        self.shared.advertising.store(true, Ordering::SeqCst);
        self.bus.deliver(
            &self.shared,
            AdvertisementEvent {
                device_name: Some(self.shared.name.clone()),
                manufacturer_data: vec![ManufacturerRecord {
                    id: manufacturer_id,
                    bytes: payload.to_vec(),
                }],
                rssi: Some(LOOPBACK_RSSI),
            },
        );
        true
    }

    async fn stop_advertising(&self) -> bool {
        self.shared.advertising.store(false, Ordering::SeqCst);
        true
    }

    async fn is_advertising(&self) -> bool {
        self.shared.advertising.load(Ordering::SeqCst)
    }

    async fn start_scanning(&self) -> bool {
        self.shared.scanning.store(true, Ordering::SeqCst);
        true
    }

    async fn stop_scanning(&self) -> bool {
        self.shared.scanning.store(false, Ordering::SeqCst);
        true
    }

    async fn is_scanning(&self) -> bool {
        self.shared.scanning.load(Ordering::SeqCst)
    }

    async fn request_permissions(&self) -> bool {
        self.shared.permissions_granted.load(Ordering::SeqCst)
    }

    fn advertisements(&self) -> broadcast::Receiver<AdvertisementEvent> {
        self.shared.events.subscribe()
    }

    fn state(&self) -> watch::Receiver<AdapterState> {
        self.shared.state_rx.clone()
    }
}
