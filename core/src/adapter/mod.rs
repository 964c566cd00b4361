//! Platform BLE adapter abstraction
//!
//! The core never talks to an OS Bluetooth stack directly. A platform
//! crate implements [`BleAdapter`] and the core drives it: the advertiser
//! sequencer starts and stops advertisements, the scanner pipeline consumes
//! the discovery stream. The in-process [`LoopbackAdapter`] wires several
//! cores together for tests and the CLI demo.

pub mod loopback;

pub use loopback::{LoopbackAdapter, LoopbackBus};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

/// Radio availability as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Unknown,
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
}

/// One manufacturer-specific record inside an advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManufacturerRecord {
    pub id: u16,
    pub bytes: Vec<u8>,
}

/// A discovered advertisement, as delivered by the platform scanner
#[derive(Debug, Clone)]
pub struct AdvertisementEvent {
    /// Best-effort peer name; not all platforms surface one
    pub device_name: Option<String>,
    pub manufacturer_data: Vec<ManufacturerRecord>,
    /// True received signal strength when the platform provides it
    pub rssi: Option<i16>,
}

/// Contract between the core and a platform BLE stack.
///
/// All operations are best-effort booleans: the platform reports whether it
/// accepted the request, and the core degrades on refusal rather than
/// retrying. Discovery is delivered as an event stream; radio availability
/// as a watch stream.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    async fn start_advertising(
        &self,
        name: &str,
        manufacturer_id: u16,
        payload: &[u8],
        include_service_uuid: bool,
    ) -> bool;

    async fn stop_advertising(&self) -> bool;

    async fn is_advertising(&self) -> bool;

    async fn start_scanning(&self) -> bool;

    async fn stop_scanning(&self) -> bool;

    async fn is_scanning(&self) -> bool;

    async fn request_permissions(&self) -> bool;

    /// Subscribe to discovered advertisements.
    fn advertisements(&self) -> broadcast::Receiver<AdvertisementEvent>;

    /// Current radio state, updated by the platform.
    fn state(&self) -> watch::Receiver<AdapterState>;
}
