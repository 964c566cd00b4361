// Core configuration — radio identity, timing, and bounds.

use std::time::Duration;

use thiserror::Error;

/// Manufacturer ID used by Vuelink advertisements in testing deployments
pub const DEFAULT_MANUFACTURER_ID: u16 = 0xFFFF;

/// Default advertised device name
pub const DEFAULT_DEVICE_NAME: &str = "VL";

/// Maximum advertised device name length in bytes
pub const MAX_DEVICE_NAME_LEN: usize = 8;

/// Configuration errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("device name too long: {len} bytes (max {max})", max = MAX_DEVICE_NAME_LEN)]
    DeviceNameTooLong { len: usize },

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("dedup window {window} exceeds history capacity {capacity}")]
    WindowExceedsCapacity { window: usize, capacity: usize },
}

/// Tunables for one Vuelink node.
///
/// Defaults match production behavior; tests shrink the timing knobs
/// (dwell down to 250 ms, fragment timeout to tens of milliseconds) to keep
/// suites fast.
#[derive(Debug, Clone)]
pub struct VuelinkConfig {
    /// Manufacturer ID that marks an advertisement as Vuelink traffic
    pub manufacturer_id: u16,
    /// Advertised device name, at most 8 bytes
    pub device_name: String,
    /// Whether to include the service UUID when advertising
    pub include_service_uuid: bool,
    /// How long each chunk stays on air
    pub dwell: Duration,
    /// Pause between consecutive chunks
    pub chunk_gap: Duration,
    /// How long an incomplete reassembly bucket may live
    pub fragment_timeout: Duration,
    /// Cadence of the reassembly garbage-collection tick
    pub gc_interval: Duration,
    /// Bounded history length
    pub history_capacity: usize,
    /// Recent entries scanned by the duplicate check
    pub dedup_window: usize,
}

impl Default for VuelinkConfig {
    fn default() -> Self {
        Self {
            manufacturer_id: DEFAULT_MANUFACTURER_ID,
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            include_service_uuid: false,
            dwell: Duration::from_secs(3),
            chunk_gap: Duration::from_millis(100),
            fragment_timeout: Duration::from_secs(60),
            gc_interval: Duration::from_secs(30),
            history_capacity: crate::store::DEFAULT_CAPACITY,
            dedup_window: crate::store::DEFAULT_DEDUP_WINDOW,
        }
    }
}

impl VuelinkConfig {
    pub fn with_manufacturer_id(mut self, id: u16) -> Self {
        self.manufacturer_id = id;
        self
    }

    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    pub fn with_dwell(mut self, dwell: Duration) -> Self {
        self.dwell = dwell;
        self
    }

    pub fn with_chunk_gap(mut self, gap: Duration) -> Self {
        self.chunk_gap = gap;
        self
    }

    pub fn with_fragment_timeout(mut self, timeout: Duration) -> Self {
        self.fragment_timeout = timeout;
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_name.len() > MAX_DEVICE_NAME_LEN {
            return Err(ConfigError::DeviceNameTooLong {
                len: self.device_name.len(),
            });
        }
        for (label, duration) in [
            ("dwell", self.dwell),
            ("chunk gap", self.chunk_gap),
            ("fragment timeout", self.fragment_timeout),
            ("gc interval", self.gc_interval),
        ] {
            if duration.is_zero() {
                return Err(ConfigError::ZeroDuration(label));
            }
        }
        if self.dedup_window > self.history_capacity {
            return Err(ConfigError::WindowExceedsCapacity {
                window: self.dedup_window,
                capacity: self.history_capacity,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = VuelinkConfig::default();
        config.validate().unwrap();
        assert_eq!(config.manufacturer_id, 0xFFFF);
        assert_eq!(config.device_name, "VL");
        assert_eq!(config.dwell, Duration::from_secs(3));
        assert_eq!(config.chunk_gap, Duration::from_millis(100));
        assert_eq!(config.history_capacity, 50);
        assert_eq!(config.dedup_window, 10);
    }

    #[test]
    fn test_long_device_name_rejected() {
        let config = VuelinkConfig::default().with_device_name("gate-kiosk-7");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DeviceNameTooLong { len: 12 })
        ));
    }

    #[test]
    fn test_zero_duration_rejected() {
        let config = VuelinkConfig::default().with_dwell(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroDuration("dwell"))
        ));
    }

    #[test]
    fn test_window_wider_than_capacity_rejected() {
        let mut config = VuelinkConfig::default();
        config.history_capacity = 5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::WindowExceedsCapacity { .. })
        ));
    }
}
