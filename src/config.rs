//! Scan and connection configuration.
//!
//! Plain value objects supplied by the caller. A [`ScanConfiguration`] is
//! immutable once a scan run starts; a [`ConnectionConfiguration`] is
//! immutable for the lifetime of its session.

use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::device::DeviceType;

/// Configuration for one scan run.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanConfiguration {
    /// How long a non-classic scan runs before auto-stopping.
    pub scan_period: Duration,
    /// Results weaker than this are dropped. `None` disables the floor.
    pub rssi_floor: Option<i16>,
    /// Only surface devices of this type. `None` surfaces everything.
    pub device_type_filter: Option<DeviceType>,
    /// Also surface peers the platform already holds a connection to,
    /// without waiting for an advertisement.
    pub include_connected: bool,
}

impl Default for ScanConfiguration {
    fn default() -> Self {
        Self {
            scan_period: Duration::from_secs(10),
            rssi_floor: None,
            device_type_filter: None,
            include_connected: false,
        }
    }
}

/// How a characteristic write is transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WriteMode {
    /// Write with response (acknowledged at the ATT layer).
    #[default]
    WithResponse,
    /// Write without response (fire-and-forget at the ATT layer).
    WithoutResponse,
}

/// Write policy for characteristic-write requests.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WriteOptions {
    /// Maximum bytes per chunk. Payloads longer than this are fragmented.
    pub package_size: usize,
    /// Delay between chunks of one fragmented write.
    pub package_write_delay: Duration,
    /// Delay before the first chunk of a write request is issued.
    pub request_write_delay: Duration,
    /// Await the transport's per-chunk completion before sending the next
    /// chunk. When false, chunks are streamed back-to-back and the request
    /// completes once the last chunk has been handed to the transport.
    pub wait_write_result: bool,
    /// ATT write type.
    pub write_mode: WriteMode,
    /// Resolve `package_size` to `negotiated MTU - 3` at dispatch time.
    pub use_mtu_as_package_size: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            package_size: 20,
            package_write_delay: Duration::ZERO,
            request_write_delay: Duration::ZERO,
            wait_write_result: true,
            write_mode: WriteMode::WithResponse,
            use_mtu_as_package_size: false,
        }
    }
}

impl WriteOptions {
    /// Start building write options from the defaults.
    pub fn builder() -> WriteOptionsBuilder {
        WriteOptionsBuilder {
            options: WriteOptions::default(),
        }
    }
}

/// Builder for [`WriteOptions`].
#[derive(Debug, Clone)]
pub struct WriteOptionsBuilder {
    options: WriteOptions,
}

impl WriteOptionsBuilder {
    /// Set the chunk size.
    pub fn package_size(mut self, size: usize) -> Self {
        self.options.package_size = size.max(1);
        self
    }

    /// Set the inter-chunk delay.
    pub fn package_write_delay(mut self, delay: Duration) -> Self {
        self.options.package_write_delay = delay;
        self
    }

    /// Set the pre-write delay.
    pub fn request_write_delay(mut self, delay: Duration) -> Self {
        self.options.request_write_delay = delay;
        self
    }

    /// Choose whether each chunk waits for its completion callback.
    pub fn wait_write_result(mut self, wait: bool) -> Self {
        self.options.wait_write_result = wait;
        self
    }

    /// Set the ATT write type.
    pub fn write_mode(mut self, mode: WriteMode) -> Self {
        self.options.write_mode = mode;
        self
    }

    /// Derive the chunk size from the negotiated MTU at dispatch time.
    pub fn use_mtu_as_package_size(mut self, use_mtu: bool) -> Self {
        self.options.use_mtu_as_package_size = use_mtu;
        self
    }

    /// Finish building.
    pub fn build(self) -> WriteOptions {
        self.options
    }
}

/// One entry of the scan-reconnection backoff table: scan-based reconnection
/// is permitted once at least `failures` reconnect attempts have been spent
/// and at least `min_elapsed` has passed since the scanner last stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BackoffEntry {
    /// Minimum total reconnect attempts for this entry to apply.
    pub failures: u32,
    /// Minimum elapsed time since the last scan stop.
    pub min_elapsed: Duration,
}

/// Configuration for one connection session.
#[derive(Debug, Clone)]
pub struct ConnectionConfiguration {
    /// Overall connect timeout, enforced by the supervisor tick.
    pub connect_timeout: Duration,
    /// Per-request timeout, re-armed per chunk for fragmented writes.
    pub request_timeout: Duration,
    /// Delay between link establishment and service discovery.
    pub discover_services_delay: Duration,
    /// Reconnect automatically after a link loss.
    pub auto_reconnect: bool,
    /// How many times to retry immediately before falling back to
    /// scan-based reconnection.
    pub reconnect_immediately_max: u32,
    /// Total reconnect attempt budget. `None` means unlimited.
    pub reconnect_max: Option<u32>,
    /// Backoff table gating scan-based reconnection.
    pub scan_backoff: Vec<BackoffEntry>,
    /// Default write policies keyed by (service, characteristic), applied
    /// when a write request carries no policy of its own.
    pub default_write_options: HashMap<(Uuid, Uuid), WriteOptions>,
}

impl Default for ConnectionConfiguration {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(3),
            discover_services_delay: Duration::from_millis(600),
            auto_reconnect: true,
            reconnect_immediately_max: 3,
            reconnect_max: None,
            // Scan-based reconnection at most once every 10 seconds.
            scan_backoff: vec![BackoffEntry {
                failures: 0,
                min_elapsed: Duration::from_secs(10),
            }],
            default_write_options: HashMap::new(),
        }
    }
}

impl ConnectionConfiguration {
    /// Look up the default write policy for a characteristic.
    pub fn default_write_options(&self, service: Uuid, characteristic: Uuid) -> Option<&WriteOptions> {
        self.default_write_options.get(&(service, characteristic))
    }

    /// Register a default write policy for a characteristic.
    pub fn set_default_write_options(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        options: WriteOptions,
    ) {
        self.default_write_options
            .insert((service, characteristic), options);
    }

    /// Decide whether scan-based reconnection is currently permitted.
    ///
    /// Walks the table in descending `failures` order and permits
    /// reconnection on the largest entry whose failure threshold
    /// `reconnect_count` has reached and whose elapsed-time requirement the
    /// time since the last scan stop meets. No satisfied entry means wait.
    pub fn scan_reconnect_allowed(
        &self,
        reconnect_count: u32,
        elapsed_since_scan_stop: Duration,
    ) -> bool {
        let mut entries: Vec<&BackoffEntry> = self.scan_backoff.iter().collect();
        entries.sort_by(|a, b| b.failures.cmp(&a.failures));
        entries
            .into_iter()
            .any(|e| reconnect_count >= e.failures && elapsed_since_scan_stop >= e.min_elapsed)
    }
}
