//! Device discovery.
//!
//! A [`Scanner`] front-end owns listener fan-out, result deduplication and
//! rate limiting, the bounded scan duration, and the already-connected
//! enumeration. The actual radio work is delegated to a [`ScanBackend`]
//! strategy: modern LE scanning, legacy LE scanning, or classic BR/EDR
//! discovery, with the btleplug-backed LE strategy in `btle.rs`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::ScanConfiguration;
use crate::device::DeviceIdentity;
use crate::error::Result;
use crate::event::CallbackHandle;

/// Which discovery strategy a backend implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerKind {
    /// Modern LE scanning.
    Le,
    /// Legacy LE scanning.
    LegacyLe,
    /// Classic BR/EDR discovery.
    Classic,
}

/// Numeric failure codes reported with [`ScanEvent::Error`].
pub mod scan_error {
    /// The adapter is powered off.
    pub const ADAPTER_OFF: i32 = 0;
    /// A non-classic scan is already running.
    pub const ALREADY_SCANNING: i32 = 1;
    /// The backend failed its readiness check (no LE scanner object,
    /// missing OS permission or location-service precondition).
    pub const NOT_READY: i32 = 2;
    /// The backend failed to start.
    pub const START_FAILED: i32 = 3;
}

/// Raw event produced by a [`ScanBackend`].
#[derive(Debug, Clone)]
pub enum BackendScanEvent {
    /// A peer was seen. Identity carries name, RSSI, and device type.
    Discovered {
        /// The discovered peer.
        identity: DeviceIdentity,
    },
    /// The platform reported a scan failure.
    Failed {
        /// Platform failure code.
        code: i32,
        /// Human-readable description.
        message: String,
    },
    /// Discovery ran to completion (classic discovery only).
    Completed,
}

/// A concrete discovery strategy.
#[async_trait]
pub trait ScanBackend: Send + Sync + 'static {
    /// Which strategy this backend implements.
    fn kind(&self) -> ScannerKind;

    /// Whether the local adapter is powered on.
    fn adapter_enabled(&self) -> bool;

    /// Device-specific readiness checks beyond adapter power.
    fn is_ready(&self) -> bool {
        true
    }

    /// Begin producing raw discovery events.
    async fn start(&self) -> Result<mpsc::Receiver<BackendScanEvent>>;

    /// Stop producing events.
    async fn stop(&self);

    /// Peers the platform already holds a connection to.
    async fn connected_devices(&self) -> Vec<DeviceIdentity> {
        Vec::new()
    }
}

/// Event delivered to scan listeners.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// A scan run started.
    Started,
    /// A scan run stopped. Suppressed for quiet stops.
    Stopped,
    /// A matching peer was discovered.
    Result {
        /// The discovered peer.
        identity: DeviceIdentity,
        /// True when surfaced from the platform's connected-peripherals
        /// list rather than an advertisement.
        connected_by_system: bool,
    },
    /// The scan failed.
    Error {
        /// One of the [`scan_error`] codes, or a backend-specific code.
        code: i32,
        /// Human-readable description.
        message: String,
    },
}

/// Minimum interval between two results for the same address.
const RESULT_THROTTLE: Duration = Duration::from_millis(500);

struct ScanRun {
    pump_task: Option<tokio::task::JoinHandle<()>>,
    stop_task: Option<tokio::task::JoinHandle<()>>,
}

struct ScannerInner {
    backend: Arc<dyn ScanBackend>,
    default_config: ScanConfiguration,
    event_tx: broadcast::Sender<ScanEvent>,
    running: Mutex<Option<ScanRun>>,
    callback_counter: AtomicU64,
}

/// Device discovery front-end. Cheap to clone; clones share one scanner.
#[derive(Clone)]
pub struct Scanner {
    inner: Arc<ScannerInner>,
}

impl Scanner {
    /// Create a scanner over a backend with a default configuration.
    pub fn new(backend: Arc<dyn ScanBackend>, default_config: ScanConfiguration) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ScannerInner {
                backend,
                default_config,
                event_tx,
                running: Mutex::new(None),
                callback_counter: AtomicU64::new(0),
            }),
        }
    }

    /// Which discovery strategy the backend implements.
    pub fn kind(&self) -> ScannerKind {
        self.inner.backend.kind()
    }

    /// Check if a scan run is active.
    pub fn is_scanning(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    /// Subscribe to scan events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Register a callback for every scan event.
    pub fn on_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ScanEvent) + Send + Sync + 'static,
    {
        let callback_id = self.inner.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.inner.event_tx.subscribe();
        let handle = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                callback(event);
            }
        });
        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Start a scan run with the scanner's default configuration.
    pub async fn start(&self) {
        self.start_with(self.inner.default_config.clone()).await;
    }

    /// Start a scan run.
    ///
    /// Failures are reported through [`ScanEvent::Error`] rather than a
    /// return value: callers race each other for the radio and the losers
    /// only need the event.
    pub async fn start_with(&self, config: ScanConfiguration) {
        let backend = &self.inner.backend;

        if !backend.adapter_enabled() {
            warn!("scan start rejected: adapter off");
            self.emit(ScanEvent::Error {
                code: scan_error::ADAPTER_OFF,
                message: "bluetooth adapter is off".into(),
            });
            return;
        }
        if backend.kind() != ScannerKind::Classic && self.is_scanning() {
            debug!("scan start rejected: already scanning");
            self.emit(ScanEvent::Error {
                code: scan_error::ALREADY_SCANNING,
                message: "a scan is already running".into(),
            });
            return;
        }
        if !backend.is_ready() {
            warn!("scan start rejected: backend not ready");
            self.emit(ScanEvent::Error {
                code: scan_error::NOT_READY,
                message: "scan backend not ready".into(),
            });
            return;
        }

        let backend_rx = match backend.start().await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("scan backend failed to start: {e}");
                self.emit(ScanEvent::Error {
                    code: scan_error::START_FAILED,
                    message: e.to_string(),
                });
                return;
            }
        };

        info!(kind = ?backend.kind(), "scan started");
        self.emit(ScanEvent::Started);

        if config.include_connected {
            for identity in backend.connected_devices().await {
                if passes_filter(&config, &identity) {
                    self.emit(ScanEvent::Result {
                        identity,
                        connected_by_system: true,
                    });
                }
            }
        }

        let pump_task = tokio::spawn(pump(self.clone(), config.clone(), backend_rx));

        // Classic discovery runs until the platform signals completion.
        let stop_task = if backend.kind() != ScannerKind::Classic {
            let scanner = self.clone();
            let period = config.scan_period;
            Some(tokio::spawn(async move {
                tokio::time::sleep(period).await;
                scanner.stop(false).await;
            }))
        } else {
            None
        };

        *self.inner.running.lock() = Some(ScanRun {
            pump_task: Some(pump_task),
            stop_task,
        });
    }

    /// Stop the current scan run. Unless `quietly`, a stop event is emitted
    /// when a scan was actually running.
    pub async fn stop(&self, quietly: bool) {
        self.stop_from(quietly, false).await;
    }

    /// Forced stop on adapter power-off, with no user-visible stop event.
    pub async fn on_adapter_off(&self) {
        self.stop_from(true, false).await;
    }

    async fn stop_from(&self, quietly: bool, from_pump: bool) {
        let run = self.inner.running.lock().take();
        let mut run = match run {
            Some(run) => run,
            None => return,
        };

        if let Some(stop_task) = run.stop_task.take() {
            stop_task.abort();
        }
        if !from_pump {
            if let Some(pump_task) = run.pump_task.take() {
                pump_task.abort();
            }
        }
        self.inner.backend.stop().await;

        if !quietly {
            info!("scan stopped");
            self.emit(ScanEvent::Stopped);
        } else {
            debug!("scan stopped quietly");
        }
    }

    fn emit(&self, event: ScanEvent) {
        let _ = self.inner.event_tx.send(event);
    }
}

/// Consume backend events, applying the configuration filter and the
/// per-address rate limit.
async fn pump(
    scanner: Scanner,
    config: ScanConfiguration,
    mut backend_rx: mpsc::Receiver<BackendScanEvent>,
) {
    let mut last_seen: HashMap<String, Instant> = HashMap::new();

    while let Some(event) = backend_rx.recv().await {
        match event {
            BackendScanEvent::Discovered { identity } => {
                if !passes_filter(&config, &identity) {
                    continue;
                }
                let now = Instant::now();
                if let Some(&seen) = last_seen.get(&identity.address) {
                    if now.duration_since(seen) < RESULT_THROTTLE {
                        continue;
                    }
                }
                last_seen.insert(identity.address.clone(), now);
                scanner.emit(ScanEvent::Result {
                    identity,
                    connected_by_system: false,
                });
            }
            BackendScanEvent::Failed { code, message } => {
                warn!(code, "scan failed: {message}");
                scanner.emit(ScanEvent::Error { code, message });
                scanner.stop_from(true, true).await;
                break;
            }
            BackendScanEvent::Completed => {
                debug!("scan backend signalled completion");
                scanner.stop_from(false, true).await;
                break;
            }
        }
    }
}

fn passes_filter(config: &ScanConfiguration, identity: &DeviceIdentity) -> bool {
    if let Some(filter) = config.device_type_filter {
        if identity.device_type != filter {
            return false;
        }
    }
    if let Some(floor) = config.rssi_floor {
        match identity.rssi {
            Some(rssi) if rssi >= floor => {}
            _ => return false,
        }
    }
    identity.has_valid_address()
}
