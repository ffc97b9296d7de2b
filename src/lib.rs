// Allow holding locks across await points - we use parking_lot which is designed for this
#![allow(clippy::await_holding_lock)]

//! # gattlink
//!
//! A cross-platform BLE connection manager: scanning, supervised
//! connections with automatic reconnection, and a serialized GATT
//! request queue per device.
//!
//! ## Features
//!
//! - **Scanning**: filtered device discovery with per-device throttling
//! - **Supervised sessions**: a per-device state machine that drives
//!   connect, service discovery, timeout classification, and both
//!   immediate and scan-based reconnection with configurable backoff
//! - **Request scheduling**: priority-ordered, strictly serialized GATT
//!   requests with per-request timeouts and write fragmentation
//! - **Notifications**: client-characteristic-configuration tracking with
//!   rollback when a switch fails
//! - **Registry**: ordered multi-device session management reacting to
//!   adapter power cycles
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gattlink::{
//!     BtleTransport, ConnectionConfiguration, ConnectionRegistry, DeviceIdentity, EventBus,
//!     Request, ScanConfiguration, Scanner, Result,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let transport = Arc::new(BtleTransport::new().await?);
//!     let scanner = Scanner::new(
//!         Arc::new(transport.scan_backend()),
//!         ScanConfiguration::default(),
//!     );
//!     let registry = ConnectionRegistry::new(
//!         transport,
//!         scanner,
//!         Arc::new(EventBus::default()),
//!     );
//!
//!     let session = registry
//!         .connect(
//!             DeviceIdentity::new("AA:BB:CC:DD:EE:FF"),
//!             ConnectionConfiguration::default(),
//!             None,
//!         )
//!         .await?;
//!
//!     let service = uuid::Uuid::parse_str("0000180f-0000-1000-8000-00805f9b34fb").unwrap();
//!     let level = uuid::Uuid::parse_str("00002a19-0000-1000-8000-00805f9b34fb").unwrap();
//!     let value = session.execute(Request::read_characteristic(service, level)).await?;
//!     println!("battery: {:?}", value);
//!
//!     registry.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps. Peripheral addresses are UUIDs.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for configuration types

// Public modules
pub mod btle;
pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod registry;
pub mod request;
pub mod scanner;
pub mod session;
pub mod transport;

// Internal plumbing
pub(crate) mod scheduler;

#[cfg(test)]
pub(crate) mod mock;

// Re-exports for convenience
pub use btle::{BtleScanBackend, BtleTransport};
pub use config::{
    BackoffEntry, ConnectionConfiguration, ScanConfiguration, WriteMode, WriteOptions,
};
pub use device::{DeviceIdentity, DeviceType};
pub use error::{ConnectFailReason, ConnectTimeoutReason, Error, RequestFailReason, Result};
pub use event::{CallbackHandle, EventBus, EventObserver, SessionEvent};
pub use registry::ConnectionRegistry;
pub use request::{Request, RequestKind, RequestValue};
pub use scanner::{ScanBackend, ScanEvent, Scanner, ScannerKind};
pub use session::{SessionHandle, SessionState};
pub use transport::{
    AdapterState, Phy, PhyOptions, ServiceTree, Transport, TransportEvent, TransportHandle,
};
