//! Error types for the gattlink crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The addressed service does not exist in the discovered service tree.
    #[error("Service not found: {uuid}")]
    ServiceNotExist {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// The addressed characteristic does not exist in the discovered service tree.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotExist {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// The addressed descriptor does not exist in the discovered service tree.
    #[error("Descriptor not found: {uuid}")]
    DescriptorNotExist {
        /// The UUID of the descriptor that was not found.
        uuid: String,
    },

    /// The transport reported a non-success status for the operation.
    #[error("GATT operation failed")]
    GattStatusFailed,

    /// The operation could not even be issued to the transport.
    #[error("Request failed to issue")]
    RequestFailed,

    /// No transport handle exists for the session.
    #[error("Transport unavailable")]
    TransportUnavailable,

    /// The Bluetooth adapter is powered off.
    #[error("Bluetooth adapter disabled")]
    AdapterDisabled,

    /// The request did not complete within the configured timeout.
    #[error("Request timed out")]
    RequestTimeout,

    /// The connection was lost while the request was outstanding.
    #[error("Connection disconnected")]
    ConnectionDisconnected,

    /// The session was released while the request was outstanding.
    #[error("Connection released")]
    ConnectionReleased,

    /// The request was dropped from the queue without executing.
    #[error("Request dropped without completion")]
    RequestDropped,

    /// The device cannot be connected with the requested transport.
    #[error("Device not connectable: {address}")]
    UnsupportedDevice {
        /// Address of the device that was rejected.
        address: String,
    },

    /// No session is registered for the given address.
    #[error("No session for address: {address}")]
    SessionNotFound {
        /// The address that was looked up.
        address: String,
    },

    /// The requested operation is not supported by the transport backend.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a request resolved with a failure.
///
/// Scheduler-internal failure classification, also carried on
/// [`SessionEvent::RequestFailed`](crate::event::SessionEvent) so observers
/// can switch on the reason without inspecting an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestFailReason {
    /// The addressed service is absent from the service tree.
    ServiceNotExist,
    /// The addressed characteristic is absent from the service tree.
    CharacteristicNotExist,
    /// The addressed descriptor is absent from the service tree.
    DescriptorNotExist,
    /// The transport reported a non-success status.
    GattStatusFailed,
    /// The operation could not be issued.
    RequestFailed,
    /// No transport handle exists.
    TransportUnavailable,
    /// The adapter is powered off.
    AdapterDisabled,
    /// The per-request timeout elapsed.
    RequestTimeout,
    /// The connection dropped with the request outstanding.
    ConnectionDisconnected,
    /// The session was released with the request outstanding.
    ConnectionReleased,
}

impl From<RequestFailReason> for Error {
    fn from(reason: RequestFailReason) -> Self {
        match reason {
            RequestFailReason::ServiceNotExist => Error::ServiceNotExist {
                uuid: String::new(),
            },
            RequestFailReason::CharacteristicNotExist => Error::CharacteristicNotExist {
                uuid: String::new(),
            },
            RequestFailReason::DescriptorNotExist => Error::DescriptorNotExist {
                uuid: String::new(),
            },
            RequestFailReason::GattStatusFailed => Error::GattStatusFailed,
            RequestFailReason::RequestFailed => Error::RequestFailed,
            RequestFailReason::TransportUnavailable => Error::TransportUnavailable,
            RequestFailReason::AdapterDisabled => Error::AdapterDisabled,
            RequestFailReason::RequestTimeout => Error::RequestTimeout,
            RequestFailReason::ConnectionDisconnected => Error::ConnectionDisconnected,
            RequestFailReason::ConnectionReleased => Error::ConnectionReleased,
        }
    }
}

/// Why a connection attempt failed permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailReason {
    /// The device cannot be connected with the requested transport.
    UnsupportedDevice,
    /// The reconnection budget is exhausted.
    MaximumReconnection,
}

/// Which phase a connect timeout was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectTimeoutReason {
    /// Timed out while scanning for the device to reappear.
    DeviceNotFound,
    /// Timed out while waiting for the link to be established.
    NotConnected,
    /// Timed out while waiting for service discovery.
    ServicesNotDiscovered,
}
