//! Device identity types.
//!
//! A [`DeviceIdentity`] names one physical peer. Identity equality is by
//! transport address alone: two values with the same address denote the same
//! device regardless of name or signal strength.

use std::hash::{Hash, Hasher};

/// Which transport a device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceType {
    /// Bluetooth Low Energy only.
    #[default]
    Le,
    /// Classic BR/EDR.
    Classic,
}

/// Immutable identity of a discovered or connected peer.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceIdentity {
    /// Transport address (MAC on most platforms, a UUID on macOS).
    pub address: String,
    /// Human-readable name, if advertised.
    pub name: Option<String>,
    /// Signal strength in dBm when last seen.
    pub rssi: Option<i16>,
    /// Transport category of the device.
    pub device_type: DeviceType,
}

impl DeviceIdentity {
    /// Create an identity for an address with no metadata.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
            rssi: None,
            device_type: DeviceType::Le,
        }
    }

    /// Builder-style name setter.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Builder-style RSSI setter.
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Builder-style device-type setter.
    pub fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    /// Sanity check on the address format.
    ///
    /// Accepts colon-separated MAC addresses and the UUID-style identifiers
    /// some platforms hand out instead. Empty or whitespace-bearing strings
    /// are rejected before they can enter the session map.
    pub fn has_valid_address(&self) -> bool {
        let addr = &self.address;
        if addr.is_empty() || addr.chars().any(char::is_whitespace) {
            return false;
        }
        addr.chars()
            .all(|c| c.is_ascii_hexdigit() || c == ':' || c == '-')
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for DeviceIdentity {}

impl Hash for DeviceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}
