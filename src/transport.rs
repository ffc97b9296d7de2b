//! Transport driver abstraction.
//!
//! The radio stack is an external collaborator: an opaque driver exposing
//! connect/disconnect/read/write primitives and asynchronous completions.
//! The core only ever talks to the [`Transport`] and [`TransportHandle`]
//! traits; `btle.rs` provides the btleplug-backed implementation and tests
//! provide a scripted one.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::device::DeviceIdentity;
use crate::error::Result;

/// Client Characteristic Configuration descriptor (0x2902).
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCC value enabling notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
/// CCC value enabling indications.
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
/// CCC value disabling notifications and indications.
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// GATT status carried on link-loss events that signals a stale service
/// cache and triggers a cache-refresh attempt before reporting disconnect.
pub const STALE_CACHE_STATUS: i32 = 133;

/// Default ATT MTU before negotiation.
pub const DEFAULT_MTU: u16 = 23;

/// Power state of the local adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// The adapter is powered on.
    On,
    /// The adapter is powered off or unavailable.
    Off,
}

impl AdapterState {
    /// Check if the adapter is powered on.
    pub fn is_on(&self) -> bool {
        matches!(self, Self::On)
    }
}

/// A physical-layer selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phy {
    /// LE 1M.
    #[default]
    Le1M,
    /// LE 2M.
    Le2M,
    /// LE Coded.
    LeCoded,
}

/// Preferred-PHY negotiation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhyOptions {
    /// Preferred transmit PHY.
    pub tx: Phy,
    /// Preferred receive PHY.
    pub rx: Phy,
}

/// A descriptor in the discovered service tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorInfo {
    /// Descriptor UUID.
    pub uuid: Uuid,
}

/// A characteristic in the discovered service tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Descriptors attached to the characteristic.
    pub descriptors: Vec<DescriptorInfo>,
}

/// A service in the discovered service tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics belonging to the service.
    pub characteristics: Vec<CharacteristicInfo>,
}

/// The full set of services discovered on a peer.
///
/// Pre-flight existence checks for requests resolve against this tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceTree {
    services: Vec<ServiceInfo>,
}

impl ServiceTree {
    /// Build a tree from discovered services.
    pub fn new(services: Vec<ServiceInfo>) -> Self {
        Self { services }
    }

    /// True when discovery returned no services.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// All services.
    pub fn services(&self) -> &[ServiceInfo] {
        &self.services
    }

    /// Look up a service.
    pub fn service(&self, service: Uuid) -> Option<&ServiceInfo> {
        self.services.iter().find(|s| s.uuid == service)
    }

    /// Look up a characteristic inside a service.
    pub fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Option<&CharacteristicInfo> {
        self.service(service)?
            .characteristics
            .iter()
            .find(|c| c.uuid == characteristic)
    }

    /// Look up a descriptor inside a characteristic.
    pub fn descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Option<&DescriptorInfo> {
        self.characteristic(service, characteristic)?
            .descriptors
            .iter()
            .find(|d| d.uuid == descriptor)
    }
}

/// Asynchronous event from an established transport session.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The link dropped. `status` carries the transport's GATT status when
    /// one was reported; [`STALE_CACHE_STATUS`] triggers a cache refresh.
    ConnectionLost {
        /// GATT status reported with the loss, if any.
        status: Option<i32>,
    },
    /// A subscribed characteristic pushed a value.
    CharacteristicChanged {
        /// Service owning the characteristic.
        service: Uuid,
        /// The characteristic that changed.
        characteristic: Uuid,
        /// The pushed value.
        value: Bytes,
    },
}

/// An established session with one peer.
///
/// Every method is one asynchronous transport primitive; the request
/// scheduler serializes calls so implementations never see more than one
/// outstanding GATT operation per handle.
#[async_trait]
pub trait TransportHandle: Send + Sync + 'static {
    /// Run service discovery and return the service tree.
    async fn discover_services(&self) -> Result<ServiceTree>;

    /// Read a characteristic value.
    async fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<Bytes>;

    /// Write a characteristic value.
    async fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: Bytes,
        mode: crate::config::WriteMode,
    ) -> Result<()>;

    /// Read a descriptor value.
    async fn read_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<Bytes>;

    /// Write a descriptor value. Writing [`CLIENT_CHARACTERISTIC_CONFIG`]
    /// configures notifications/indications on platforms that fold the CCC
    /// write into a subscribe primitive.
    async fn write_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Bytes,
    ) -> Result<()>;

    /// Flip the client-side notification switch for a characteristic.
    async fn set_characteristic_notification(
        &self,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<()>;

    /// Negotiate the ATT MTU. Returns the negotiated value.
    async fn request_mtu(&self, mtu: u16) -> Result<u16>;

    /// Read the current signal strength.
    async fn read_rssi(&self) -> Result<i16>;

    /// Read the current PHY pair.
    async fn read_phy(&self) -> Result<(Phy, Phy)>;

    /// Request a preferred PHY pair. Returns the resulting pair.
    async fn set_preferred_phy(&self, options: PhyOptions) -> Result<(Phy, Phy)>;

    /// Drop the service cache, where the platform exposes a way to.
    ///
    /// Absence of the capability is a normal, handled case: the default
    /// reports `Ok(false)` and the session carries on without a refresh.
    async fn refresh_cache(&self) -> Result<bool> {
        Ok(false)
    }

    /// Disconnect the link, keeping the handle for a later close.
    async fn disconnect(&self);

    /// Tear the session down. The handle is unusable afterwards.
    async fn close(&self);

    /// Subscribe to asynchronous events from this session.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

/// A transport driver able to open sessions with peers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Attempt to establish a link with a peer. Resolves once the link is
    /// up or the attempt failed; the overall connect timeout is enforced by
    /// the session supervisor, not here.
    async fn connect(&self, identity: &DeviceIdentity) -> Result<Arc<dyn TransportHandle>>;

    /// Current adapter power state.
    fn adapter_state(&self) -> AdapterState;

    /// Subscribe to adapter power-state changes.
    fn adapter_events(&self) -> broadcast::Receiver<AdapterState>;

    /// Whether this transport can connect the given identity at all.
    fn is_connectable(&self, identity: &DeviceIdentity) -> bool {
        let _ = identity;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> ServiceTree {
        ServiceTree::new(vec![ServiceInfo {
            uuid: Uuid::from_u128(1),
            characteristics: vec![CharacteristicInfo {
                uuid: Uuid::from_u128(2),
                descriptors: vec![DescriptorInfo {
                    uuid: CLIENT_CHARACTERISTIC_CONFIG,
                }],
            }],
        }])
    }

    #[test]
    fn test_service_tree_lookups() {
        let tree = tree();
        assert!(!tree.is_empty());
        assert!(tree.service(Uuid::from_u128(1)).is_some());
        assert!(tree.service(Uuid::from_u128(9)).is_none());
        assert!(tree
            .characteristic(Uuid::from_u128(1), Uuid::from_u128(2))
            .is_some());
        assert!(tree
            .characteristic(Uuid::from_u128(1), Uuid::from_u128(9))
            .is_none());
        assert!(tree
            .descriptor(
                Uuid::from_u128(1),
                Uuid::from_u128(2),
                CLIENT_CHARACTERISTIC_CONFIG
            )
            .is_some());
        assert!(tree
            .descriptor(Uuid::from_u128(1), Uuid::from_u128(2), Uuid::from_u128(9))
            .is_none());
    }

    #[test]
    fn test_empty_tree() {
        assert!(ServiceTree::default().is_empty());
    }
}
