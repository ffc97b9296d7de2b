//! btleplug-backed transport and scan backend.
//!
//! This is the production driver layer: [`BtleTransport`] opens links
//! through the first system adapter and [`BtleScanBackend`] feeds the
//! scanner from the adapter's discovery events. Everything above this
//! module is platform-agnostic and exercised against scripted transports
//! in tests; this file stays a thin translation onto btleplug.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Descriptor, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::WriteMode;
use crate::device::{DeviceIdentity, DeviceType};
use crate::error::{Error, Result};
use crate::scanner::{BackendScanEvent, ScanBackend, ScannerKind};
use crate::transport::{
    AdapterState, CharacteristicInfo, DescriptorInfo, Phy, PhyOptions, ServiceInfo, ServiceTree,
    Transport, TransportEvent, TransportHandle, CLIENT_CHARACTERISTIC_CONFIG,
    DISABLE_NOTIFICATION_VALUE,
};

/// Live sessions keyed by peripheral id, used to route adapter-level
/// disconnect events to the owning handle.
struct SessionEntry {
    token: u64,
    events: broadcast::Sender<TransportEvent>,
}

type SessionMap = Arc<RwLock<HashMap<String, SessionEntry>>>;

/// Transport driver over the first system Bluetooth adapter.
pub struct BtleTransport {
    adapter: Adapter,
    state: Arc<RwLock<AdapterState>>,
    adapter_tx: broadcast::Sender<AdapterState>,
    sessions: SessionMap,
    next_token: AtomicU64,
    pump: JoinHandle<()>,
}

impl BtleTransport {
    /// Open the first adapter on the system.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await.map_err(|_e| Error::BluetoothUnavailable)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(Error::Bluetooth)?
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;
        Self::with_adapter(adapter).await
    }

    /// Build a transport over a specific adapter.
    pub async fn with_adapter(adapter: Adapter) -> Result<Self> {
        let (adapter_tx, _) = broadcast::channel(16);
        let state = Arc::new(RwLock::new(AdapterState::On));
        let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));

        let mut events = adapter.events().await.map_err(Error::Bluetooth)?;
        let pump = tokio::spawn({
            let state = state.clone();
            let adapter_tx = adapter_tx.clone();
            let sessions = sessions.clone();
            async move {
                while let Some(event) = events.next().await {
                    match event {
                        CentralEvent::StateUpdate(central_state) => {
                            let next = match central_state {
                                CentralState::PoweredOn => AdapterState::On,
                                CentralState::PoweredOff => AdapterState::Off,
                                CentralState::Unknown => continue,
                            };
                            let changed = {
                                let mut current = state.write();
                                let changed = *current != next;
                                *current = next;
                                changed
                            };
                            if changed {
                                debug!(state = ?next, "adapter state changed");
                                let _ = adapter_tx.send(next);
                            }
                        }
                        CentralEvent::DeviceDisconnected(id) => {
                            let key = id.to_string();
                            if let Some(entry) = sessions.read().get(&key) {
                                debug!(peripheral = %key, "link lost");
                                let _ = entry
                                    .events
                                    .send(TransportEvent::ConnectionLost { status: None });
                            }
                        }
                        _ => {}
                    }
                }
            }
        });

        Ok(Self {
            adapter,
            state,
            adapter_tx,
            sessions,
            next_token: AtomicU64::new(0),
            pump,
        })
    }

    /// Build a scan backend sharing this transport's adapter.
    pub fn scan_backend(&self) -> BtleScanBackend {
        BtleScanBackend {
            adapter: self.adapter.clone(),
            state: self.state.clone(),
            scan_task: Mutex::new(None),
        }
    }

    async fn find_peripheral(&self, address: &str) -> Result<Option<Peripheral>> {
        let peripherals = self.adapter.peripherals().await.map_err(Error::Bluetooth)?;
        for peripheral in peripherals {
            if peripheral.id().to_string().eq_ignore_ascii_case(address)
                || peripheral.address().to_string().eq_ignore_ascii_case(address)
            {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }
}

impl Drop for BtleTransport {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl Transport for BtleTransport {
    async fn connect(&self, identity: &DeviceIdentity) -> Result<Arc<dyn TransportHandle>> {
        let peripheral = self
            .find_peripheral(&identity.address)
            .await?
            .ok_or_else(|| {
                Error::Internal(format!("peripheral {} not known to adapter", identity.address))
            })?;

        debug!(address = %identity.address, "connecting");
        peripheral.connect().await.map_err(Error::Bluetooth)?;

        let (event_tx, _) = broadcast::channel(64);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let key = peripheral.id().to_string();
        self.sessions.write().insert(
            key.clone(),
            SessionEntry {
                token,
                events: event_tx.clone(),
            },
        );

        let handle = BtleHandle {
            peripheral,
            key,
            token,
            sessions: self.sessions.clone(),
            event_tx,
            characteristics: RwLock::new(HashMap::new()),
            descriptors: RwLock::new(HashMap::new()),
            char_services: Arc::new(RwLock::new(HashMap::new())),
            notif_task: Mutex::new(None),
        };
        if let Err(error) = handle.start_notifications().await {
            warn!(%error, "notification stream unavailable");
        }
        Ok(Arc::new(handle))
    }

    fn adapter_state(&self) -> AdapterState {
        *self.state.read()
    }

    fn adapter_events(&self) -> broadcast::Receiver<AdapterState> {
        self.adapter_tx.subscribe()
    }

    fn is_connectable(&self, identity: &DeviceIdentity) -> bool {
        identity.device_type == DeviceType::Le && identity.has_valid_address()
    }
}

/// One established btleplug link.
pub struct BtleHandle {
    peripheral: Peripheral,
    key: String,
    token: u64,
    sessions: SessionMap,
    event_tx: broadcast::Sender<TransportEvent>,
    characteristics: RwLock<HashMap<(Uuid, Uuid), Characteristic>>,
    descriptors: RwLock<HashMap<(Uuid, Uuid, Uuid), Descriptor>>,
    char_services: Arc<RwLock<HashMap<Uuid, Uuid>>>,
    notif_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleHandle {
    async fn start_notifications(&self) -> Result<()> {
        let mut stream = self.peripheral.notifications().await.map_err(Error::Bluetooth)?;
        let event_tx = self.event_tx.clone();
        let char_services = self.char_services.clone();
        let task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                let service = char_services.read().get(&notification.uuid).copied();
                match service {
                    Some(service) => {
                        let _ = event_tx.send(TransportEvent::CharacteristicChanged {
                            service,
                            characteristic: notification.uuid,
                            value: Bytes::from(notification.value),
                        });
                    }
                    None => {
                        trace!(characteristic = %notification.uuid, "notification from unknown characteristic");
                    }
                }
            }
        });
        *self.notif_task.lock() = Some(task);
        Ok(())
    }

    fn find_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<Characteristic> {
        self.characteristics
            .read()
            .get(&(service, characteristic))
            .cloned()
            .ok_or_else(|| Error::CharacteristicNotExist {
                uuid: characteristic.to_string(),
            })
    }

    fn find_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<Descriptor> {
        self.descriptors
            .read()
            .get(&(service, characteristic, descriptor))
            .cloned()
            .ok_or_else(|| Error::DescriptorNotExist {
                uuid: descriptor.to_string(),
            })
    }
}

#[async_trait]
impl TransportHandle for BtleHandle {
    async fn discover_services(&self) -> Result<ServiceTree> {
        self.peripheral
            .discover_services()
            .await
            .map_err(Error::Bluetooth)?;

        let mut characteristics = HashMap::new();
        let mut descriptors = HashMap::new();
        let mut routing = HashMap::new();
        let mut services = Vec::new();

        for service in self.peripheral.services() {
            let mut characteristic_infos = Vec::new();
            for characteristic in &service.characteristics {
                routing.insert(characteristic.uuid, service.uuid);
                characteristics
                    .insert((service.uuid, characteristic.uuid), characteristic.clone());
                let mut descriptor_infos = Vec::new();
                for descriptor in &characteristic.descriptors {
                    descriptors.insert(
                        (service.uuid, characteristic.uuid, descriptor.uuid),
                        descriptor.clone(),
                    );
                    descriptor_infos.push(DescriptorInfo {
                        uuid: descriptor.uuid,
                    });
                }
                characteristic_infos.push(CharacteristicInfo {
                    uuid: characteristic.uuid,
                    descriptors: descriptor_infos,
                });
            }
            services.push(ServiceInfo {
                uuid: service.uuid,
                characteristics: characteristic_infos,
            });
        }

        debug!(services = services.len(), "services discovered");
        *self.characteristics.write() = characteristics;
        *self.descriptors.write() = descriptors;
        *self.char_services.write() = routing;
        Ok(ServiceTree::new(services))
    }

    async fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<Bytes> {
        let characteristic = self.find_characteristic(service, characteristic)?;
        let value = self
            .peripheral
            .read(&characteristic)
            .await
            .map_err(Error::Bluetooth)?;
        trace!(characteristic = %characteristic.uuid, len = value.len(), "read");
        Ok(Bytes::from(value))
    }

    async fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: Bytes,
        mode: WriteMode,
    ) -> Result<()> {
        let characteristic = self.find_characteristic(service, characteristic)?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        self.peripheral
            .write(&characteristic, &value, write_type)
            .await
            .map_err(Error::Bluetooth)?;
        trace!(characteristic = %characteristic.uuid, len = value.len(), "write");
        Ok(())
    }

    async fn read_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<Bytes> {
        let descriptor = self.find_descriptor(service, characteristic, descriptor)?;
        let value = self
            .peripheral
            .read_descriptor(&descriptor)
            .await
            .map_err(Error::Bluetooth)?;
        Ok(Bytes::from(value))
    }

    async fn write_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Bytes,
    ) -> Result<()> {
        // btleplug folds the CCC write into subscribe/unsubscribe.
        if descriptor == CLIENT_CHARACTERISTIC_CONFIG {
            let characteristic = self.find_characteristic(service, characteristic)?;
            return if value.as_ref() == &DISABLE_NOTIFICATION_VALUE[..] {
                self.peripheral
                    .unsubscribe(&characteristic)
                    .await
                    .map_err(Error::Bluetooth)
            } else {
                self.peripheral
                    .subscribe(&characteristic)
                    .await
                    .map_err(Error::Bluetooth)
            };
        }
        let descriptor = self.find_descriptor(service, characteristic, descriptor)?;
        self.peripheral
            .write_descriptor(&descriptor, &value)
            .await
            .map_err(Error::Bluetooth)
    }

    async fn set_characteristic_notification(
        &self,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<()> {
        // The client-side switch travels with the CCC descriptor write on
        // this platform, so only the existence check happens here.
        self.find_characteristic(service, characteristic)?;
        trace!(%characteristic, enable, "notification switch");
        Ok(())
    }

    async fn request_mtu(&self, _mtu: u16) -> Result<u16> {
        Err(Error::NotSupported {
            operation: "MTU negotiation".into(),
        })
    }

    async fn read_rssi(&self) -> Result<i16> {
        let properties = self
            .peripheral
            .properties()
            .await
            .map_err(Error::Bluetooth)?;
        properties
            .and_then(|p| p.rssi)
            .ok_or_else(|| Error::NotSupported {
                operation: "RSSI read".into(),
            })
    }

    async fn read_phy(&self) -> Result<(Phy, Phy)> {
        Err(Error::NotSupported {
            operation: "PHY read".into(),
        })
    }

    async fn set_preferred_phy(&self, _options: PhyOptions) -> Result<(Phy, Phy)> {
        Err(Error::NotSupported {
            operation: "PHY selection".into(),
        })
    }

    async fn disconnect(&self) {
        if let Err(error) = self.peripheral.disconnect().await {
            debug!(%error, "disconnect failed");
        }
    }

    async fn close(&self) {
        if let Some(task) = self.notif_task.lock().take() {
            task.abort();
        }
        if let Err(error) = self.peripheral.disconnect().await {
            trace!(%error, "disconnect during close failed");
        }
        // A newer session may have replaced our entry already.
        let mut sessions = self.sessions.write();
        if sessions.get(&self.key).map(|entry| entry.token) == Some(self.token) {
            sessions.remove(&self.key);
        }
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }
}

/// LE discovery over a btleplug adapter.
pub struct BtleScanBackend {
    adapter: Adapter,
    state: Arc<RwLock<AdapterState>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

async fn identity_of(adapter: &Adapter, id: &PeripheralId) -> Option<DeviceIdentity> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let mut identity = DeviceIdentity::new(peripheral.address().to_string());
    if let Some(properties) = peripheral.properties().await.ok().flatten() {
        if let Some(name) = properties.local_name {
            identity = identity.with_name(name);
        }
        if let Some(rssi) = properties.rssi {
            identity = identity.with_rssi(rssi);
        }
    }
    Some(identity)
}

#[async_trait]
impl ScanBackend for BtleScanBackend {
    fn kind(&self) -> ScannerKind {
        ScannerKind::Le
    }

    fn adapter_enabled(&self) -> bool {
        self.state.read().is_on()
    }

    async fn start(&self) -> Result<mpsc::Receiver<BackendScanEvent>> {
        let mut events = self.adapter.events().await.map_err(Error::Bluetooth)?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(Error::Bluetooth)?;
        debug!("scan started");

        let (tx, rx) = mpsc::channel(64);
        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Some(identity) = identity_of(&adapter, &id).await else {
                    continue;
                };
                if tx
                    .send(BackendScanEvent::Discovered { identity })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        *self.scan_task.lock() = Some(task);
        Ok(rx)
    }

    async fn stop(&self) {
        if let Some(task) = self.scan_task.lock().take() {
            task.abort();
        }
        if let Err(error) = self.adapter.stop_scan().await {
            debug!(%error, "stop scan failed");
        }
    }

    async fn connected_devices(&self) -> Vec<DeviceIdentity> {
        let Ok(peripherals) = self.adapter.peripherals().await else {
            return Vec::new();
        };
        let mut connected = Vec::new();
        for peripheral in peripherals {
            if peripheral.is_connected().await.unwrap_or(false) {
                connected.push(DeviceIdentity::new(peripheral.address().to_string()));
            }
        }
        connected
    }
}
