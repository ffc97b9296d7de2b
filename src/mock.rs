//! Scripted transport and scan backend for tests.
//!
//! Deterministic stand-ins for the radio: connect attempts follow a
//! caller-supplied plan, GATT operations record themselves and return
//! programmed results, and a gate semaphore lets tests hold operations
//! in flight to observe queueing behavior.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Semaphore};
use uuid::Uuid;

use crate::config::WriteMode;
use crate::device::DeviceIdentity;
use crate::error::{Error, Result};
use crate::scanner::{BackendScanEvent, ScanBackend, ScannerKind};
use crate::transport::{
    AdapterState, Phy, PhyOptions, ServiceTree, Transport, TransportEvent, TransportHandle,
};

/// Route session logs to the test harness. Honors `RUST_LOG`; later calls
/// are no-ops.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What one planned connect attempt does.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ConnectPlan {
    /// Succeed with a fresh handle.
    Ok,
    /// Fail immediately.
    Fail,
    /// Never resolve (a link that never comes up).
    Hang,
}

pub(crate) struct MockTransport {
    adapter: RwLock<AdapterState>,
    adapter_tx: broadcast::Sender<AdapterState>,
    connect_plan: Mutex<VecDeque<ConnectPlan>>,
    connect_attempts: AtomicU32,
    services: RwLock<ServiceTree>,
    handles: Mutex<Vec<Arc<MockHandle>>>,
    connectable: AtomicBool,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        let (adapter_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            adapter: RwLock::new(AdapterState::On),
            adapter_tx,
            connect_plan: Mutex::new(VecDeque::new()),
            connect_attempts: AtomicU32::new(0),
            services: RwLock::new(ServiceTree::default()),
            handles: Mutex::new(Vec::new()),
            connectable: AtomicBool::new(true),
        })
    }

    /// Plan the outcomes of upcoming connect attempts. Unplanned attempts
    /// succeed.
    pub(crate) fn plan_connects(&self, plan: impl IntoIterator<Item = ConnectPlan>) {
        self.connect_plan.lock().extend(plan);
    }

    /// Service tree handed to every future handle.
    pub(crate) fn set_services(&self, tree: ServiceTree) {
        *self.services.write() = tree;
    }

    pub(crate) fn set_connectable(&self, connectable: bool) {
        self.connectable.store(connectable, Ordering::SeqCst);
    }

    pub(crate) fn set_adapter(&self, state: AdapterState) {
        *self.adapter.write() = state;
        let _ = self.adapter_tx.send(state);
    }

    pub(crate) fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn last_handle(&self) -> Option<Arc<MockHandle>> {
        self.handles.lock().last().cloned()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _identity: &DeviceIdentity) -> Result<Arc<dyn TransportHandle>> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let plan = self
            .connect_plan
            .lock()
            .pop_front()
            .unwrap_or(ConnectPlan::Ok);
        match plan {
            ConnectPlan::Ok => {
                let handle = MockHandle::new(self.services.read().clone());
                self.handles.lock().push(handle.clone());
                Ok(handle)
            }
            ConnectPlan::Fail => Err(Error::Internal("connect refused".into())),
            ConnectPlan::Hang => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    fn adapter_state(&self) -> AdapterState {
        *self.adapter.read()
    }

    fn adapter_events(&self) -> broadcast::Receiver<AdapterState> {
        self.adapter_tx.subscribe()
    }

    fn is_connectable(&self, _identity: &DeviceIdentity) -> bool {
        self.connectable.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight counter even when the operation future is
/// dropped by a timeout.
struct InFlightGuard<'a>(&'a MockHandle);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct MockHandle {
    services: RwLock<ServiceTree>,
    event_tx: broadcast::Sender<TransportEvent>,
    op_log: Mutex<Vec<String>>,
    gate_enabled: AtomicBool,
    gate: Semaphore,
    active: AtomicU32,
    max_active: AtomicU32,
    read_char_value: Mutex<Bytes>,
    read_desc_value: Mutex<Bytes>,
    write_char_results: Mutex<VecDeque<Result<()>>>,
    write_desc_results: Mutex<VecDeque<Result<()>>>,
    discover_results: Mutex<VecDeque<Result<ServiceTree>>>,
    refresh_result: AtomicBool,
    refresh_calls: AtomicU32,
    closed: AtomicBool,
}

impl MockHandle {
    fn new(services: ServiceTree) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            services: RwLock::new(services),
            event_tx,
            op_log: Mutex::new(Vec::new()),
            gate_enabled: AtomicBool::new(false),
            gate: Semaphore::new(0),
            active: AtomicU32::new(0),
            max_active: AtomicU32::new(0),
            read_char_value: Mutex::new(Bytes::new()),
            read_desc_value: Mutex::new(Bytes::new()),
            write_char_results: Mutex::new(VecDeque::new()),
            write_desc_results: Mutex::new(VecDeque::new()),
            discover_results: Mutex::new(VecDeque::new()),
            refresh_result: AtomicBool::new(false),
            refresh_calls: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Hold every subsequent GATT operation until a permit is released.
    pub(crate) fn enable_gate(&self) {
        self.gate_enabled.store(true, Ordering::SeqCst);
    }

    /// Let `n` gated operations proceed.
    pub(crate) fn release_gate(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub(crate) fn set_read_char_value(&self, value: impl Into<Bytes>) {
        *self.read_char_value.lock() = value.into();
    }

    pub(crate) fn set_read_desc_value(&self, value: impl Into<Bytes>) {
        *self.read_desc_value.lock() = value.into();
    }

    pub(crate) fn plan_char_writes(&self, results: impl IntoIterator<Item = Result<()>>) {
        self.write_char_results.lock().extend(results);
    }

    pub(crate) fn plan_desc_writes(&self, results: impl IntoIterator<Item = Result<()>>) {
        self.write_desc_results.lock().extend(results);
    }

    pub(crate) fn plan_discoveries(&self, results: impl IntoIterator<Item = Result<ServiceTree>>) {
        self.discover_results.lock().extend(results);
    }

    pub(crate) fn set_refresh_supported(&self, supported: bool) {
        self.refresh_result.store(supported, Ordering::SeqCst);
    }

    pub(crate) fn refresh_calls(&self) -> u32 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn inject(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn ops(&self) -> Vec<String> {
        self.op_log.lock().clone()
    }

    pub(crate) fn max_in_flight(&self) -> u32 {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn enter(&self, entry: String) -> InFlightGuard<'_> {
        self.op_log.lock().push(entry);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        let guard = InFlightGuard(self);
        if self.gate_enabled.load(Ordering::SeqCst) {
            let permit = self.gate.acquire().await.expect("gate closed");
            permit.forget();
        }
        guard
    }
}

#[async_trait]
impl TransportHandle for MockHandle {
    async fn discover_services(&self) -> Result<ServiceTree> {
        self.op_log.lock().push("discover".into());
        match self.discover_results.lock().pop_front() {
            Some(result) => result,
            None => Ok(self.services.read().clone()),
        }
    }

    async fn read_characteristic(&self, _service: Uuid, _characteristic: Uuid) -> Result<Bytes> {
        let _guard = self.enter("read_char".into()).await;
        Ok(self.read_char_value.lock().clone())
    }

    async fn write_characteristic(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
        value: Bytes,
        mode: WriteMode,
    ) -> Result<()> {
        let _guard = self
            .enter(format!("write_char:{}:{:?}", value.len(), mode))
            .await;
        self.write_char_results.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn read_descriptor(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
        _descriptor: Uuid,
    ) -> Result<Bytes> {
        let _guard = self.enter("read_desc".into()).await;
        Ok(self.read_desc_value.lock().clone())
    }

    async fn write_descriptor(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
        _descriptor: Uuid,
        value: Bytes,
    ) -> Result<()> {
        let _guard = self.enter(format!("write_desc:{:02x?}", &value[..])).await;
        self.write_desc_results.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn set_characteristic_notification(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
        enable: bool,
    ) -> Result<()> {
        self.op_log.lock().push(format!("notify_switch:{enable}"));
        Ok(())
    }

    async fn request_mtu(&self, mtu: u16) -> Result<u16> {
        let _guard = self.enter(format!("mtu:{mtu}")).await;
        Ok(mtu)
    }

    async fn read_rssi(&self) -> Result<i16> {
        let _guard = self.enter("rssi".into()).await;
        Ok(-50)
    }

    async fn read_phy(&self) -> Result<(Phy, Phy)> {
        let _guard = self.enter("read_phy".into()).await;
        Ok((Phy::Le1M, Phy::Le1M))
    }

    async fn set_preferred_phy(&self, options: PhyOptions) -> Result<(Phy, Phy)> {
        let _guard = self.enter("set_phy".into()).await;
        Ok((options.tx, options.rx))
    }

    async fn refresh_cache(&self) -> Result<bool> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.op_log.lock().push("refresh".into());
        Ok(self.refresh_result.load(Ordering::SeqCst))
    }

    async fn disconnect(&self) {
        self.op_log.lock().push("disconnect".into());
    }

    async fn close(&self) {
        self.op_log.lock().push("close".into());
        self.closed.store(true, Ordering::SeqCst);
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }
}

/// Scripted scan backend.
pub(crate) struct MockScanBackend {
    kind: ScannerKind,
    adapter_enabled: AtomicBool,
    ready: AtomicBool,
    connected: Mutex<Vec<DeviceIdentity>>,
    tx: Mutex<Option<mpsc::Sender<BackendScanEvent>>>,
    start_count: AtomicU32,
}

impl MockScanBackend {
    pub(crate) fn new(kind: ScannerKind) -> Self {
        Self {
            kind,
            adapter_enabled: AtomicBool::new(true),
            ready: AtomicBool::new(true),
            connected: Mutex::new(Vec::new()),
            tx: Mutex::new(None),
            start_count: AtomicU32::new(0),
        }
    }

    pub(crate) fn set_adapter_enabled(&self, enabled: bool) {
        self.adapter_enabled.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub(crate) fn set_connected_devices(&self, devices: Vec<DeviceIdentity>) {
        *self.connected.lock() = devices;
    }

    pub(crate) fn start_count(&self) -> u32 {
        self.start_count.load(Ordering::SeqCst)
    }

    /// Push a raw event into the running scan, if any.
    pub(crate) fn inject(&self, event: BackendScanEvent) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.try_send(event);
        }
    }
}

#[async_trait]
impl ScanBackend for MockScanBackend {
    fn kind(&self) -> ScannerKind {
        self.kind
    }

    fn adapter_enabled(&self) -> bool {
        self.adapter_enabled.load(Ordering::SeqCst)
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn start(&self) -> Result<mpsc::Receiver<BackendScanEvent>> {
        self.start_count.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        *self.tx.lock() = Some(tx);
        Ok(rx)
    }

    async fn stop(&self) {
        *self.tx.lock() = None;
    }

    async fn connected_devices(&self) -> Vec<DeviceIdentity> {
        self.connected.lock().clone()
    }
}
