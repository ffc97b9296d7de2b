//! Per-device connection sessions.
//!
//! Each session is an actor: one task owns the whole connection state
//! machine and consumes a message queue fed by the public handle, the
//! transport event pump, the scanner, and the session's own timers. A
//! 500ms supervisor tick raises connect timeouts and drives automatic
//! reconnection, so no callback ever mutates session state directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ConnectionConfiguration;
use crate::device::DeviceIdentity;
use crate::error::{
    ConnectFailReason, ConnectTimeoutReason, Error, RequestFailReason, Result,
};
use crate::event::{EventBus, EventObserver, SessionEvent};
use crate::request::{Request, RequestKind, RequestValue};
use crate::scanner::{ScanEvent, Scanner};
use crate::scheduler::{DispatchContext, RequestScheduler, Resolution};
use crate::transport::{
    ServiceTree, Transport, TransportEvent, TransportHandle, DEFAULT_MTU,
    DISABLE_NOTIFICATION_VALUE, STALE_CACHE_STATUS,
};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// A link attempt is in progress.
    Connecting,
    /// The link is up; service discovery has not started yet.
    Connected,
    /// Service discovery is running.
    ServiceDiscovering,
    /// Services are discovered; requests are accepted and executed.
    Ready,
    /// No link. Reconnection may be pending.
    Disconnected,
    /// Scanning for the device to reappear before reconnecting.
    ScanningForReconnection,
    /// Terminal. The session accepts nothing and emits nothing.
    Released,
}

impl SessionState {
    /// True for any state with an established link.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::ServiceDiscovering | Self::Ready)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::ServiceDiscovering => "service discovering",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
            Self::ScanningForReconnection => "scanning for reconnection",
            Self::Released => "released",
        };
        f.write_str(name)
    }
}

/// Session state readable without going through the actor queue.
pub(crate) struct SessionShared {
    pub(crate) state: parking_lot::RwLock<SessionState>,
    pub(crate) mtu: parking_lot::RwLock<u16>,
    pub(crate) services: parking_lot::RwLock<ServiceTree>,
    pub(crate) ccc: parking_lot::RwLock<HashMap<(Uuid, Uuid), [u8; 2]>>,
}

impl SessionShared {
    pub(crate) fn new() -> Self {
        Self {
            state: parking_lot::RwLock::new(SessionState::Disconnected),
            mtu: parking_lot::RwLock::new(DEFAULT_MTU),
            services: parking_lot::RwLock::new(ServiceTree::default()),
            ccc: parking_lot::RwLock::new(HashMap::new()),
        }
    }
}

/// Everything the actor consumes, in arrival order.
pub(crate) enum SessionMessage {
    Connect,
    UserDisconnect,
    Reconnect,
    Refresh,
    Enqueue(Request),
    ClearQueue,
    ClearQueueByKind(RequestKind),
    ConnectResult(Result<Arc<dyn TransportHandle>>),
    DiscoverServices,
    ServicesDiscovered(Result<ServiceTree>),
    RequestFinished {
        id: u64,
        result: std::result::Result<RequestValue, RequestFailReason>,
    },
    RefreshResult(bool),
    CancelRefresh,
    Transport(TransportEvent),
    Scan(ScanEvent),
    Release {
        quiet: bool,
        done: Option<oneshot::Sender<()>>,
    },
}

/// Supervisor cadence for timeouts and reconnection.
const SUPERVISOR_TICK: Duration = Duration::from_millis(500);
/// Settle delay between entering `Connecting` and issuing the transport
/// connect.
const CONNECT_DISPATCH_DELAY: Duration = Duration::from_millis(500);
/// Stale-cache refreshes attempted before giving up on the cycle.
const REFRESH_LIMIT: u32 = 5;
/// How long the refreshing flag suppresses the supervisor after a
/// successful cache refresh.
const REFRESH_SETTLE: Duration = Duration::from_secs(2);

/// Cloneable public face of one session.
#[derive(Clone)]
pub struct SessionHandle {
    identity: DeviceIdentity,
    config: Arc<ConnectionConfiguration>,
    tx: mpsc::UnboundedSender<SessionMessage>,
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    /// The device this session manages.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// The session's configuration.
    pub fn config(&self) -> &ConnectionConfiguration {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.shared.state.read()
    }

    /// True when requests are accepted and executed.
    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Negotiated ATT MTU, or the default before negotiation.
    pub fn mtu(&self) -> u16 {
        *self.shared.mtu.read()
    }

    /// The discovered service tree. Empty until discovery completes.
    pub fn services(&self) -> ServiceTree {
        self.shared.services.read().clone()
    }

    /// Whether notifications or indications are enabled for a
    /// characteristic, per the last CCC value the device acknowledged.
    pub fn is_notification_enabled(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.shared
            .ccc
            .read()
            .get(&(service, characteristic))
            .map_or(false, |value| *value != DISABLE_NOTIFICATION_VALUE)
    }

    /// Submit a request. The receiver resolves exactly once with the
    /// outcome; a closed receiver means the request was silently dropped
    /// by a queue clear or the session went away.
    pub fn enqueue(&self, mut request: Request) -> oneshot::Receiver<Result<RequestValue>> {
        let (sink, receiver) = oneshot::channel();
        request.sink = Some(sink);
        if let Err(mpsc::error::SendError(message)) = self.tx.send(SessionMessage::Enqueue(request))
        {
            if let SessionMessage::Enqueue(mut request) = message {
                if let Some(sink) = request.sink.take() {
                    let _ = sink.send(Err(Error::ConnectionReleased));
                }
            }
        }
        receiver
    }

    /// Submit a request and wait for its outcome.
    pub async fn execute(&self, request: Request) -> Result<RequestValue> {
        match self.enqueue(request).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::RequestDropped),
        }
    }

    /// Disconnect and stay down: automatic reconnection is suppressed
    /// until [`reconnect`](Self::reconnect) or a fresh connect.
    pub fn disconnect(&self) {
        let _ = self.tx.send(SessionMessage::UserDisconnect);
    }

    /// Drop the link and reconnect with fresh retry counters.
    pub fn reconnect(&self) {
        let _ = self.tx.send(SessionMessage::Reconnect);
    }

    /// Drop the platform's service cache and rediscover on the next
    /// connection cycle.
    pub fn refresh(&self) {
        let _ = self.tx.send(SessionMessage::Refresh);
    }

    /// Drop all pending requests without resolving them.
    pub fn clear_queue(&self) {
        let _ = self.tx.send(SessionMessage::ClearQueue);
    }

    /// Drop pending requests of one kind without resolving them.
    pub fn clear_queue_by_kind(&self, kind: RequestKind) {
        let _ = self.tx.send(SessionMessage::ClearQueueByKind(kind));
    }

    /// Tear the session down. Pending requests fail with
    /// `ConnectionReleased`; the final `Released` state event is
    /// suppressed when `quiet`.
    pub(crate) async fn release(&self, quiet: bool) {
        let (done, ack) = oneshot::channel();
        if self
            .tx
            .send(SessionMessage::Release {
                quiet,
                done: Some(done),
            })
            .is_ok()
        {
            let _ = ack.await;
        }
    }
}

/// Start a session actor. The first connect attempt fires after
/// `connect_delay`.
pub(crate) fn spawn_session(
    identity: DeviceIdentity,
    config: Arc<ConnectionConfiguration>,
    transport: Arc<dyn Transport>,
    scanner: Scanner,
    bus: Arc<EventBus>,
    observer: Option<EventObserver>,
    connect_delay: Duration,
) -> SessionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(SessionShared::new());

    let scan_forward_task = {
        let mut scan_rx = scanner.subscribe();
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match scan_rx.recv().await {
                    Ok(event) => {
                        if tx.send(SessionMessage::Scan(event)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    {
        let tx = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(connect_delay).await;
            let _ = tx.send(SessionMessage::Connect);
        });
    }

    let handle = SessionHandle {
        identity: identity.clone(),
        config: config.clone(),
        tx: tx.clone(),
        shared: shared.clone(),
    };

    let actor = SessionActor {
        identity,
        config,
        transport,
        scanner,
        bus,
        observer,
        shared,
        tx,
        scheduler: RequestScheduler::new(),
        handle: None,
        state: SessionState::Disconnected,
        last_emitted_state: None,
        conn_start: Instant::now(),
        last_scan_stop: None,
        immediate_reconnect_count: 0,
        total_reconnect_count: 0,
        refresh_count: 0,
        refreshing: false,
        budget_exhaustion_reported: false,
        active_disconnect: false,
        released: false,
        mtu: DEFAULT_MTU,
        connect_task: None,
        pump_task: None,
        discover_timer: None,
        discover_task: None,
        refresh_task: None,
        refresh_timer: None,
        scan_forward_task: Some(scan_forward_task),
    };
    tokio::spawn(actor.run(rx, connect_delay));

    handle
}

struct SessionActor {
    identity: DeviceIdentity,
    config: Arc<ConnectionConfiguration>,
    transport: Arc<dyn Transport>,
    scanner: Scanner,
    bus: Arc<EventBus>,
    observer: Option<EventObserver>,
    shared: Arc<SessionShared>,
    tx: mpsc::UnboundedSender<SessionMessage>,
    scheduler: RequestScheduler,
    handle: Option<Arc<dyn TransportHandle>>,
    state: SessionState,
    last_emitted_state: Option<SessionState>,
    conn_start: Instant,
    last_scan_stop: Option<Instant>,
    immediate_reconnect_count: u32,
    total_reconnect_count: u32,
    refresh_count: u32,
    refreshing: bool,
    budget_exhaustion_reported: bool,
    active_disconnect: bool,
    released: bool,
    mtu: u16,
    connect_task: Option<tokio::task::JoinHandle<()>>,
    pump_task: Option<tokio::task::JoinHandle<()>>,
    discover_timer: Option<tokio::task::JoinHandle<()>>,
    discover_task: Option<tokio::task::JoinHandle<()>>,
    refresh_task: Option<tokio::task::JoinHandle<()>>,
    refresh_timer: Option<tokio::task::JoinHandle<()>>,
    scan_forward_task: Option<tokio::task::JoinHandle<()>>,
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionMessage>, connect_delay: Duration) {
        // The first tick waits out the connect delay so a freshly spawned
        // session is not reconnected before its first attempt.
        let mut tick = tokio::time::interval_at(
            tokio::time::Instant::now() + connect_delay + SUPERVISOR_TICK,
            SUPERVISOR_TICK,
        );
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => {
                        if self.handle_message(message).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => self.supervisor_tick().await,
            }
        }
    }

    /// Returns true when the actor should shut down.
    async fn handle_message(&mut self, message: SessionMessage) -> bool {
        match message {
            SessionMessage::Connect => {
                if !self.released && self.transport.adapter_state().is_on() {
                    self.do_connect();
                }
            }
            SessionMessage::UserDisconnect => {
                if !self.released {
                    self.active_disconnect = true;
                    self.do_disconnect(false).await;
                }
            }
            SessionMessage::Reconnect => {
                if !self.released {
                    self.active_disconnect = false;
                    self.immediate_reconnect_count = 0;
                    self.total_reconnect_count = 0;
                    self.budget_exhaustion_reported = false;
                    let reconnect = self.transport.adapter_state().is_on();
                    self.do_disconnect(reconnect).await;
                }
            }
            SessionMessage::Refresh => {
                if !self.released {
                    self.scheduler.clear_queue();
                    self.do_refresh();
                }
            }
            SessionMessage::Enqueue(request) => {
                let ctx = self.ctx();
                let resolutions = self.scheduler.enqueue(request, &ctx);
                self.emit_resolutions(resolutions);
            }
            SessionMessage::ClearQueue => self.scheduler.clear_queue(),
            SessionMessage::ClearQueueByKind(kind) => self.scheduler.clear_queue_by_kind(kind),
            SessionMessage::ConnectResult(result) => self.on_connect_result(result),
            SessionMessage::DiscoverServices => self.on_discover_services(),
            SessionMessage::ServicesDiscovered(result) => self.on_services_discovered(result),
            SessionMessage::RequestFinished { id, result } => {
                let ctx = self.ctx();
                let resolutions = self.scheduler.on_finished(id, result, &ctx);
                for resolution in &resolutions {
                    if let Ok(RequestValue::Mtu(mtu)) = resolution.outcome {
                        self.mtu = mtu;
                        *self.shared.mtu.write() = mtu;
                    }
                }
                self.emit_resolutions(resolutions);
            }
            SessionMessage::RefreshResult(refreshed) => {
                self.refresh_task = None;
                if refreshed {
                    debug!(address = %self.identity.address, "service cache dropped");
                    let tx = self.tx.clone();
                    self.refresh_timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(REFRESH_SETTLE).await;
                        let _ = tx.send(SessionMessage::CancelRefresh);
                    }));
                } else {
                    self.refreshing = false;
                    self.close_handle();
                }
            }
            SessionMessage::CancelRefresh => self.cancel_refresh(),
            SessionMessage::Transport(event) => self.on_transport_event(event).await,
            SessionMessage::Scan(event) => self.on_scan_event(event).await,
            SessionMessage::Release { quiet, done } => {
                self.do_release(quiet).await;
                if let Some(done) = done {
                    let _ = done.send(());
                }
                return true;
            }
        }
        false
    }

    fn ctx(&self) -> DispatchContext {
        DispatchContext {
            handle: self.handle.clone(),
            adapter_on: self.transport.adapter_state().is_on(),
            config: self.config.clone(),
            mtu: self.mtu,
            shared: self.shared.clone(),
            tx: self.tx.clone(),
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(observer) = &self.observer {
            observer(&event);
        }
        self.bus.publish(event);
    }

    fn emit_resolutions(&mut self, resolutions: Vec<Resolution>) {
        for resolution in resolutions {
            match resolution.outcome {
                Ok(value) => self.emit(SessionEvent::RequestCompleted {
                    identity: self.identity.clone(),
                    kind: resolution.kind,
                    value,
                }),
                Err(reason) => self.emit(SessionEvent::RequestFailed {
                    identity: self.identity.clone(),
                    kind: resolution.kind,
                    reason,
                }),
            }
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(address = %self.identity.address, from = %self.state, to = %state, "state changed");
        }
        self.state = state;
        *self.shared.state.write() = state;
    }

    /// Emit the current state, suppressing consecutive duplicates.
    fn emit_state(&mut self) {
        if self.last_emitted_state != Some(self.state) {
            self.last_emitted_state = Some(self.state);
            self.emit(SessionEvent::ConnectionStateChanged {
                identity: self.identity.clone(),
                state: self.state,
            });
        }
    }

    fn do_connect(&mut self) {
        self.cancel_refresh();
        self.active_disconnect = false;
        self.set_state(SessionState::Connecting);
        self.emit_state();
        info!(address = %self.identity.address, "connecting");

        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        let transport = self.transport.clone();
        let scanner = self.scanner.clone();
        let identity = self.identity.clone();
        let tx = self.tx.clone();
        self.connect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(CONNECT_DISPATCH_DELAY).await;
            scanner.stop(false).await;
            let result = transport.connect(&identity).await;
            let _ = tx.send(SessionMessage::ConnectResult(result));
        }));
    }

    fn on_connect_result(&mut self, result: Result<Arc<dyn TransportHandle>>) {
        self.connect_task = None;
        let handle = match result {
            Ok(handle) => handle,
            Err(error) => {
                warn!(address = %self.identity.address, "connect attempt failed: {error}");
                let resolutions = self
                    .scheduler
                    .fail_all(RequestFailReason::ConnectionDisconnected);
                self.emit_resolutions(resolutions);
                self.notify_disconnected();
                return;
            }
        };
        if self.released {
            tokio::spawn(async move {
                handle.close().await;
            });
            return;
        }

        let mut events = handle.events();
        let tx = self.tx.clone();
        self.pump_task = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if tx.send(SessionMessage::Transport(event)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
        self.handle = Some(handle);
        self.set_state(SessionState::Connected);
        self.emit_state();
        info!(address = %self.identity.address, "link established");

        let delay = self.config.discover_services_delay;
        let tx = self.tx.clone();
        self.discover_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SessionMessage::DiscoverServices);
        }));
    }

    fn on_discover_services(&mut self) {
        self.discover_timer = None;
        if self.released {
            return;
        }
        let handle = match &self.handle {
            Some(handle) if self.transport.adapter_state().is_on() => handle.clone(),
            _ => {
                self.notify_disconnected();
                return;
            }
        };
        self.set_state(SessionState::ServiceDiscovering);
        self.emit_state();
        let tx = self.tx.clone();
        self.discover_task = Some(tokio::spawn(async move {
            let result = handle.discover_services().await;
            let _ = tx.send(SessionMessage::ServicesDiscovered(result));
        }));
    }

    fn on_services_discovered(&mut self, result: Result<ServiceTree>) {
        self.discover_task = None;
        if self.released {
            return;
        }
        match result {
            Ok(tree) if !tree.is_empty() => {
                *self.shared.services.write() = tree;
                self.refresh_count = 0;
                self.immediate_reconnect_count = 0;
                self.total_reconnect_count = 0;
                self.budget_exhaustion_reported = false;
                self.set_state(SessionState::Ready);
                self.emit_state();
                info!(address = %self.identity.address, "services discovered, session ready");
            }
            Ok(_) => {
                warn!(address = %self.identity.address, "discovery returned no services");
                self.clear_queue_and_refresh();
            }
            Err(error) => {
                warn!(address = %self.identity.address, "service discovery failed: {error}");
                self.clear_queue_and_refresh();
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        if self.released {
            return;
        }
        match event {
            TransportEvent::ConnectionLost { status } => {
                warn!(address = %self.identity.address, ?status, "connection lost");
                if status == Some(STALE_CACHE_STATUS) {
                    self.clear_queue_and_refresh();
                } else {
                    let resolutions = self
                        .scheduler
                        .fail_all(RequestFailReason::ConnectionDisconnected);
                    self.emit_resolutions(resolutions);
                    self.notify_disconnected();
                }
            }
            TransportEvent::CharacteristicChanged {
                service,
                characteristic,
                value,
            } => {
                self.emit(SessionEvent::CharacteristicChanged {
                    identity: self.identity.clone(),
                    service,
                    characteristic,
                    value,
                });
            }
        }
    }

    async fn on_scan_event(&mut self, event: ScanEvent) {
        match event {
            ScanEvent::Stopped => self.last_scan_stop = Some(Instant::now()),
            ScanEvent::Result { identity, .. } => {
                if !self.released
                    && identity == self.identity
                    && self.state == SessionState::ScanningForReconnection
                    && self.transport.adapter_state().is_on()
                {
                    info!(address = %identity.address, "device found, reconnecting");
                    self.do_connect();
                }
            }
            ScanEvent::Started | ScanEvent::Error { .. } => {}
        }
    }

    /// Timeout classification and reconnection, on the supervisor cadence.
    async fn supervisor_tick(&mut self) {
        if self.released || self.refreshing || self.active_disconnect {
            return;
        }
        match self.state {
            SessionState::Ready | SessionState::Released => {}
            SessionState::Disconnected => {
                if !self.config.auto_reconnect {
                    return;
                }
                if self.reconnect_budget_left() {
                    self.do_disconnect(true).await;
                } else {
                    // Fast-failing attempts consume the budget without ever
                    // reaching the timeout arm; the abandonment still has to
                    // be reported, once.
                    self.report_budget_exhausted();
                }
            }
            _ => {
                if self.conn_start.elapsed() <= self.config.connect_timeout {
                    return;
                }
                self.conn_start = Instant::now();
                let reason = match self.state {
                    SessionState::ScanningForReconnection => ConnectTimeoutReason::DeviceNotFound,
                    SessionState::Connecting => ConnectTimeoutReason::NotConnected,
                    _ => ConnectTimeoutReason::ServicesNotDiscovered,
                };
                warn!(address = %self.identity.address, ?reason, "connect timeout");
                self.emit(SessionEvent::ConnectTimeout {
                    identity: self.identity.clone(),
                    reason,
                });

                if self.config.auto_reconnect && self.reconnect_budget_left() {
                    self.do_disconnect(true).await;
                } else {
                    self.do_disconnect(false).await;
                    self.report_budget_exhausted();
                }
            }
        }
    }

    fn reconnect_budget_left(&self) -> bool {
        self.config
            .reconnect_max
            .map_or(true, |max| self.total_reconnect_count < max)
    }

    /// Report that reconnection has been abandoned. Emitted once per
    /// exhaustion; a successful connection or an explicit reconnect arms
    /// it again.
    fn report_budget_exhausted(&mut self) {
        if self.budget_exhaustion_reported {
            return;
        }
        self.budget_exhaustion_reported = true;
        error!(address = %self.identity.address, "reconnection budget exhausted");
        self.emit(SessionEvent::ConnectFailed {
            identity: self.identity.clone(),
            reason: ConnectFailReason::MaximumReconnection,
        });
    }

    /// Tear the link down and, when asked, start the next reconnection
    /// step: immediate retry while budget remains, otherwise scan-based
    /// reconnection once the backoff table permits it.
    async fn do_disconnect(&mut self, reconnect: bool) {
        let resolutions = self
            .scheduler
            .fail_all(RequestFailReason::ConnectionDisconnected);
        self.emit_resolutions(resolutions);
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if let Some(task) = self.discover_timer.take() {
            task.abort();
        }
        if let Some(task) = self.discover_task.take() {
            task.abort();
        }
        self.close_handle();
        self.set_state(SessionState::Disconnected);

        if reconnect && !self.released && self.transport.adapter_state().is_on() {
            if self.immediate_reconnect_count < self.config.reconnect_immediately_max {
                self.immediate_reconnect_count += 1;
                self.total_reconnect_count += 1;
                self.conn_start = Instant::now();
                self.do_connect();
                return;
            } else if self.scan_reconnect_allowed() {
                self.try_scan_reconnect().await;
                return;
            }
        }
        self.emit_state();
    }

    fn scan_reconnect_allowed(&self) -> bool {
        let elapsed = self
            .last_scan_stop
            .map_or(Duration::MAX, |at| at.elapsed());
        self.config
            .scan_reconnect_allowed(self.total_reconnect_count, elapsed)
    }

    async fn try_scan_reconnect(&mut self) {
        if self.released {
            return;
        }
        self.conn_start = Instant::now();
        self.scanner.stop(false).await;
        self.set_state(SessionState::ScanningForReconnection);
        self.emit_state();
        info!(address = %self.identity.address, "scanning for reconnection");
        self.scanner.start().await;
    }

    /// Silent state update plus event, for plain link-loss paths.
    fn notify_disconnected(&mut self) {
        self.set_state(SessionState::Disconnected);
        self.emit_state();
    }

    fn clear_queue_and_refresh(&mut self) {
        self.scheduler.clear_queue();
        if self.refresh_count < REFRESH_LIMIT {
            self.refresh_count += 1;
            self.do_refresh();
        } else {
            self.close_handle();
            self.notify_disconnected();
        }
    }

    /// Ask the transport to drop its service cache. The refreshing flag
    /// suppresses the supervisor until the refresh settles or fails.
    fn do_refresh(&mut self) {
        match self.handle.clone() {
            Some(handle) => {
                self.refreshing = true;
                let tx = self.tx.clone();
                self.refresh_task = Some(tokio::spawn(async move {
                    let refreshed = handle.refresh_cache().await.unwrap_or(false);
                    let _ = tx.send(SessionMessage::RefreshResult(refreshed));
                }));
            }
            None => self.refreshing = false,
        }
        self.notify_disconnected();
    }

    fn cancel_refresh(&mut self) {
        self.refreshing = false;
        if let Some(task) = self.refresh_timer.take() {
            task.abort();
        }
        if let Some(task) = self.refresh_task.take() {
            task.abort();
        }
    }

    fn close_handle(&mut self) {
        if let Some(task) = self.pump_task.take() {
            task.abort();
        }
        if let Some(handle) = self.handle.take() {
            tokio::spawn(async move {
                handle.disconnect().await;
                handle.close().await;
            });
        }
    }

    async fn do_release(&mut self, quiet: bool) {
        if self.released {
            return;
        }
        self.released = true;
        self.cancel_refresh();
        for task in [
            self.connect_task.take(),
            self.discover_timer.take(),
            self.discover_task.take(),
            self.pump_task.take(),
            self.scan_forward_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }

        let resolutions = self.scheduler.fail_all(RequestFailReason::ConnectionReleased);
        self.emit_resolutions(resolutions);

        if let Some(handle) = self.handle.take() {
            handle.disconnect().await;
            handle.close().await;
        }
        self.set_state(SessionState::Released);
        if quiet {
            self.last_emitted_state = Some(SessionState::Released);
        } else {
            self.emit_state();
        }
        info!(address = %self.identity.address, "session released");
    }
}
