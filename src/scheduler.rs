//! Serialized GATT request execution.
//!
//! One scheduler per session. Requests wait in a priority queue; at most
//! one is in flight against the transport at any time. The in-flight
//! operation runs on its own task and reports back to the session actor
//! as a message, so the actor never blocks on the radio.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::config::ConnectionConfiguration;
use crate::error::{Error, RequestFailReason};
use crate::request::{insert_by_priority, split_chunks, Request, RequestKind, RequestOp, RequestValue};
use crate::session::{SessionMessage, SessionShared};
use crate::transport::{
    TransportHandle, CLIENT_CHARACTERISTIC_CONFIG, DISABLE_NOTIFICATION_VALUE,
    ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
};

/// Everything a dispatch needs from the session actor's current state.
pub(crate) struct DispatchContext {
    pub handle: Option<Arc<dyn TransportHandle>>,
    pub adapter_on: bool,
    pub config: Arc<ConnectionConfiguration>,
    pub mtu: u16,
    pub shared: Arc<SessionShared>,
    pub tx: mpsc::UnboundedSender<SessionMessage>,
}

/// A resolved request, reported so the session can publish it as an event.
pub(crate) struct Resolution {
    pub kind: RequestKind,
    pub outcome: Result<RequestValue, RequestFailReason>,
}

struct CurrentRequest {
    id: u64,
    kind: RequestKind,
    sink: Option<crate::request::RequestSink>,
    task: tokio::task::JoinHandle<()>,
}

/// Priority queue plus the single in-flight request.
pub(crate) struct RequestScheduler {
    queue: VecDeque<Request>,
    current: Option<CurrentRequest>,
    next_id: u64,
}

impl RequestScheduler {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            current: None,
            next_id: 0,
        }
    }

    #[cfg(test)]
    fn has_current(&self) -> bool {
        self.current.is_some()
    }

    #[cfg(test)]
    fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Accept a request: pre-flight it against the service tree, resolve
    /// its write policy, and queue or dispatch it.
    pub(crate) fn enqueue(
        &mut self,
        mut request: Request,
        ctx: &DispatchContext,
    ) -> Vec<Resolution> {
        if ctx.handle.is_none() {
            return vec![resolve_failed(request, RequestFailReason::TransportUnavailable)];
        }
        if let Some(reason) = preflight(&request.op, ctx) {
            return vec![resolve_failed(request, reason)];
        }

        if request.write_options.is_none() {
            if let RequestOp::WriteCharacteristic {
                service,
                characteristic,
                ..
            } = &request.op
            {
                request.write_options = ctx
                    .config
                    .default_write_options(*service, *characteristic)
                    .cloned();
            }
        }

        self.next_id += 1;
        request.id = self.next_id;
        insert_by_priority(&mut self.queue, request);

        if self.current.is_none() {
            self.advance(ctx)
        } else {
            Vec::new()
        }
    }

    /// Handle the completion message of the in-flight request and start the
    /// next one. Completions of requests that were cleared in the meantime
    /// are ignored.
    pub(crate) fn on_finished(
        &mut self,
        id: u64,
        result: Result<RequestValue, RequestFailReason>,
        ctx: &DispatchContext,
    ) -> Vec<Resolution> {
        let mut current = match self.current.take() {
            Some(current) if current.id == id => current,
            other => {
                self.current = other;
                return Vec::new();
            }
        };

        if let Some(sink) = current.sink.take() {
            let _ = sink.send(result.clone().map_err(Error::from));
        }
        let mut resolutions = vec![Resolution {
            kind: current.kind,
            outcome: result,
        }];
        resolutions.extend(self.advance(ctx));
        resolutions
    }

    /// Drop everything without resolving sinks. Waiting callers observe a
    /// closed channel.
    pub(crate) fn clear_queue(&mut self) {
        if let Some(current) = self.current.take() {
            current.task.abort();
        }
        self.queue.clear();
    }

    /// Drop queued requests of one kind. A matching in-flight request is
    /// dropped too; its successor starts on the next enqueue or completion.
    pub(crate) fn clear_queue_by_kind(&mut self, kind: RequestKind) {
        self.queue.retain(|queued| queued.kind() != kind);
        if self.current.as_ref().map_or(false, |c| c.kind == kind) {
            if let Some(current) = self.current.take() {
                current.task.abort();
            }
        }
    }

    /// Fail the in-flight request and every queued one with `reason`.
    pub(crate) fn fail_all(&mut self, reason: RequestFailReason) -> Vec<Resolution> {
        let mut resolutions = Vec::new();
        if let Some(mut current) = self.current.take() {
            current.task.abort();
            if let Some(sink) = current.sink.take() {
                let _ = sink.send(Err(reason.into()));
            }
            resolutions.push(Resolution {
                kind: current.kind,
                outcome: Err(reason),
            });
        }
        for request in self.queue.drain(..) {
            resolutions.push(resolve_failed(request, reason));
        }
        resolutions
    }

    /// Pop queued requests until one dispatches cleanly, failing the ones
    /// that no longer can.
    fn advance(&mut self, ctx: &DispatchContext) -> Vec<Resolution> {
        let mut failures = Vec::new();
        while let Some(mut request) = self.queue.pop_front() {
            if !ctx.adapter_on {
                failures.push(resolve_failed(request, RequestFailReason::AdapterDisabled));
                continue;
            }
            let handle = match &ctx.handle {
                Some(handle) => handle.clone(),
                None => {
                    failures.push(resolve_failed(
                        request,
                        RequestFailReason::TransportUnavailable,
                    ));
                    continue;
                }
            };

            let id = request.id;
            let kind = request.kind();
            let op = request.op.clone();
            let options = request.write_options.take();
            let sink = request.sink.take();
            let timeout = ctx.config.request_timeout;
            let mtu = ctx.mtu;
            let shared = ctx.shared.clone();
            let tx = ctx.tx.clone();

            trace!(?kind, id, "request dispatched");
            let task = tokio::spawn(async move {
                let result = run_operation(op, options, handle, timeout, mtu, shared).await;
                let _ = tx.send(SessionMessage::RequestFinished { id, result });
            });
            self.current = Some(CurrentRequest {
                id,
                kind,
                sink,
                task,
            });
            break;
        }
        failures
    }
}

fn resolve_failed(mut request: Request, reason: RequestFailReason) -> Resolution {
    let kind = request.kind();
    debug!(?kind, ?reason, "request failed");
    if let Some(sink) = request.sink.take() {
        let _ = sink.send(Err(reason.into()));
    }
    Resolution {
        kind,
        outcome: Err(reason),
    }
}

/// Check that the operation's target exists in the discovered service tree.
fn preflight(op: &RequestOp, ctx: &DispatchContext) -> Option<RequestFailReason> {
    let services = ctx.shared.services.read();
    let check_characteristic = |service: uuid::Uuid, characteristic: uuid::Uuid| {
        if services.service(service).is_none() {
            Some(RequestFailReason::ServiceNotExist)
        } else if services.characteristic(service, characteristic).is_none() {
            Some(RequestFailReason::CharacteristicNotExist)
        } else {
            None
        }
    };
    match op {
        RequestOp::ReadCharacteristic {
            service,
            characteristic,
        }
        | RequestOp::WriteCharacteristic {
            service,
            characteristic,
            ..
        } => check_characteristic(*service, *characteristic),
        RequestOp::SetNotification {
            service,
            characteristic,
            ..
        }
        | RequestOp::SetIndication {
            service,
            characteristic,
            ..
        } => check_characteristic(*service, *characteristic).or_else(|| {
            if services
                .descriptor(*service, *characteristic, CLIENT_CHARACTERISTIC_CONFIG)
                .is_none()
            {
                Some(RequestFailReason::DescriptorNotExist)
            } else {
                None
            }
        }),
        RequestOp::ReadDescriptor {
            service,
            characteristic,
            descriptor,
        }
        | RequestOp::WriteDescriptor {
            service,
            characteristic,
            descriptor,
            ..
        } => check_characteristic(*service, *characteristic).or_else(|| {
            if services
                .descriptor(*service, *characteristic, *descriptor)
                .is_none()
            {
                Some(RequestFailReason::DescriptorNotExist)
            } else {
                None
            }
        }),
        RequestOp::ChangeMtu { .. }
        | RequestOp::ReadRssi
        | RequestOp::ReadPhy
        | RequestOp::SetPreferredPhy { .. } => None,
    }
}

fn failure_of(error: &Error) -> RequestFailReason {
    match error {
        Error::NotSupported { .. } => RequestFailReason::RequestFailed,
        _ => RequestFailReason::GattStatusFailed,
    }
}

/// Run one transport primitive under the per-request timeout.
async fn with_timeout<T>(
    limit: Duration,
    operation: impl std::future::Future<Output = crate::error::Result<T>>,
) -> Result<T, RequestFailReason> {
    match tokio::time::timeout(limit, operation).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => {
            debug!("transport operation failed: {error}");
            Err(failure_of(&error))
        }
        Err(_) => Err(RequestFailReason::RequestTimeout),
    }
}

/// Execute one request against the transport. Runs on its own task; the
/// outcome travels back to the session actor as a message.
async fn run_operation(
    op: RequestOp,
    options: Option<crate::config::WriteOptions>,
    handle: Arc<dyn TransportHandle>,
    timeout: Duration,
    mtu: u16,
    shared: Arc<SessionShared>,
) -> Result<RequestValue, RequestFailReason> {
    match op {
        RequestOp::ReadCharacteristic {
            service,
            characteristic,
        } => {
            let value = with_timeout(timeout, handle.read_characteristic(service, characteristic))
                .await?;
            Ok(RequestValue::Bytes(value))
        }
        RequestOp::WriteCharacteristic {
            service,
            characteristic,
            value,
        } => {
            let options = options.unwrap_or_default();
            run_write(service, characteristic, value, options, handle, timeout, mtu).await
        }
        RequestOp::ReadDescriptor {
            service,
            characteristic,
            descriptor,
        } => {
            let value = with_timeout(
                timeout,
                handle.read_descriptor(service, characteristic, descriptor),
            )
            .await?;
            Ok(RequestValue::Bytes(value))
        }
        RequestOp::WriteDescriptor {
            service,
            characteristic,
            descriptor,
            value,
        } => {
            with_timeout(
                timeout,
                handle.write_descriptor(service, characteristic, descriptor, value.clone()),
            )
            .await?;
            Ok(RequestValue::Bytes(value))
        }
        RequestOp::SetNotification {
            service,
            characteristic,
            enable,
        } => {
            run_notification_switch(
                service,
                characteristic,
                enable,
                ENABLE_NOTIFICATION_VALUE,
                handle,
                timeout,
                shared,
            )
            .await
        }
        RequestOp::SetIndication {
            service,
            characteristic,
            enable,
        } => {
            run_notification_switch(
                service,
                characteristic,
                enable,
                ENABLE_INDICATION_VALUE,
                handle,
                timeout,
                shared,
            )
            .await
        }
        RequestOp::ChangeMtu { mtu: requested } => {
            let negotiated = with_timeout(timeout, handle.request_mtu(requested)).await?;
            Ok(RequestValue::Mtu(negotiated))
        }
        RequestOp::ReadRssi => {
            let rssi = with_timeout(timeout, handle.read_rssi()).await?;
            Ok(RequestValue::Rssi(rssi))
        }
        RequestOp::ReadPhy => {
            let (tx_phy, rx_phy) = with_timeout(timeout, handle.read_phy()).await?;
            Ok(RequestValue::Phy(tx_phy, rx_phy))
        }
        RequestOp::SetPreferredPhy { options } => {
            let (tx_phy, rx_phy) = with_timeout(timeout, handle.set_preferred_phy(options)).await?;
            Ok(RequestValue::Phy(tx_phy, rx_phy))
        }
    }
}

/// Characteristic write, fragmented when the payload exceeds the chunk
/// size. The timeout re-arms per chunk.
async fn run_write(
    service: uuid::Uuid,
    characteristic: uuid::Uuid,
    value: Bytes,
    options: crate::config::WriteOptions,
    handle: Arc<dyn TransportHandle>,
    timeout: Duration,
    mtu: u16,
) -> Result<RequestValue, RequestFailReason> {
    let initial_delay = if options.request_write_delay > Duration::ZERO {
        options.request_write_delay
    } else {
        options.package_write_delay
    };
    if initial_delay > Duration::ZERO {
        tokio::time::sleep(initial_delay).await;
    }

    let chunk_size = if options.use_mtu_as_package_size {
        usize::from(mtu.saturating_sub(3).max(1))
    } else {
        options.package_size
    };

    if value.len() > chunk_size {
        let chunks = split_chunks(&value, chunk_size);
        let total = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            if index > 0 && options.package_write_delay > Duration::ZERO {
                tokio::time::sleep(options.package_write_delay).await;
            }
            let write =
                handle.write_characteristic(service, characteristic, chunk, options.write_mode);
            if options.wait_write_result {
                with_timeout(timeout, write).await.map_err(|reason| match reason {
                    RequestFailReason::RequestTimeout => reason,
                    _ => RequestFailReason::RequestFailed,
                })?;
            } else {
                // Streamed mode: chunks go out back to back and the request
                // completes once the last one is handed to the transport.
                // The timeout bounds the hand-off, not an acknowledgment.
                with_timeout(timeout, write).await.map_err(|reason| match reason {
                    RequestFailReason::RequestTimeout => reason,
                    _ => {
                        debug!("streamed chunk write failed");
                        RequestFailReason::RequestFailed
                    }
                })?;
            }
            trace!("package [{}/{}] written", index + 1, total);
        }
    } else {
        with_timeout(
            timeout,
            handle.write_characteristic(service, characteristic, value.clone(), options.write_mode),
        )
        .await?;
    }
    Ok(RequestValue::Bytes(value))
}

/// Flip notifications or indications through the CCC descriptor, tracking
/// the written value so queries reflect the device-visible configuration.
async fn run_notification_switch(
    service: uuid::Uuid,
    characteristic: uuid::Uuid,
    enable: bool,
    enable_value: [u8; 2],
    handle: Arc<dyn TransportHandle>,
    timeout: Duration,
    shared: Arc<SessionShared>,
) -> Result<RequestValue, RequestFailReason> {
    let value = if enable {
        enable_value
    } else {
        DISABLE_NOTIFICATION_VALUE
    };
    let key = (service, characteristic);
    let previous = shared.ccc.read().get(&key).copied();

    if let Err(error) = handle
        .set_characteristic_notification(service, characteristic, enable)
        .await
    {
        debug!("notification switch failed: {error}");
        return Err(RequestFailReason::GattStatusFailed);
    }

    shared.ccc.write().insert(key, value);
    let write = handle.write_descriptor(
        service,
        characteristic,
        CLIENT_CHARACTERISTIC_CONFIG,
        Bytes::copy_from_slice(&value),
    );
    match with_timeout(timeout, write).await {
        Ok(()) => Ok(RequestValue::NotifyState(enable)),
        Err(reason) => {
            // The descriptor write did not take; roll the tracked value and
            // the client-side switch back to what the device last saw.
            {
                let mut ccc = shared.ccc.write();
                match previous {
                    Some(previous) => {
                        ccc.insert(key, previous);
                    }
                    None => {
                        ccc.remove(&key);
                    }
                }
            }
            let was_enabled = previous.map_or(false, |v| v != DISABLE_NOTIFICATION_VALUE);
            let _ = handle
                .set_characteristic_notification(service, characteristic, was_enabled)
                .await;
            Err(reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{WriteMode, WriteOptions};
    use crate::mock::{MockHandle, MockTransport};
    use crate::transport::{
        CharacteristicInfo, DescriptorInfo, ServiceInfo, ServiceTree, Transport,
    };
    use pretty_assertions::assert_eq;
    use tokio::sync::oneshot;
    use uuid::Uuid;

    const SERVICE: Uuid = Uuid::from_u128(0x10);
    const CHARACTERISTIC: Uuid = Uuid::from_u128(0x20);

    fn tree() -> ServiceTree {
        ServiceTree::new(vec![ServiceInfo {
            uuid: SERVICE,
            characteristics: vec![CharacteristicInfo {
                uuid: CHARACTERISTIC,
                descriptors: vec![DescriptorInfo {
                    uuid: CLIENT_CHARACTERISTIC_CONFIG,
                }],
            }],
        }])
    }

    struct Fixture {
        handle: Arc<MockHandle>,
        shared: Arc<SessionShared>,
        config: Arc<ConnectionConfiguration>,
        tx: mpsc::UnboundedSender<SessionMessage>,
        rx: mpsc::UnboundedReceiver<SessionMessage>,
        scheduler: RequestScheduler,
    }

    impl Fixture {
        async fn new() -> Self {
            let transport = MockTransport::new();
            transport.set_services(tree());
            let identity = crate::device::DeviceIdentity::new("AA:BB:CC:DD:EE:FF");
            let _dyn_handle = transport.connect(&identity).await.unwrap();
            let handle = transport.last_handle().unwrap();

            let shared = Arc::new(SessionShared::new());
            *shared.services.write() = tree();
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                handle,
                shared,
                config: Arc::new(ConnectionConfiguration::default()),
                tx,
                rx,
                scheduler: RequestScheduler::new(),
            }
        }

        fn ctx(&self) -> DispatchContext {
            DispatchContext {
                handle: Some(self.handle.clone() as Arc<dyn TransportHandle>),
                adapter_on: true,
                config: self.config.clone(),
                mtu: crate::transport::DEFAULT_MTU,
                shared: self.shared.clone(),
                tx: self.tx.clone(),
            }
        }

        fn enqueue(&mut self, request: Request) -> Vec<Resolution> {
            let ctx = self.ctx();
            self.scheduler.enqueue(request, &ctx)
        }

        /// Pump completion messages back into the scheduler until idle.
        async fn drive(&mut self) -> Vec<Resolution> {
            let mut resolutions = Vec::new();
            while self.scheduler.has_current() {
                let message = self.rx.recv().await.unwrap();
                if let SessionMessage::RequestFinished { id, result } = message {
                    let ctx = self.ctx();
                    resolutions.extend(self.scheduler.on_finished(id, result, &ctx));
                }
            }
            resolutions
        }
    }

    fn sinked(mut request: Request) -> (Request, oneshot::Receiver<crate::error::Result<RequestValue>>) {
        let (tx, rx) = oneshot::channel();
        request.sink = Some(tx);
        (request, rx)
    }

    fn write_of(len: usize) -> Request {
        Request::write_characteristic(SERVICE, CHARACTERISTIC, vec![0u8; len])
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_order_and_fifo_tiebreak() {
        let mut fx = Fixture::new().await;
        fx.handle.enable_gate();
        fx.handle.release_gate(4);

        // First request dispatches immediately; the rest queue by priority.
        assert!(fx.enqueue(write_of(1)).is_empty());
        assert!(fx.enqueue(write_of(2)).is_empty());
        assert!(fx.enqueue(write_of(3).priority(5)).is_empty());
        assert!(fx.enqueue(write_of(4)).is_empty());

        let resolutions = fx.drive().await;
        assert_eq!(resolutions.len(), 4);
        assert!(resolutions.iter().all(|r| r.outcome.is_ok()));

        let writes: Vec<String> = fx
            .handle
            .ops()
            .into_iter()
            .filter(|op| op.starts_with("write_char"))
            .collect();
        assert_eq!(
            writes,
            vec![
                "write_char:1:WithResponse",
                "write_char:3:WithResponse",
                "write_char:2:WithResponse",
                "write_char:4:WithResponse",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_request_in_flight() {
        let mut fx = Fixture::new().await;
        fx.handle.enable_gate();
        fx.handle.release_gate(8);

        for len in 1..=8 {
            fx.enqueue(write_of(len));
        }
        fx.drive().await;
        assert_eq!(fx.handle.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_request_and_advances() {
        let mut fx = Fixture::new().await;
        fx.handle.enable_gate();

        let (stuck, stuck_rx) = sinked(Request::read_rssi());
        fx.enqueue(stuck);
        let (next, next_rx) = sinked(Request::change_mtu(185));
        fx.enqueue(next);

        // The gated RSSI read times out after request_timeout; its
        // completion message dispatches the MTU request.
        let message = fx.rx.recv().await.unwrap();
        let mut resolutions = match message {
            SessionMessage::RequestFinished { id, result } => {
                let ctx = fx.ctx();
                fx.scheduler.on_finished(id, result, &ctx)
            }
            _ => panic!("unexpected message"),
        };
        fx.handle.release_gate(1);
        resolutions.extend(fx.drive().await);

        assert_eq!(resolutions.len(), 2);
        assert_eq!(
            resolutions[0].outcome,
            Err(RequestFailReason::RequestTimeout)
        );
        assert!(matches!(
            stuck_rx.await.unwrap(),
            Err(Error::RequestTimeout)
        ));
        assert_eq!(resolutions[1].outcome, Ok(RequestValue::Mtu(185)));
        assert_eq!(next_rx.await.unwrap().unwrap(), RequestValue::Mtu(185));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragmented_write_with_ack() {
        let mut fx = Fixture::new().await;
        let payload: Vec<u8> = (0..50).collect();
        let (request, rx) = sinked(
            Request::write_characteristic(SERVICE, CHARACTERISTIC, payload.clone())
                .write_options(WriteOptions::builder().package_size(20).build()),
        );

        fx.enqueue(request);
        let resolutions = fx.drive().await;
        assert_eq!(resolutions.len(), 1);

        let writes: Vec<String> = fx
            .handle
            .ops()
            .into_iter()
            .filter(|op| op.starts_with("write_char"))
            .collect();
        assert_eq!(
            writes,
            vec![
                "write_char:20:WithResponse",
                "write_char:20:WithResponse",
                "write_char:10:WithResponse",
            ]
        );
        assert_eq!(
            rx.await.unwrap().unwrap(),
            RequestValue::Bytes(Bytes::from(payload))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_streamed_write_aborts_on_first_failure() {
        let mut fx = Fixture::new().await;
        fx.handle
            .plan_char_writes([Err(Error::GattStatusFailed)]);

        let options = WriteOptions::builder()
            .package_size(20)
            .package_write_delay(Duration::from_millis(5))
            .wait_write_result(false)
            .write_mode(WriteMode::WithoutResponse)
            .build();
        let (request, rx) = sinked(
            Request::write_characteristic(SERVICE, CHARACTERISTIC, vec![0u8; 50])
                .write_options(options),
        );
        fx.enqueue(request);
        let resolutions = fx.drive().await;

        assert_eq!(resolutions[0].outcome, Err(RequestFailReason::RequestFailed));
        assert!(matches!(rx.await.unwrap(), Err(Error::RequestFailed)));
        // Only the failing first chunk went out.
        let writes = fx
            .handle
            .ops()
            .into_iter()
            .filter(|op| op.starts_with("write_char"))
            .count();
        assert_eq!(writes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_streamed_write_times_out_when_transport_stalls() {
        let mut fx = Fixture::new().await;
        fx.handle.enable_gate();

        let options = WriteOptions::builder()
            .package_size(20)
            .wait_write_result(false)
            .write_mode(WriteMode::WithoutResponse)
            .build();
        let (request, rx) = sinked(
            Request::write_characteristic(SERVICE, CHARACTERISTIC, vec![0u8; 50])
                .write_options(options),
        );
        fx.enqueue(request);

        // The transport never completes the first chunk. The request still
        // resolves once the per-request timeout elapses instead of pinning
        // the queue forever.
        let resolutions = fx.drive().await;
        assert_eq!(
            resolutions[0].outcome,
            Err(RequestFailReason::RequestTimeout)
        );
        assert!(matches!(
            rx.await.unwrap(),
            Err(Error::RequestTimeout)
        ));
        assert!(!fx.scheduler.has_current());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mtu_derived_chunk_size() {
        let mut fx = Fixture::new().await;
        let options = WriteOptions::builder().use_mtu_as_package_size(true).build();
        let (request, _rx) = sinked(
            Request::write_characteristic(SERVICE, CHARACTERISTIC, vec![0u8; 200])
                .write_options(options),
        );

        let ctx = DispatchContext {
            mtu: 100,
            ..fx.ctx()
        };
        fx.scheduler.enqueue(request, &ctx);
        fx.drive().await;

        let writes: Vec<String> = fx
            .handle
            .ops()
            .into_iter()
            .filter(|op| op.starts_with("write_char"))
            .collect();
        // MTU 100 leaves 97 payload bytes per chunk.
        assert_eq!(
            writes,
            vec![
                "write_char:97:WithResponse",
                "write_char:97:WithResponse",
                "write_char:6:WithResponse",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_preflight_rejects_unknown_targets() {
        let mut fx = Fixture::new().await;

        let (request, rx) = sinked(Request::read_characteristic(Uuid::from_u128(0x99), CHARACTERISTIC));
        let resolutions = fx.enqueue(request);
        assert_eq!(
            resolutions[0].outcome,
            Err(RequestFailReason::ServiceNotExist)
        );
        assert!(matches!(rx.await.unwrap(), Err(Error::ServiceNotExist { .. })));

        let (request, rx) = sinked(Request::read_characteristic(SERVICE, Uuid::from_u128(0x99)));
        let resolutions = fx.enqueue(request);
        assert_eq!(
            resolutions[0].outcome,
            Err(RequestFailReason::CharacteristicNotExist)
        );
        assert!(matches!(
            rx.await.unwrap(),
            Err(Error::CharacteristicNotExist { .. })
        ));

        let (request, rx) = sinked(Request::read_descriptor(
            SERVICE,
            CHARACTERISTIC,
            Uuid::from_u128(0x99),
        ));
        let resolutions = fx.enqueue(request);
        assert_eq!(
            resolutions[0].outcome,
            Err(RequestFailReason::DescriptorNotExist)
        );
        assert!(matches!(
            rx.await.unwrap(),
            Err(Error::DescriptorNotExist { .. })
        ));
        assert!(!fx.scheduler.has_current());
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_enable_tracks_ccc_value() {
        let mut fx = Fixture::new().await;
        let (request, rx) = sinked(Request::set_notification(SERVICE, CHARACTERISTIC, true));
        fx.enqueue(request);
        let resolutions = fx.drive().await;

        assert_eq!(resolutions[0].outcome, Ok(RequestValue::NotifyState(true)));
        assert_eq!(rx.await.unwrap().unwrap(), RequestValue::NotifyState(true));
        assert_eq!(
            fx.shared.ccc.read().get(&(SERVICE, CHARACTERISTIC)),
            Some(&ENABLE_NOTIFICATION_VALUE)
        );
        assert!(fx
            .handle
            .ops()
            .contains(&"notify_switch:true".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_disable_restores_tracked_value() {
        let mut fx = Fixture::new().await;
        let (request, _rx) = sinked(Request::set_indication(SERVICE, CHARACTERISTIC, true));
        fx.enqueue(request);
        fx.drive().await;
        assert_eq!(
            fx.shared.ccc.read().get(&(SERVICE, CHARACTERISTIC)),
            Some(&ENABLE_INDICATION_VALUE)
        );

        fx.handle.plan_desc_writes([Err(Error::GattStatusFailed)]);
        let (request, rx) = sinked(Request::set_indication(SERVICE, CHARACTERISTIC, false));
        fx.enqueue(request);
        let resolutions = fx.drive().await;

        assert_eq!(
            resolutions[0].outcome,
            Err(RequestFailReason::GattStatusFailed)
        );
        assert!(matches!(rx.await.unwrap(), Err(Error::GattStatusFailed)));
        // The device never saw the disable; the tracked value still says
        // indications are on.
        assert_eq!(
            fx.shared.ccc.read().get(&(SERVICE, CHARACTERISTIC)),
            Some(&ENABLE_INDICATION_VALUE)
        );
        // The client-side switch was rolled back to enabled.
        let switches: Vec<String> = fx
            .handle
            .ops()
            .into_iter()
            .filter(|op| op.starts_with("notify_switch"))
            .collect();
        assert_eq!(
            switches,
            vec![
                "notify_switch:true",
                "notify_switch:false",
                "notify_switch:true",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_all_resolves_current_and_queued() {
        let mut fx = Fixture::new().await;
        fx.handle.enable_gate();

        let mut receivers = Vec::new();
        for len in 1..=3 {
            let (request, rx) = sinked(write_of(len));
            fx.enqueue(request);
            receivers.push(rx);
        }
        assert!(fx.scheduler.has_current());
        assert_eq!(fx.scheduler.queued_len(), 2);

        let resolutions = fx.scheduler.fail_all(RequestFailReason::ConnectionDisconnected);
        assert_eq!(resolutions.len(), 3);
        assert!(!fx.scheduler.has_current());
        assert_eq!(fx.scheduler.queued_len(), 0);
        for rx in receivers {
            assert!(matches!(
                rx.await.unwrap(),
                Err(Error::ConnectionDisconnected)
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_queue_drops_sinks_silently() {
        let mut fx = Fixture::new().await;
        fx.handle.enable_gate();

        let (first, first_rx) = sinked(write_of(1));
        fx.enqueue(first);
        let (second, second_rx) = sinked(write_of(2));
        fx.enqueue(second);

        fx.scheduler.clear_queue();
        assert!(!fx.scheduler.has_current());
        assert_eq!(fx.scheduler.queued_len(), 0);
        // No resolution is sent; callers observe a closed channel.
        assert!(first_rx.await.is_err());
        assert!(second_rx.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_queue_by_kind_keeps_others() {
        let mut fx = Fixture::new().await;
        fx.handle.enable_gate();

        fx.enqueue(Request::read_rssi());
        fx.enqueue(write_of(1));
        fx.enqueue(Request::change_mtu(185));
        fx.enqueue(write_of(2));
        assert_eq!(fx.scheduler.queued_len(), 3);

        fx.scheduler.clear_queue_by_kind(RequestKind::WriteCharacteristic);
        assert_eq!(fx.scheduler.queued_len(), 1);
        // The in-flight RSSI read is of a different kind and survives.
        assert!(fx.scheduler.has_current());

        fx.scheduler.clear_queue_by_kind(RequestKind::ReadRssi);
        assert!(!fx.scheduler.has_current());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_without_adapter_fails() {
        let mut fx = Fixture::new().await;
        let (request, rx) = sinked(Request::read_rssi());
        let ctx = DispatchContext {
            adapter_on: false,
            ..fx.ctx()
        };
        let resolutions = fx.scheduler.enqueue(request, &ctx);
        assert_eq!(
            resolutions[0].outcome,
            Err(RequestFailReason::AdapterDisabled)
        );
        assert!(matches!(rx.await.unwrap(), Err(Error::AdapterDisabled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_without_handle_fails() {
        let mut fx = Fixture::new().await;
        let (request, rx) = sinked(Request::read_rssi());
        let ctx = DispatchContext {
            handle: None,
            ..fx.ctx()
        };
        let resolutions = fx.scheduler.enqueue(request, &ctx);
        assert_eq!(
            resolutions[0].outcome,
            Err(RequestFailReason::TransportUnavailable)
        );
        assert!(matches!(rx.await.unwrap(), Err(Error::TransportUnavailable)));
    }
}
