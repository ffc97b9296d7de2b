//! Process-wide event dispatch.
//!
//! A typed [`SessionEvent`] sum type fanned out through an explicit
//! [`EventBus`]: channel subscription for stream consumers, callback
//! registration for observer-style consumers. Per-connect observers are
//! plain closures invoked alongside the bus.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::device::DeviceIdentity;
use crate::error::{ConnectFailReason, ConnectTimeoutReason, RequestFailReason};
use crate::request::{RequestKind, RequestValue};
use crate::session::SessionState;
use crate::transport::AdapterState;

/// An event delivered to registered observers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The local adapter changed power state.
    AdapterStateChanged {
        /// The new power state.
        state: AdapterState,
    },
    /// A session entered a new state. Duplicate consecutive states for one
    /// session are suppressed at the source.
    ConnectionStateChanged {
        /// The session's device.
        identity: DeviceIdentity,
        /// The new state.
        state: SessionState,
    },
    /// A connection attempt failed permanently.
    ConnectFailed {
        /// The session's device.
        identity: DeviceIdentity,
        /// Why the attempt was abandoned.
        reason: ConnectFailReason,
    },
    /// The connect timeout elapsed, classified by the phase it hit.
    ConnectTimeout {
        /// The session's device.
        identity: DeviceIdentity,
        /// The phase the timeout was raised in.
        reason: ConnectTimeoutReason,
    },
    /// A subscribed characteristic pushed a value.
    CharacteristicChanged {
        /// The session's device.
        identity: DeviceIdentity,
        /// Service owning the characteristic.
        service: Uuid,
        /// The characteristic that changed.
        characteristic: Uuid,
        /// The pushed value.
        value: Bytes,
    },
    /// A request resolved successfully.
    RequestCompleted {
        /// The session's device.
        identity: DeviceIdentity,
        /// Operation discriminant of the request.
        kind: RequestKind,
        /// The typed result.
        value: RequestValue,
    },
    /// A request resolved with a failure.
    RequestFailed {
        /// The session's device.
        identity: DeviceIdentity,
        /// Operation discriminant of the request.
        kind: RequestKind,
        /// Why the request failed.
        reason: RequestFailReason,
    },
}

/// Per-connect observer closure, invoked for every event of one session.
pub type EventObserver = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Callback handle for unregistering callbacks.
///
/// Dropping the handle unregisters the callback.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Process-wide observer set.
pub struct EventBus {
    event_tx: broadcast::Sender<SessionEvent>,
    callback_counter: AtomicU64,
}

impl EventBus {
    /// Create a bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity);
        Self {
            event_tx,
            callback_counter: AtomicU64::new(0),
        }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Register a callback for every event.
    pub fn on_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.event_tx.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                callback(event);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Publish an event to all subscribers. Lagging or absent subscribers
    /// are not an error.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(128)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(SessionEvent::AdapterStateChanged {
            state: AdapterState::Off,
        });
        match rx.recv().await.unwrap() {
            SessionEvent::AdapterStateChanged { state } => assert_eq!(state, AdapterState::Off),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_callback_handle_unregisters() {
        let bus = EventBus::default();
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = bus.on_event(move |event| {
            let _ = seen_tx.send(event);
        });

        bus.publish(SessionEvent::AdapterStateChanged {
            state: AdapterState::On,
        });
        assert!(seen_rx.recv().await.is_some());

        handle.unregister();
        // Give the aborted task a chance to wind down.
        tokio::task::yield_now().await;
        bus.publish(SessionEvent::AdapterStateChanged {
            state: AdapterState::Off,
        });
        tokio::task::yield_now().await;
        assert!(seen_rx.try_recv().is_err());
    }
}
