//! Connection registry.
//!
//! Owns every live session, keyed by device address in creation order,
//! and watches the adapter: power-off force-disconnects everything and
//! silences the scanner, power-on reconnects the sessions that want it.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::ConnectionConfiguration;
use crate::device::DeviceIdentity;
use crate::error::{ConnectFailReason, Error, Result};
use crate::event::{EventBus, EventObserver, SessionEvent};
use crate::scanner::Scanner;
use crate::session::{spawn_session, SessionHandle, SessionState};
use crate::transport::{AdapterState, Transport};

struct RegistryInner {
    transport: Arc<dyn Transport>,
    scanner: Scanner,
    bus: Arc<EventBus>,
    sessions: Mutex<Vec<SessionHandle>>,
    adapter_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        if let Some(task) = self.adapter_task.lock().take() {
            task.abort();
        }
    }
}

/// All live sessions plus the adapter watcher. Cheap to clone; clones
/// share one registry.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    /// Create a registry over a transport, a scanner, and an event bus.
    pub fn new(transport: Arc<dyn Transport>, scanner: Scanner, bus: Arc<EventBus>) -> Self {
        let inner = Arc::new(RegistryInner {
            transport,
            scanner,
            bus,
            sessions: Mutex::new(Vec::new()),
            adapter_task: Mutex::new(None),
        });

        let registry = Self {
            inner: inner.clone(),
        };
        let watcher = registry.clone();
        let task = tokio::spawn(async move {
            let mut adapter_rx = watcher.inner.transport.adapter_events();
            loop {
                match adapter_rx.recv().await {
                    Ok(state) => watcher.on_adapter_state(state).await,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *inner.adapter_task.lock() = Some(task);
        registry
    }

    async fn on_adapter_state(&self, state: AdapterState) {
        info!(?state, "adapter state changed");
        self.inner
            .bus
            .publish(SessionEvent::AdapterStateChanged { state });
        match state {
            AdapterState::Off => {
                self.inner.scanner.on_adapter_off().await;
                for session in self.ordered_connections() {
                    session.disconnect();
                }
            }
            AdapterState::On => {
                for session in self.ordered_connections() {
                    if session.config().auto_reconnect && !session.is_ready() {
                        session.reconnect();
                    }
                }
            }
        }
    }

    /// The scanner this registry's sessions reconnect through.
    pub fn scanner(&self) -> &Scanner {
        &self.inner.scanner
    }

    /// The bus session events are published to.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    /// Open a session with a device and start connecting. An existing
    /// session for the same address is quietly released and replaced.
    pub async fn connect(
        &self,
        identity: DeviceIdentity,
        config: ConnectionConfiguration,
        observer: Option<EventObserver>,
    ) -> Result<SessionHandle> {
        if !self.inner.transport.is_connectable(&identity) {
            warn!(address = %identity.address, "device rejected: not connectable");
            self.inner.bus.publish(SessionEvent::ConnectFailed {
                identity: identity.clone(),
                reason: ConnectFailReason::UnsupportedDevice,
            });
            return Err(Error::UnsupportedDevice {
                address: identity.address,
            });
        }

        let existing = self.remove(&identity.address);
        if let Some(existing) = existing {
            existing.release(true).await;
        }

        let session = spawn_session(
            identity,
            Arc::new(config),
            self.inner.transport.clone(),
            self.inner.scanner.clone(),
            self.inner.bus.clone(),
            observer,
            Duration::ZERO,
        );
        self.inner.sessions.lock().push(session.clone());
        Ok(session)
    }

    /// Look up a session by address.
    pub fn get(&self, address: &str) -> Option<SessionHandle> {
        self.inner
            .sessions
            .lock()
            .iter()
            .find(|session| session.identity().address == address)
            .cloned()
    }

    /// All sessions, in creation order.
    pub fn ordered_connections(&self) -> Vec<SessionHandle> {
        self.inner.sessions.lock().clone()
    }

    /// The oldest live session.
    pub fn first(&self) -> Option<SessionHandle> {
        self.inner.sessions.lock().first().cloned()
    }

    /// The newest live session.
    pub fn last(&self) -> Option<SessionHandle> {
        self.inner.sessions.lock().last().cloned()
    }

    /// Disconnect one session, suppressing its automatic reconnection.
    pub fn disconnect(&self, address: &str) -> Result<()> {
        match self.get(address) {
            Some(session) => {
                session.disconnect();
                Ok(())
            }
            None => Err(Error::SessionNotFound {
                address: address.into(),
            }),
        }
    }

    /// Disconnect every session.
    pub fn disconnect_all(&self) {
        for session in self.ordered_connections() {
            session.disconnect();
        }
    }

    /// Reconnect every session that is not already ready.
    pub fn reconnect_all(&self) {
        for session in self.ordered_connections() {
            if session.state() != SessionState::Ready {
                session.reconnect();
            }
        }
    }

    /// Release one session and forget it.
    pub async fn release(&self, address: &str) -> Result<()> {
        match self.remove(address) {
            Some(session) => {
                session.release(false).await;
                Ok(())
            }
            None => Err(Error::SessionNotFound {
                address: address.into(),
            }),
        }
    }

    /// Release and forget every session.
    pub async fn release_all(&self) {
        let sessions = std::mem::take(&mut *self.inner.sessions.lock());
        for session in sessions {
            session.release(false).await;
        }
    }

    /// Release everything, stop scanning, and stop watching the adapter.
    pub async fn shutdown(&self) {
        self.release_all().await;
        self.inner.scanner.stop(true).await;
        if let Some(task) = self.inner.adapter_task.lock().take() {
            task.abort();
        }
        info!("registry shut down");
    }

    fn remove(&self, address: &str) -> Option<SessionHandle> {
        let mut sessions = self.inner.sessions.lock();
        let index = sessions
            .iter()
            .position(|session| session.identity().address == address)?;
        Some(sessions.remove(index))
    }
}
