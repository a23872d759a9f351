// src/core/connection/manager.rs

//! The connection state machine.
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──CONNECTED──▶ Connected
//!      ▲                         │                        │
//!      │                         ▼ ERROR / timeout        │ link lost
//!      └──── disconnect() ──── Failed ◀───────────────────┘
//! ```
//!
//! Concurrent `connect()` calls while `Connecting` all await the same shared
//! handshake future, so at most one handshake is ever in flight.

use super::active::{self, ActiveConnection, LinkObserver};
use crate::config::Config;
use crate::core::RealtimeError;
use crate::core::credentials::CredentialProvider;
use crate::core::protocol::{HeartBeat, StompCommand, StompFrame};
use crate::core::pubsub::SubscriptionRegistry;
use crate::core::transport::Connector;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(4);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// How to reach and keep talking to the realtime endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub endpoint: url::Url,
    /// The heart-beat intervals this client declares in its CONNECT frame.
    pub heartbeat: HeartBeat,
    /// Upper bound on the whole handshake, transport upgrade included.
    pub connect_timeout: Duration,
    /// Fixed delay between reconnect attempts after an established connection
    /// is lost. `None` disables automatic reconnection.
    pub reconnect_delay: Option<Duration>,
}

impl ConnectionSettings {
    pub fn new(endpoint: url::Url) -> Self {
        Self {
            endpoint,
            heartbeat: HeartBeat::new(DEFAULT_HEARTBEAT, DEFAULT_HEARTBEAT),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_delay: Some(DEFAULT_RECONNECT_DELAY),
        }
    }
}

impl From<&Config> for ConnectionSettings {
    fn from(config: &Config) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            heartbeat: HeartBeat::new(config.heartbeat.outgoing, config.heartbeat.incoming),
            connect_timeout: config.connect_timeout,
            reconnect_delay: config.reconnect.enabled.then_some(config.reconnect.delay),
        }
    }
}

/// A snapshot of the manager's state, as published to watchers.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed(RealtimeError),
}

type SharedConnect = Shared<BoxFuture<'static, Result<Arc<ActiveConnection>, RealtimeError>>>;

enum ConnState {
    Disconnected,
    Connecting { attempt: u64, future: SharedConnect },
    Connected(Arc<ActiveConnection>),
    Failed(RealtimeError),
}

struct Slot {
    conn: ConnState,
    /// Bumped by every `disconnect()`; a reconnect loop from an older epoch
    /// must not revive the connection.
    epoch: u64,
}

struct ManagerShared {
    this: Weak<ManagerShared>,
    settings: ConnectionSettings,
    credentials: Arc<CredentialProvider>,
    connector: Arc<dyn Connector>,
    registry: Arc<SubscriptionRegistry>,
    slot: Mutex<Slot>,
    next_attempt: AtomicU64,
    status_tx: watch::Sender<ConnectionStatus>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the one realtime connection of a client. Cloning yields another handle
/// to the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerShared>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.inner.settings.endpoint.as_str())
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        credentials: Arc<CredentialProvider>,
        connector: Arc<dyn Connector>,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let inner = Arc::new_cyclic(|this| ManagerShared {
            this: this.clone(),
            settings,
            credentials,
            connector,
            registry,
            slot: Mutex::new(Slot {
                conn: ConnState::Disconnected,
                epoch: 0,
            }),
            next_attempt: AtomicU64::new(0),
            status_tx,
            reconnect_task: Mutex::new(None),
        });
        Self { inner }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.registry
    }

    /// Returns the active connection, establishing it if needed.
    ///
    /// Fails with [`RealtimeError::Unauthenticated`] before touching the
    /// network when no valid token is available.
    pub async fn connect(&self) -> Result<Arc<ActiveConnection>, RealtimeError> {
        self.inner.connect_in_epoch(None).await
    }

    /// Closes the connection and forgets every subscription. Safe to call in
    /// any state, any number of times.
    pub fn disconnect(&self) {
        if let Some(task) = self.inner.reconnect_task.lock().take() {
            task.abort();
        }

        let mut slot = self.inner.slot.lock();
        slot.epoch += 1;
        match std::mem::replace(&mut slot.conn, ConnState::Disconnected) {
            ConnState::Connected(conn) => {
                info!("Disconnecting connection #{}.", conn.id());
                conn.close();
            }
            ConnState::Connecting { attempt, .. } => {
                info!("Abandoning in-flight handshake #{}.", attempt);
            }
            ConnState::Disconnected | ConnState::Failed(_) => {
                debug!("disconnect() called while not connected.");
            }
        }
        self.inner.registry.clear();
        self.inner.set_status(ConnectionStatus::Disconnected);
    }

    /// The established connection, if there is one.
    pub fn current(&self) -> Option<Arc<ActiveConnection>> {
        match &self.inner.slot.lock().conn {
            ConnState::Connected(conn) if conn.is_open() => Some(conn.clone()),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(&self.inner.slot.lock().conn, ConnState::Connected(conn) if conn.is_open())
    }

    pub fn state(&self) -> ConnectionStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Subscribes to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }
}

enum Step {
    Ready(Arc<ActiveConnection>),
    Wait(SharedConnect),
}

impl ManagerShared {
    fn set_status(&self, status: ConnectionStatus) {
        self.status_tx.send_replace(status);
    }

    /// `epoch` is set only by the reconnect loop, which must give up once a
    /// `disconnect()` has happened since it was scheduled.
    async fn connect_in_epoch(
        &self,
        epoch: Option<u64>,
    ) -> Result<Arc<ActiveConnection>, RealtimeError> {
        match self.begin_or_join(epoch)? {
            Step::Ready(conn) => Ok(conn),
            Step::Wait(future) => future.await,
        }
    }

    /// Returns the step for the current state, or `None` when a new handshake
    /// is needed.
    fn join_existing(slot: &Slot, epoch: Option<u64>) -> Result<Option<Step>, RealtimeError> {
        if let Some(epoch) = epoch
            && epoch != slot.epoch
        {
            return Err(RealtimeError::ConnectionClosed);
        }
        match &slot.conn {
            ConnState::Connected(conn) if conn.is_open() => Ok(Some(Step::Ready(conn.clone()))),
            ConnState::Connecting { future, .. } => Ok(Some(Step::Wait(future.clone()))),
            _ => Ok(None),
        }
    }

    fn begin_or_join(&self, epoch: Option<u64>) -> Result<Step, RealtimeError> {
        if let Some(step) = Self::join_existing(&self.slot.lock(), epoch)? {
            return Ok(step);
        }

        // The store may hit the disk, so the token is resolved outside the lock
        // and the state is checked again afterwards.
        let token = self.credentials.access_token();

        let mut slot = self.slot.lock();
        if let Some(step) = Self::join_existing(&slot, epoch)? {
            return Ok(step);
        }
        let Some(token) = token else {
            warn!("Refusing to connect: no valid access token.");
            slot.conn = ConnState::Failed(RealtimeError::Unauthenticated);
            self.set_status(ConnectionStatus::Failed(RealtimeError::Unauthenticated));
            return Err(RealtimeError::Unauthenticated);
        };

        let this = self
            .this
            .upgrade()
            .ok_or_else(|| RealtimeError::Internal("connection manager dropped".to_string()))?;
        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "Starting handshake #{} with {}.",
            attempt, self.settings.endpoint
        );

        let task = tokio::spawn(async move {
            let observer: Weak<dyn LinkObserver> = this.this.clone();
            let result = active::establish(
                attempt,
                &this.settings,
                token,
                this.connector.as_ref(),
                observer,
            )
            .await;
            this.finish_attempt(attempt, result)
        });
        let future: SharedConnect = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(RealtimeError::Internal(format!("handshake task failed: {e}"))),
            }
        }
        .boxed()
        .shared();

        slot.conn = ConnState::Connecting {
            attempt,
            future: future.clone(),
        };
        self.set_status(ConnectionStatus::Connecting);
        Ok(Step::Wait(future))
    }

    fn finish_attempt(
        &self,
        attempt: u64,
        result: Result<Arc<ActiveConnection>, RealtimeError>,
    ) -> Result<Arc<ActiveConnection>, RealtimeError> {
        let mut slot = self.slot.lock();
        let current = matches!(&slot.conn, ConnState::Connecting { attempt: a, .. } if *a == attempt);
        if !current {
            if let Ok(conn) = &result {
                debug!("Closing orphaned connection #{}.", conn.id());
                conn.close();
            }
            return Err(RealtimeError::ConnectionClosed);
        }

        match result {
            Ok(conn) if conn.is_open() => {
                slot.conn = ConnState::Connected(conn.clone());
                self.registry.replay(&conn);
                self.set_status(ConnectionStatus::Connected);
                Ok(conn)
            }
            // Never established, so this is not a loss to recover from. A
            // reconnect loop that started the attempt keeps retrying by itself.
            Ok(conn) => {
                warn!("Connection #{} dropped right after its handshake.", conn.id());
                slot.conn = ConnState::Failed(RealtimeError::ConnectionClosed);
                self.set_status(ConnectionStatus::Failed(RealtimeError::ConnectionClosed));
                Err(RealtimeError::ConnectionClosed)
            }
            Err(e) => {
                warn!("Handshake #{} failed: {}", attempt, e);
                slot.conn = ConnState::Failed(e.clone());
                self.set_status(ConnectionStatus::Failed(e.clone()));
                Err(e)
            }
        }
    }

    fn schedule_reconnect(&self) {
        let Some(delay) = self.settings.reconnect_delay else {
            info!("Automatic reconnection is disabled.");
            return;
        };
        let epoch = self.slot.lock().epoch;
        let weak = self.this.clone();
        let task = tokio::spawn(reconnect_loop(weak, delay, epoch));
        if let Some(previous) = self.reconnect_task.lock().replace(task) {
            previous.abort();
        }
    }
}

/// Retries `connect()` at a fixed delay until it succeeds, the manager is
/// dropped, or `disconnect()` ends the epoch.
async fn reconnect_loop(manager: Weak<ManagerShared>, delay: Duration, epoch: u64) {
    let mut attempts = 0u32;
    loop {
        tokio::time::sleep(delay).await;
        let Some(inner) = manager.upgrade() else {
            return;
        };
        attempts += 1;
        info!("Reconnect attempt {} after {:?}.", attempts, delay);
        match inner.connect_in_epoch(Some(epoch)).await {
            Ok(conn) => {
                info!(
                    "Reconnected as connection #{} after {} attempt(s).",
                    conn.id(),
                    attempts
                );
                return;
            }
            Err(e) => {
                if inner.slot.lock().epoch != epoch {
                    debug!("Reconnect loop cancelled by disconnect().");
                    return;
                }
                warn!("Reconnect attempt {} failed: {}", attempts, e);
            }
        }
    }
}

impl LinkObserver for ManagerShared {
    fn on_frame(&self, connection_id: u64, frame: StompFrame) {
        match frame.command {
            StompCommand::Message => {
                let delivered = self.registry.dispatch(&frame);
                debug!(
                    "MESSAGE on connection #{} delivered to {} listener(s).",
                    connection_id, delivered
                );
            }
            StompCommand::Error => {
                warn!(
                    "Server ERROR on connection #{}: {} {}",
                    connection_id,
                    frame.get_header("message").unwrap_or_default(),
                    frame.body_text().trim()
                );
            }
            other => debug!(
                "Ignoring {} frame on connection #{}.",
                other, connection_id
            ),
        }
    }

    fn on_lost(&self, connection_id: u64, reason: RealtimeError) {
        {
            let mut slot = self.slot.lock();
            let current =
                matches!(&slot.conn, ConnState::Connected(conn) if conn.id() == connection_id);
            if !current {
                return;
            }
            slot.conn = ConnState::Failed(reason.clone());
        }
        self.set_status(ConnectionStatus::Failed(reason));
        self.schedule_reconnect();
    }
}
