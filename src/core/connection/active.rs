// src/core/connection/active.rs

//! An established, authenticated STOMP session and the background task that
//! owns its transport link.

use super::ConnectionSettings;
use crate::core::RealtimeError;
use crate::core::credentials::AccessToken;
use crate::core::protocol::{HeartBeat, NegotiatedHeartBeat, StompCommand, StompFrame, StompItem};
use crate::core::transport::{Connector, HandshakeRequest, TransportLink};
use bytes::Bytes;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const ACCEPT_VERSION: &str = "1.2,1.1,1.0";
/// Tick used by the I/O task when heart-beating is disabled in both directions.
const IDLE_TICK: Duration = Duration::from_secs(3600);
const MIN_TICK: Duration = Duration::from_millis(10);

/// Receives what an active connection's I/O task observes.
pub(crate) trait LinkObserver: Send + Sync {
    fn on_frame(&self, connection_id: u64, frame: StompFrame);
    fn on_lost(&self, connection_id: u64, reason: RealtimeError);
}

/// Completed by the I/O task with the outcome of the transport write.
type WriteAck = oneshot::Sender<Result<(), RealtimeError>>;

enum Outbound {
    Item(StompItem, Option<WriteAck>),
    Close,
}

/// A frame handed to the I/O task whose write has not been confirmed yet.
pub(crate) struct PendingWrite {
    rx: oneshot::Receiver<Result<(), RealtimeError>>,
}

impl PendingWrite {
    /// Resolves once the frame is on the wire, or with the error that kept it
    /// off. A link torn down before writing it yields `ConnectionClosed`.
    pub(crate) async fn written(self) -> Result<(), RealtimeError> {
        self.rx.await.unwrap_or(Err(RealtimeError::ConnectionClosed))
    }
}

/// A live connection. Cheap to share: every operation just queues a frame for
/// the I/O task.
pub struct ActiveConnection {
    id: u64,
    token: AccessToken,
    version: String,
    server: Option<String>,
    heartbeat: NegotiatedHeartBeat,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl std::fmt::Debug for ActiveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveConnection")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("server", &self.server)
            .field("heartbeat", &self.heartbeat)
            .field("open", &self.is_open())
            .finish()
    }
}

impl ActiveConnection {
    /// Identifies this connection among all the manager ever created.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The negotiated STOMP protocol version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The `server` header of the CONNECTED frame, if any.
    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    pub fn heartbeat(&self) -> NegotiatedHeartBeat {
        self.heartbeat
    }

    /// The token this connection authenticated with. Attached to every
    /// SUBSCRIBE and SEND made over it.
    pub fn token(&self) -> &AccessToken {
        &self.token
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Resolves once the I/O task has let go of the link.
    pub async fn closed(&self) {
        self.outbound.closed().await
    }

    /// Queues a SUBSCRIBE. The returned handle reports whether it was written.
    pub(crate) fn subscribe(
        &self,
        subscription_id: &str,
        topic: &str,
    ) -> Result<PendingWrite, RealtimeError> {
        let frame = StompFrame::new(StompCommand::Subscribe)
            .header("id", subscription_id)
            .header("destination", topic)
            .header("ack", "auto")
            .header("Authorization", self.token.bearer());
        self.push_acked(frame).map_err(|_| {
            RealtimeError::SubscriptionFailed(format!(
                "connection closed before subscribing to '{topic}'"
            ))
        })
    }

    pub(crate) fn unsubscribe(&self, subscription_id: &str) -> Result<(), RealtimeError> {
        let frame = StompFrame::new(StompCommand::Unsubscribe)
            .header("id", subscription_id)
            .header("Authorization", self.token.bearer());
        self.push(frame)
    }

    /// Sends a SEND frame and waits until the transport has taken it.
    pub(crate) async fn publish(
        &self,
        destination: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), RealtimeError> {
        let frame = StompFrame::new(StompCommand::Send)
            .header("destination", destination)
            .header("content-type", content_type)
            .header("Authorization", self.token.bearer())
            .with_body(body);
        let pending = self.push_acked(frame).map_err(|_| {
            RealtimeError::PublishFailed(format!(
                "connection closed before publishing to '{destination}'"
            ))
        })?;
        pending.written().await.map_err(|e| {
            RealtimeError::PublishFailed(format!("SEND to '{destination}' failed: {e}"))
        })
    }

    /// Asks the I/O task to send DISCONNECT and close the link. Idempotent.
    pub(crate) fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    fn push(&self, frame: StompFrame) -> Result<(), RealtimeError> {
        self.enqueue(frame, None)
    }

    fn push_acked(&self, frame: StompFrame) -> Result<PendingWrite, RealtimeError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(frame, Some(tx))?;
        Ok(PendingWrite { rx })
    }

    fn enqueue(&self, frame: StompFrame, ack: Option<WriteAck>) -> Result<(), RealtimeError> {
        debug!(
            "Queueing {} frame on connection #{}.",
            frame.command, self.id
        );
        self.outbound
            .send(Outbound::Item(StompItem::Frame(frame), ack))
            .map_err(|_| RealtimeError::ConnectionClosed)
    }
}

/// Opens the transport, performs the STOMP CONNECT exchange and, on success,
/// spawns the I/O task that keeps the link alive.
pub(crate) async fn establish(
    id: u64,
    settings: &ConnectionSettings,
    token: AccessToken,
    connector: &dyn Connector,
    observer: Weak<dyn LinkObserver>,
) -> Result<Arc<ActiveConnection>, RealtimeError> {
    let request = HandshakeRequest {
        url: settings.endpoint.clone(),
        headers: vec![("Authorization".to_string(), token.bearer())],
    };
    let mut link = connector.open(request).await.map_err(|e| match e {
        RealtimeError::HandshakeFailed(_) => e,
        other => RealtimeError::HandshakeFailed(other.to_string()),
    })?;

    let host = settings.endpoint.host_str().unwrap_or("localhost").to_string();
    let connect = StompFrame::new(StompCommand::Connect)
        .header("accept-version", ACCEPT_VERSION)
        .header("host", host)
        .header("heart-beat", settings.heartbeat.header_value())
        .header("Authorization", token.bearer());
    if let Err(e) = link.send(StompItem::Frame(connect)).await {
        link.close().await;
        return Err(RealtimeError::HandshakeFailed(format!(
            "failed to send CONNECT: {e}"
        )));
    }

    let connected =
        match tokio::time::timeout(settings.connect_timeout, await_connected(link.as_mut())).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                link.close().await;
                return Err(e);
            }
            Err(_) => {
                link.close().await;
                return Err(RealtimeError::HandshakeFailed(format!(
                    "no CONNECTED frame within {:?}",
                    settings.connect_timeout
                )));
            }
        };

    let server_heartbeat = match connected.get_header("heart-beat") {
        Some(value) => HeartBeat::parse(value).unwrap_or_else(|e| {
            warn!("Ignoring server heart-beat header: {}", e);
            HeartBeat::default()
        }),
        None => HeartBeat::default(),
    };
    let heartbeat = settings.heartbeat.negotiate(&server_heartbeat);
    let version = connected.get_header("version").unwrap_or("1.0").to_string();
    let server = connected.get_header("server").map(str::to_string);
    info!(
        "Connection #{} established (STOMP {}, server {:?}, heart-beat {:?}).",
        id, version, server, heartbeat
    );

    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_io(id, link, outbound_rx, heartbeat, observer));

    Ok(Arc::new(ActiveConnection {
        id,
        token,
        version,
        server,
        heartbeat,
        outbound,
    }))
}

/// Reads until the server answers the CONNECT frame.
async fn await_connected(link: &mut dyn TransportLink) -> Result<StompFrame, RealtimeError> {
    loop {
        match link.recv().await {
            Some(Ok(StompItem::Heartbeat)) => continue,
            Some(Ok(StompItem::Frame(frame))) => match frame.command {
                StompCommand::Connected => return Ok(frame),
                StompCommand::Error => {
                    let message = frame.get_header("message").unwrap_or("ERROR frame");
                    let body = frame.body_text();
                    let detail = if body.trim().is_empty() {
                        message.to_string()
                    } else {
                        format!("{message}: {}", body.trim())
                    };
                    return Err(RealtimeError::HandshakeFailed(detail));
                }
                other => debug!("Ignoring {} frame received before CONNECTED.", other),
            },
            Some(Err(e)) => return Err(RealtimeError::HandshakeFailed(e.to_string())),
            None => {
                return Err(RealtimeError::HandshakeFailed(
                    "transport closed before CONNECTED".to_string(),
                ));
            }
        }
    }
}

/// Owns the link for its whole life: writes queued frames, emits heart-beats
/// when idle, forwards inbound frames to the observer and watches for silence.
async fn run_io(
    id: u64,
    mut link: Box<dyn TransportLink>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    heartbeat: NegotiatedHeartBeat,
    observer: Weak<dyn LinkObserver>,
) {
    let send_every = heartbeat.send_every;
    let silence_limit = heartbeat.silence_limit();
    let tick = [send_every, silence_limit]
        .into_iter()
        .flatten()
        .min()
        .map(|d| (d / 2).max(MIN_TICK))
        .unwrap_or(IDLE_TICK);
    let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_sent = Instant::now();
    let mut last_received = Instant::now();

    let lost: Option<RealtimeError> = loop {
        tokio::select! {
            cmd = outbound_rx.recv() => match cmd {
                Some(Outbound::Item(item, ack)) => {
                    let written = link.send(item).await;
                    if let Some(ack) = ack {
                        let _ = ack.send(written.clone());
                    }
                    if let Err(e) = written {
                        break Some(e);
                    }
                    last_sent = Instant::now();
                }
                Some(Outbound::Close) | None => {
                    let _ = link.send(StompItem::Frame(StompFrame::new(StompCommand::Disconnect))).await;
                    link.close().await;
                    debug!("Connection #{} closed locally.", id);
                    break None;
                }
            },
            inbound = link.recv() => match inbound {
                Some(Ok(item)) => {
                    last_received = Instant::now();
                    if let StompItem::Frame(frame) = item {
                        match observer.upgrade() {
                            Some(observer) => observer.on_frame(id, frame),
                            None => {
                                link.close().await;
                                break None;
                            }
                        }
                    }
                }
                Some(Err(e)) => break Some(e),
                None => break Some(RealtimeError::ConnectionClosed),
            },
            _ = ticker.tick() => {
                if let Some(every) = send_every
                    && last_sent.elapsed() >= every
                {
                    if let Err(e) = link.send(StompItem::Heartbeat).await {
                        break Some(e);
                    }
                    last_sent = Instant::now();
                }
                if let Some(limit) = silence_limit
                    && last_received.elapsed() > limit
                {
                    link.close().await;
                    break Some(RealtimeError::Transport(format!(
                        "no data from server within {limit:?}"
                    )));
                }
            }
        }
    };

    outbound_rx.close();
    if let Some(reason) = lost {
        warn!("Connection #{} lost: {}", id, reason);
        if let Some(observer) = observer.upgrade() {
            observer.on_lost(id, reason);
        }
    }
}
