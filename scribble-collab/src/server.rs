//! WebSocket sync server with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── RoomRegistry ── Room ── OperationLog
//!             ├── SyncSession ── Hub ┤
//! Client B ──┘   (per conn)    (lock)└── BroadcastGroup (per room)
//!                                              │
//!                                   ┌──────────┼───────────┐
//!                                   ▼          ▼           ▼
//!                                Client A   Client B    Client C
//! ```
//!
//! Every inbound message is applied while holding the hub lock, and the
//! frames it produces for the room are published to the room's broadcast
//! group before the lock is released. Replies for the sender alone are
//! encoded and written after the lock is dropped, once every room frame
//! published up to that point has been written to the same socket.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Envelope};
use crate::config::ServerConfig;
use crate::protocol::{ClientMessage, FrameCodec, ServerMessage};
use crate::room::RoomRegistry;
use crate::session::{Audience, Dispatch, SyncSession};

/// Room frames written in a row before the socket is read again.
const MAX_BROADCAST_BURST: usize = 64;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("handshake from origin {origin:?} rejected")]
    OriginRejected { origin: Option<String> },
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rejected_handshakes: u64,
    /// Snapshots sent to connections that fell behind their room.
    pub resyncs: u64,
}

/// Result of applying one message under the hub lock.
#[derive(Debug, Default)]
struct Applied {
    /// Replies for the sender only, encoded once the lock is released.
    direct: Vec<ServerMessage>,
    /// Set when the message joined a room.
    subscription: Option<Receiver<Envelope>>,
    /// Publish sequence the sender's snapshot is current as of. Room state
    /// frames at or below it are already reflected in that snapshot.
    snapshot_seq: Option<u64>,
    /// Publish sequence of the sender's room after the message was handled.
    published: u64,
}

/// All shared room state. Mutated only while its mutex is held.
struct Hub {
    registry: RoomRegistry,
    groups: HashMap<String, BroadcastGroup>,
    broadcast_capacity: usize,
}

impl Hub {
    fn new(config: &ServerConfig) -> Self {
        Self {
            registry: RoomRegistry::new(config.max_participants_per_room),
            groups: HashMap::new(),
            broadcast_capacity: config.broadcast_capacity,
        }
    }

    fn apply(&mut self, session: &mut SyncSession, codec: &FrameCodec, msg: ClientMessage) -> Applied {
        let was_joined = session.is_joined();
        let dispatches = session.handle(&mut self.registry, msg);
        let mut applied = Applied::default();

        if !was_joined {
            if let Some(room_id) = session.room_id() {
                let capacity = self.broadcast_capacity;
                let group = self
                    .groups
                    .entry(room_id.to_string())
                    .or_insert_with(|| BroadcastGroup::new(capacity));
                applied.subscription = Some(group.subscribe());
                applied.snapshot_seq = Some(group.published());
            }
        }

        for dispatch in dispatches {
            match dispatch.audience {
                Audience::Sender => {
                    if matches!(dispatch.message, ServerMessage::Resync { .. }) {
                        applied.snapshot_seq =
                            self.group_for(session).map(BroadcastGroup::published);
                    }
                    applied.direct.push(dispatch.message);
                }
                Audience::Others | Audience::Room => match self.group_for(session) {
                    Some(group) => publish(group, session.participant_id(), codec, dispatch),
                    None => log::warn!(
                        "No broadcast group for participant {}, dropping {}",
                        session.participant_id(),
                        dispatch.message.kind()
                    ),
                },
            }
        }
        applied.published = self.group_for(session).map_or(0, BroadcastGroup::published);
        applied
    }

    /// Fresh snapshot for a lagging connection, plus the publish sequence
    /// it is current as of.
    fn resync(&self, session: &SyncSession) -> Option<(ServerMessage, u64)> {
        let snapshot = session.snapshot(&self.registry)?;
        let seq = self.group_for(session)?.published();
        Some((ServerMessage::Resync { snapshot }, seq))
    }

    fn disconnect(&mut self, session: &mut SyncSession, codec: &FrameCodec) {
        let Some(room_id) = session.room_id().map(str::to_string) else {
            return;
        };
        let dispatches = session.disconnect(&mut self.registry);
        if let Some(group) = self.groups.get(&room_id) {
            for dispatch in dispatches {
                publish(group, session.participant_id(), codec, dispatch);
            }
        }
        if !self.registry.contains(&room_id) {
            self.groups.remove(&room_id);
        }
    }

    fn group_for(&self, session: &SyncSession) -> Option<&BroadcastGroup> {
        self.groups.get(session.room_id()?)
    }
}

fn publish(group: &BroadcastGroup, sender: Uuid, codec: &FrameCodec, dispatch: Dispatch) {
    let exclude = match dispatch.audience {
        Audience::Others => Some(sender),
        Audience::Room | Audience::Sender => None,
    };
    let Some(frame) = encode(codec, &dispatch.message) else {
        return;
    };
    if dispatch.message.is_relay() {
        group.publish_relay(exclude, Arc::new(frame));
    } else {
        group.publish(exclude, Arc::new(frame));
    }
}

fn encode(codec: &FrameCodec, message: &ServerMessage) -> Option<Vec<u8>> {
    match codec.encode(message) {
        Ok(frame) => Some(frame),
        Err(e) => {
            log::error!("Failed to encode {}: {e}", message.kind());
            None
        }
    }
}

/// One connection's view of its room's broadcast stream.
struct Outbound {
    participant_id: Uuid,
    rx: Option<Receiver<Envelope>>,
    /// Envelope taken off the channel early by [`Outbound::next_through`].
    held: Option<Envelope>,
    /// Room state frames up to this sequence are covered by a snapshot
    /// already sent.
    skip_through: u64,
}

impl Outbound {
    fn new(participant_id: Uuid) -> Self {
        Self {
            participant_id,
            rx: None,
            held: None,
            skip_through: 0,
        }
    }

    fn subscribe(&mut self, rx: Receiver<Envelope>) {
        self.rx = Some(rx);
        self.held = None;
    }

    /// Wait for the next envelope. Pending forever while not subscribed.
    async fn recv(&mut self) -> Result<Envelope, RecvError> {
        if let Some(envelope) = self.held.take() {
            return Ok(envelope);
        }
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Next envelope already buffered with a sequence of at most `seq`,
    /// without waiting.
    fn next_through(&mut self, seq: u64) -> Option<Result<Envelope, RecvError>> {
        let received = match self.held.take() {
            Some(envelope) => Ok(envelope),
            None => match self.rx.as_mut()?.try_recv() {
                Ok(envelope) => Ok(envelope),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Closed) => Err(RecvError::Closed),
                Err(TryRecvError::Lagged(n)) => Err(RecvError::Lagged(n)),
            },
        };
        match received {
            Ok(envelope) if envelope.seq > seq => {
                self.held = Some(envelope);
                None
            }
            other => Some(other),
        }
    }

    fn admits(&self, envelope: &Envelope) -> bool {
        envelope.is_for(&self.participant_id) && !envelope.covered_by(self.skip_through)
    }

    /// The frame to write for one receive result, if any. A connection that
    /// lost frames gets a fresh snapshot in their place.
    async fn frame_for(
        &mut self,
        received: Result<Envelope, RecvError>,
        hub: &Mutex<Hub>,
        session: &SyncSession,
        codec: &FrameCodec,
        stats: &RwLock<ServerStats>,
    ) -> Option<Vec<u8>> {
        match received {
            Ok(envelope) => self.admits(&envelope).then(|| envelope.frame.to_vec()),
            Err(RecvError::Lagged(n)) => {
                log::warn!(
                    "Participant {} lagged by {n} frames, resyncing",
                    self.participant_id
                );
                let (resync, seq) = hub.lock().await.resync(session)?;
                self.skip_through = seq;
                stats.write().await.resyncs += 1;
                encode(codec, &resync)
            }
            Err(RecvError::Closed) => {
                self.rx = None;
                None
            }
        }
    }
}

/// Accept the handshake only from allowed origins.
fn check_origin(
    config: &ServerConfig,
    request: &Request,
    response: Response,
) -> Result<Response, ErrorResponse> {
    let origin = request
        .headers()
        .get("origin")
        .and_then(|value| value.to_str().ok());
    if config.origin_allowed(origin) {
        return Ok(response);
    }
    log::warn!("Rejecting handshake from origin {origin:?}");
    let mut error = ErrorResponse::new(Some("origin not allowed".to_string()));
    *error.status_mut() = StatusCode::FORBIDDEN;
    Err(error)
}

/// The sync server.
pub struct SyncServer {
    config: Arc<ServerConfig>,
    hub: Arc<Mutex<Hub>>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let hub = Hub::new(&config);
        Self {
            config: Arc::new(config),
            hub: Arc::new(Mutex::new(hub)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Start listening for WebSocket connections. Runs forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` completes. Connections already accepted keep
    /// running on their own tasks.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        tokio::pin!(shutdown);
        loop {
            let (stream, addr) = tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Sync server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("Failed to accept connection: {e}");
                        continue;
                    }
                },
            };
            log::debug!("New TCP connection from {addr}");

            let config = self.config.clone();
            let hub = self.hub.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, config, hub, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        config: Arc<ServerConfig>,
        hub: Arc<Mutex<Hub>>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), ServerError> {
        let mut rejected_origin = None;
        let accepted = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            check_origin(&config, req, resp).inspect_err(|_| {
                rejected_origin = Some(
                    req.headers()
                        .get("origin")
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string),
                );
            })
        })
        .await;
        let ws_stream = match accepted {
            Ok(ws_stream) => ws_stream,
            Err(e) => {
                if let Some(origin) = rejected_origin {
                    stats.write().await.rejected_handshakes += 1;
                    return Err(ServerError::OriginRejected { origin });
                }
                return Err(e.into());
            }
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let codec = config.codec();
        let mut session = SyncSession::new(Uuid::new_v4(), config.limits());
        let mut outbound = Outbound::new(session.participant_id());
        let mut burst = 0usize;

        let period = Duration::from_secs(config.heartbeat_interval_secs);
        let idle_timeout = Duration::from_secs(config.idle_timeout_secs);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        let mut last_seen = Instant::now();

        let result: Result<(), ServerError> = async {
            loop {
                tokio::select! {
                    // Drain published frames before reading the next inbound
                    // message, but read the socket at least once per burst.
                    biased;

                    _ = heartbeat.tick() => {
                        if last_seen.elapsed() > idle_timeout {
                            log::info!("Closing idle connection from {addr}");
                            break;
                        }
                        ws_sender.send(Message::Ping(Vec::new().into())).await?;
                    }

                    // Outgoing broadcast frame
                    received = outbound.recv(), if burst < MAX_BROADCAST_BURST => {
                        burst += 1;
                        let frame = outbound
                            .frame_for(received, &hub, &session, &codec, &stats)
                            .await;
                        if let Some(frame) = frame {
                            ws_sender.send(Message::Binary(frame.into())).await?;
                        }
                    }

                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        burst = 0;
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                last_seen = Instant::now();
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += data.len() as u64;
                                }

                                let msg = match codec.decode::<ClientMessage>(&data) {
                                    Ok(msg) => msg,
                                    Err(e) => {
                                        log::debug!("Dropping undecodable frame from {addr}: {e}");
                                        continue;
                                    }
                                };

                                let applied = {
                                    let mut hub = hub.lock().await;
                                    let applied = hub.apply(&mut session, &codec, msg);
                                    if applied.subscription.is_some() {
                                        stats.write().await.active_rooms = hub.registry.room_count();
                                    }
                                    applied
                                };
                                if let Some(rx) = applied.subscription {
                                    outbound.subscribe(rx);
                                }
                                if let Some(seq) = applied.snapshot_seq {
                                    outbound.skip_through = seq;
                                }
                                // Room frames published up to this point go out first
                                while let Some(received) = outbound.next_through(applied.published) {
                                    let frame = outbound
                                        .frame_for(received, &hub, &session, &codec, &stats)
                                        .await;
                                    if let Some(frame) = frame {
                                        ws_sender.send(Message::Binary(frame.into())).await?;
                                    }
                                }
                                for message in &applied.direct {
                                    if let Some(frame) = encode(&codec, message) {
                                        ws_sender.send(Message::Binary(frame.into())).await?;
                                    }
                                }
                            }

                            Some(Ok(Message::Text(_))) => {
                                last_seen = Instant::now();
                                log::debug!("Ignoring text frame from {addr}");
                            }

                            Some(Ok(Message::Ping(data))) => {
                                last_seen = Instant::now();
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Ok(Message::Pong(_))) => {
                                last_seen = Instant::now();
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Err(e)) => {
                                log::warn!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Burst exhausted and the socket had nothing to read
                    _ = std::future::ready(()), if burst >= MAX_BROADCAST_BURST => {
                        burst = 0;
                    }
                }
            }
            Ok(())
        }
        .await;

        // Cleanup: leave the room whatever ended the loop
        drop(outbound);
        {
            let mut hub = hub.lock().await;
            hub.disconnect(&mut session, &codec);
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = hub.registry.room_count();
        }
        let _ = ws_sender.close().await;

        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.hub.lock().await.registry.room_count()
    }

    /// Participants currently in `room_id` (0 if the room does not exist).
    pub async fn participant_count(&self, room_id: &str) -> usize {
        self.hub
            .lock()
            .await
            .registry
            .get(room_id)
            .map_or(0, |room| room.participant_count())
    }
}
