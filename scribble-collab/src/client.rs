//! WebSocket sync client for connecting to the canvas server.
//!
//! Provides:
//! - Connection lifecycle (connect, join, disconnect)
//! - Drawing, undo/redo and cursor commands
//! - A [`HistoryMirror`] kept in step with the room, resynchronized
//!   automatically when it detects a gap
//! - A [`PresenceBoard`] with remote live strokes and cursors

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::mirror::{HistoryMirror, MirrorUpdate};
use crate::operation::{Operation, Stroke, Tool, Vec2};
use crate::presence::{CursorThrottle, PresenceBoard};
use crate::protocol::{
    ClientMessage, CommitRejection, FrameCodec, JoinRejection, ProtocolError, ServerMessage,
};
use crate::room::Participant;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// We are in the room
    Joined { self_id: Uuid, participant: Participant },
    JoinRejected(JoinRejection),
    /// A participant joined the room
    ParticipantJoined(Participant),
    /// A participant left the room
    ParticipantLeft(Uuid),
    /// A remote participant started or extended a live stroke
    LiveStroke { author: Uuid },
    /// A remote live stroke was dropped without being committed
    LiveStrokeCancelled { author: Uuid },
    RemoteCursor { author: Uuid, position: Vec2 },
    /// The mirrored history changed
    HistoryChanged { revision: u64, cursor: usize },
    /// The mirror fell out of step and a snapshot was requested
    ResyncRequested { expected: u64, received: u64 },
    /// Our draw-end or clear was refused
    CommitRejected(CommitRejection),
    Pong(u64),
}

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("not connected")]
    NotConnected,
    #[error("connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

const EVENT_CAPACITY: usize = 1024;

/// The sync client.
///
/// Manages a WebSocket connection to the canvas server and keeps a local
/// replica of the joined room.
pub struct SyncClient {
    /// Server URL
    server_url: String,

    codec: FrameCodec,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Replica of the room's visible history
    mirror: Arc<RwLock<HistoryMirror>>,

    /// Roster, remote cursors and live strokes
    presence: Arc<RwLock<PresenceBoard>>,

    /// Outgoing cursor rate limiter
    cursor_throttle: Mutex<CursorThrottle>,

    /// Channel to send frames to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    /// Create a new sync client.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_codec(server_url, FrameCodec::default())
    }

    pub fn with_codec(server_url: impl Into<String>, codec: FrameCodec) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        Self {
            server_url: server_url.into(),
            codec,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            mirror: Arc::new(RwLock::new(HistoryMirror::new())),
            presence: Arc::new(RwLock::new(PresenceBoard::new())),
            cursor_throttle: Mutex::new(CursorThrottle::default()),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok(connected) => connected,
            Err(source) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::Connect {
                    url: self.server_url.clone(),
                    source,
                });
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Outgoing frame channel
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx.clone());

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(frame.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        emit(&self.event_tx, SyncEvent::Connected);

        // Reader task: apply incoming messages to the local replica
        let reader = Reader {
            codec: self.codec,
            state: self.state.clone(),
            mirror: self.mirror.clone(),
            presence: self.presence.clone(),
            event_tx: self.event_tx.clone(),
            // Must not keep the writer alive after disconnect().
            resync_tx: out_tx.downgrade(),
        };
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => reader.handle_frame(&data).await,
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *reader.state.write().await = ConnectionState::Disconnected;
            emit(&reader.event_tx, SyncEvent::Disconnected);
        });

        Ok(())
    }

    /// Ask to join `room_id`. The outcome arrives as [`SyncEvent::Joined`]
    /// or [`SyncEvent::JoinRejected`].
    pub async fn join(&self, room_id: &str, display_name: Option<&str>) -> Result<(), ClientError> {
        self.send(&ClientMessage::Join {
            room_id: room_id.to_string(),
            display_name: display_name.map(str::to_string),
        })
        .await
    }

    pub async fn begin_stroke(
        &self,
        point: Vec2,
        tool: Tool,
        color: &str,
        width: f32,
    ) -> Result<(), ClientError> {
        self.send(&ClientMessage::DrawStart {
            point,
            tool,
            color: color.to_string(),
            width,
        })
        .await
    }

    pub async fn extend_stroke(&self, point: Vec2) -> Result<(), ClientError> {
        self.send(&ClientMessage::DrawMove { point }).await
    }

    /// Commit the stroke begun with [`begin_stroke`](Self::begin_stroke).
    pub async fn end_stroke(&self) -> Result<(), ClientError> {
        self.send(&ClientMessage::DrawEnd).await
    }

    /// Send a whole stroke: start, one move per remaining point, end.
    pub async fn draw_stroke(&self, stroke: &Stroke) -> Result<(), ClientError> {
        let Some((first, rest)) = stroke.points.split_first() else {
            return Ok(());
        };
        self.begin_stroke(*first, stroke.tool, &stroke.color, stroke.width)
            .await?;
        for point in rest {
            self.extend_stroke(*point).await?;
        }
        self.end_stroke().await
    }

    /// Send a cursor position, rate-limited to 30fps. Returns whether it
    /// went out; a throttled position can be sent with
    /// [`flush_cursor`](Self::flush_cursor).
    pub async fn move_cursor(&self, position: Vec2) -> Result<bool, ClientError> {
        let Some(position) = self.cursor_throttle.lock().await.offer(position) else {
            return Ok(false);
        };
        self.send(&ClientMessage::CursorMove { position }).await?;
        Ok(true)
    }

    pub async fn flush_cursor(&self) -> Result<bool, ClientError> {
        let Some(position) = self.cursor_throttle.lock().await.flush() else {
            return Ok(false);
        };
        self.send(&ClientMessage::CursorMove { position }).await?;
        Ok(true)
    }

    pub async fn undo(&self) -> Result<(), ClientError> {
        self.send(&ClientMessage::Undo).await
    }

    pub async fn redo(&self) -> Result<(), ClientError> {
        self.send(&ClientMessage::Redo).await
    }

    pub async fn clear(&self) -> Result<(), ClientError> {
        self.send(&ClientMessage::ClearCanvas).await
    }

    /// Ask for a fresh snapshot of the room.
    pub async fn request_sync(&self) -> Result<(), ClientError> {
        self.send(&ClientMessage::SyncRequest).await
    }

    /// Send a ping to the server.
    pub async fn ping(&self, nonce: u64) -> Result<(), ClientError> {
        self.send(&ClientMessage::Ping { nonce }).await
    }

    /// Close the connection. The server treats it as leaving the room.
    pub async fn disconnect(&mut self) {
        // Dropping the last sender ends the writer task, which closes the socket.
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), ClientError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let frame = self.codec.encode(msg)?;
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(frame)
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Our participant id, once joined.
    pub async fn self_id(&self) -> Option<Uuid> {
        self.presence.read().await.local_id()
    }

    /// The mirrored visible history.
    pub async fn history(&self) -> Vec<Operation> {
        self.mirror.read().await.operations().to_vec()
    }

    /// Revision of the mirrored history (`None` before joining).
    pub async fn revision(&self) -> Option<u64> {
        self.mirror.read().await.revision()
    }

    pub async fn is_synced(&self) -> bool {
        self.mirror.read().await.is_synced()
    }

    pub async fn roster(&self) -> Vec<Participant> {
        self.presence.read().await.roster().to_vec()
    }

    pub async fn live_stroke(&self, author: &Uuid) -> Option<Stroke> {
        self.presence.read().await.live_stroke(author).cloned()
    }

    pub async fn remote_cursor(&self, author: &Uuid) -> Option<Vec2> {
        self.presence.read().await.cursor(author)
    }
}

/// State shared with the reader task.
struct Reader {
    codec: FrameCodec,
    state: Arc<RwLock<ConnectionState>>,
    mirror: Arc<RwLock<HistoryMirror>>,
    presence: Arc<RwLock<PresenceBoard>>,
    event_tx: mpsc::Sender<SyncEvent>,
    resync_tx: mpsc::WeakSender<Vec<u8>>,
}

impl Reader {
    async fn handle_frame(&self, data: &[u8]) {
        let msg: ServerMessage = match self.codec.decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Dropping undecodable server frame: {e}");
                return;
            }
        };

        let update = self.mirror.write().await.apply(&msg);
        self.presence.write().await.handle_message(&msg);

        match update {
            MirrorUpdate::Replaced | MirrorUpdate::Applied => {
                let mirror = self.mirror.read().await;
                if let Some(revision) = mirror.revision() {
                    emit(
                        &self.event_tx,
                        SyncEvent::HistoryChanged {
                            revision,
                            cursor: mirror.cursor(),
                        },
                    );
                }
            }
            MirrorUpdate::Diverged { expected, received } => {
                log::info!("History out of step (expected {expected}, got {received}), resyncing");
                self.request_resync().await;
                emit(&self.event_tx, SyncEvent::ResyncRequested { expected, received });
            }
            MirrorUpdate::Ignored => {}
        }

        let event = match msg {
            ServerMessage::Joined { self_id, participant, .. } => {
                Some(SyncEvent::Joined { self_id, participant })
            }
            ServerMessage::JoinRejected { reason } => Some(SyncEvent::JoinRejected(reason)),
            ServerMessage::ParticipantJoined { participant, .. } => {
                Some(SyncEvent::ParticipantJoined(participant))
            }
            ServerMessage::ParticipantLeft { participant_id, .. } => {
                Some(SyncEvent::ParticipantLeft(participant_id))
            }
            ServerMessage::RemoteDrawStart { author, .. }
            | ServerMessage::RemoteDrawMove { author, .. } => Some(SyncEvent::LiveStroke { author }),
            ServerMessage::RemoteDrawCancel { author } => {
                Some(SyncEvent::LiveStrokeCancelled { author })
            }
            ServerMessage::CommitRejected { reason } => Some(SyncEvent::CommitRejected(reason)),
            ServerMessage::RemoteCursorMove { author, position } => {
                Some(SyncEvent::RemoteCursor { author, position })
            }
            ServerMessage::Pong { nonce } => Some(SyncEvent::Pong(nonce)),
            _ => None,
        };
        if let Some(event) = event {
            emit(&self.event_tx, event);
        }
    }

    async fn request_resync(&self) {
        let Some(tx) = self.resync_tx.upgrade() else {
            return;
        };
        match self.codec.encode(&ClientMessage::SyncRequest) {
            Ok(frame) => {
                let _ = tx.send(frame).await;
            }
            Err(e) => log::error!("Failed to encode sync request: {e}"),
        }
    }
}

/// Events are dropped rather than stalling the reader when the application
/// stops draining them.
fn emit(tx: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    if let Err(e) = tx.try_send(event) {
        log::trace!("Dropping sync event: {e}");
    }
}
