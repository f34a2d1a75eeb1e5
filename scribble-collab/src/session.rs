//! Per-connection protocol state machine.
//!
//! ```text
//!             Join (valid, room has space)
//!  Unjoined ───────────────────────────────► Joined(room_id) ──► disconnect
//!     │  ▲                                       │
//!     └──┘ anything else: ignored                └── Join again: ignored
//! ```
//!
//! [`SyncSession::handle`] mutates the [`RoomRegistry`] and returns the
//! messages to deliver, each tagged with its [`Audience`]. The caller must
//! hold the registry exclusively for the duration of the call and deliver
//! the dispatches before anyone else mutates the same room.

use uuid::Uuid;

use crate::config::ServerConfig;
use crate::operation::{Operation, Stroke, Tool, Vec2};
use crate::protocol::{ClientMessage, CommitRejection, JoinRejection, ServerMessage};
use crate::room::{Committed, JoinError, LeaveResult, RoomRegistry, RoomSnapshot};

/// Longest accepted stroke color string, in bytes.
pub const MAX_COLOR_LEN: usize = 32;

/// Who receives a dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Only the connection that sent the request.
    Sender,
    /// Everyone in the sender's room except the sender.
    Others,
    /// Everyone in the sender's room, sender included.
    Room,
}

/// A message and its audience.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub audience: Audience,
    pub message: ServerMessage,
}

impl Dispatch {
    fn sender(message: ServerMessage) -> Self {
        Self { audience: Audience::Sender, message }
    }

    fn others(message: ServerMessage) -> Self {
        Self { audience: Audience::Others, message }
    }

    fn room(message: ServerMessage) -> Self {
        Self { audience: Audience::Room, message }
    }
}

/// Input validation bounds applied by the session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionLimits {
    pub max_stroke_points: usize,
    pub max_stroke_width: f32,
    pub max_room_id_len: usize,
    pub max_display_name_len: usize,
    pub max_color_len: usize,
    /// Encoded bytes a room's history may hold. Commits past it are refused.
    pub max_history_bytes: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        ServerConfig::default().limits()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    Unjoined,
    Joined { room_id: String },
}

/// Protocol state for one connection.
#[derive(Debug)]
pub struct SyncSession {
    participant_id: Uuid,
    state: SessionState,
    /// Stroke between draw-start and draw-end. Never shared with the room
    /// until committed.
    stroke: Option<Stroke>,
    limits: SessionLimits,
}

impl SyncSession {
    pub fn new(participant_id: Uuid, limits: SessionLimits) -> Self {
        Self {
            participant_id,
            state: SessionState::Unjoined,
            stroke: None,
            limits,
        }
    }

    pub fn participant_id(&self) -> Uuid {
        self.participant_id
    }

    pub fn room_id(&self) -> Option<&str> {
        match &self.state {
            SessionState::Joined { room_id } => Some(room_id),
            SessionState::Unjoined => None,
        }
    }

    pub fn is_joined(&self) -> bool {
        matches!(self.state, SessionState::Joined { .. })
    }

    /// The stroke currently being drawn, if any.
    pub fn live_stroke(&self) -> Option<&Stroke> {
        self.stroke.as_ref()
    }

    /// Apply one inbound message.
    pub fn handle(&mut self, registry: &mut RoomRegistry, msg: ClientMessage) -> Vec<Dispatch> {
        if let ClientMessage::Ping { nonce } = msg {
            return vec![Dispatch::sender(ServerMessage::Pong { nonce })];
        }

        let room_id = match &self.state {
            SessionState::Joined { room_id } => room_id.clone(),
            SessionState::Unjoined => {
                return match msg {
                    ClientMessage::Join { room_id, display_name } => {
                        self.join(registry, room_id, display_name)
                    }
                    other => {
                        log::debug!(
                            "Ignoring {other:?} from {} before join",
                            self.participant_id
                        );
                        Vec::new()
                    }
                };
            }
        };

        let me = self.participant_id;
        let Some(room) = registry.get_mut(&room_id) else {
            log::debug!("Room {room_id} vanished under participant {me}");
            return Vec::new();
        };

        match msg {
            ClientMessage::Join { .. } => {
                log::debug!("Participant {me} already joined {room_id}, ignoring join");
                Vec::new()
            }

            ClientMessage::DrawStart { point, tool, color, width } => {
                if !point.is_finite() || !self.valid_width(width) || !self.valid_color(&color) {
                    log::debug!("Rejecting malformed draw-start from {me}");
                    return Vec::new();
                }
                self.stroke = Some(Stroke::begin(point, tool, color.clone(), width));
                log::trace!("Draw start by {me} in {room_id}");
                vec![Dispatch::others(ServerMessage::RemoteDrawStart {
                    author: me,
                    point,
                    tool,
                    color,
                    width,
                })]
            }

            ClientMessage::DrawMove { point } => {
                let max_points = self.limits.max_stroke_points;
                let Some(stroke) = self.stroke.as_mut() else {
                    return Vec::new();
                };
                if !point.is_finite() || stroke.points.len() >= max_points {
                    return Vec::new();
                }
                stroke.points.push(point);
                vec![Dispatch::others(ServerMessage::RemoteDrawMove { author: me, point })]
            }

            ClientMessage::DrawEnd => {
                let Some(stroke) = self.stroke.take() else {
                    log::debug!("Draw end from {me} without an open stroke");
                    return Vec::new();
                };
                let operation = Operation::draw(me, stroke);
                let max_bytes = self.limits.max_history_bytes;
                if !room.fits(&operation, max_bytes) {
                    log::warn!("History of {room_id} is full, dropping stroke by {me}");
                    return vec![
                        Dispatch::sender(ServerMessage::CommitRejected {
                            reason: CommitRejection::HistoryFull { max_bytes },
                        }),
                        Dispatch::others(ServerMessage::RemoteDrawCancel { author: me }),
                    ];
                }
                let committed = room.commit(operation);
                log::debug!(
                    "Committed stroke #{} at index {} in {room_id}",
                    committed.operation.sequence,
                    committed.index
                );
                vec![committed_dispatch(committed)]
            }

            ClientMessage::ClearCanvas => {
                let operation = Operation::clear(me);
                let max_bytes = self.limits.max_history_bytes;
                if !room.fits(&operation, max_bytes) {
                    log::warn!("History of {room_id} is full, dropping clear by {me}");
                    return vec![Dispatch::sender(ServerMessage::CommitRejected {
                        reason: CommitRejection::HistoryFull { max_bytes },
                    })];
                }
                let committed = room.commit(operation);
                log::info!("Canvas cleared by {me} in {room_id}");
                vec![committed_dispatch(committed)]
            }

            ClientMessage::CursorMove { position } => {
                if !position.is_finite() || !room.update_cursor(&me, position) {
                    return Vec::new();
                }
                log::trace!("Cursor move by {me} in {room_id}");
                vec![Dispatch::others(ServerMessage::RemoteCursorMove {
                    author: me,
                    position,
                })]
            }

            ClientMessage::Undo => match room.undo() {
                Some(undone) => {
                    log::debug!("Undo by {me} in {room_id}, cursor now {}", undone.cursor);
                    vec![Dispatch::room(ServerMessage::HistoryTruncated {
                        cursor: undone.cursor,
                        history: room.log().visible_prefix().to_vec(),
                        revision: undone.revision,
                    })]
                }
                None => Vec::new(),
            },

            ClientMessage::Redo => match room.redo() {
                Some(redone) => {
                    log::debug!("Redo by {me} in {room_id}, cursor now {}", redone.index + 1);
                    vec![Dispatch::room(ServerMessage::HistoryExtended {
                        cursor: redone.index + 1,
                        operation: redone.operation,
                        revision: redone.revision,
                    })]
                }
                None => Vec::new(),
            },

            ClientMessage::SyncRequest => vec![Dispatch::sender(ServerMessage::Resync {
                snapshot: room.snapshot(),
            })],

            ClientMessage::Ping { .. } => Vec::new(),
        }
    }

    /// Leave the room (if joined). Any open stroke is dropped uncommitted.
    pub fn disconnect(&mut self, registry: &mut RoomRegistry) -> Vec<Dispatch> {
        self.stroke = None;
        let state = std::mem::replace(&mut self.state, SessionState::Unjoined);
        let SessionState::Joined { room_id } = state else {
            return Vec::new();
        };

        match registry.leave(&room_id, &self.participant_id) {
            LeaveResult::Remaining(roster) => {
                log::info!("Participant {} left room {room_id}", self.participant_id);
                vec![Dispatch::others(ServerMessage::ParticipantLeft {
                    participant_id: self.participant_id,
                    roster,
                })]
            }
            LeaveResult::Close => {
                log::info!(
                    "Participant {} left room {room_id} (last one)",
                    self.participant_id
                );
                Vec::new()
            }
            LeaveResult::NotFound => Vec::new(),
        }
    }

    /// Fresh snapshot of the session's room, used to resynchronize a
    /// connection that fell behind.
    pub fn snapshot(&self, registry: &RoomRegistry) -> Option<RoomSnapshot> {
        registry.get(self.room_id()?).map(|room| room.snapshot())
    }

    fn join(
        &mut self,
        registry: &mut RoomRegistry,
        room_id: String,
        display_name: Option<String>,
    ) -> Vec<Dispatch> {
        let room_id = room_id.trim().to_string();
        if room_id.is_empty() || room_id.chars().count() > self.limits.max_room_id_len {
            log::debug!("Rejecting join from {}: bad room id", self.participant_id);
            return vec![Dispatch::sender(ServerMessage::JoinRejected {
                reason: JoinRejection::InvalidRoomId,
            })];
        }

        let display_name = display_name.map(|name| {
            name.trim()
                .chars()
                .take(self.limits.max_display_name_len)
                .collect::<String>()
        });

        match registry.join(&room_id, self.participant_id, display_name.as_deref()) {
            Ok(joined) => {
                log::info!(
                    "Participant {} ({}) joined room {room_id}",
                    joined.participant.display_name,
                    self.participant_id
                );
                self.state = SessionState::Joined { room_id };
                vec![
                    Dispatch::sender(ServerMessage::Joined {
                        self_id: self.participant_id,
                        participant: joined.participant.clone(),
                        snapshot: joined.snapshot.clone(),
                    }),
                    Dispatch::others(ServerMessage::ParticipantJoined {
                        participant: joined.participant,
                        roster: joined.snapshot.roster,
                    }),
                ]
            }
            Err(JoinError::RoomFull { capacity, .. }) => {
                log::info!(
                    "Rejecting join from {}: room {room_id} is full",
                    self.participant_id
                );
                vec![Dispatch::sender(ServerMessage::JoinRejected {
                    reason: JoinRejection::RoomFull { capacity },
                })]
            }
        }
    }

    fn valid_width(&self, width: f32) -> bool {
        width.is_finite() && width > 0.0 && width <= self.limits.max_stroke_width
    }

    fn valid_color(&self, color: &str) -> bool {
        !color.is_empty() && color.len() <= self.limits.max_color_len
    }
}

fn committed_dispatch(committed: Committed) -> Dispatch {
    Dispatch::room(ServerMessage::OperationCommitted {
        index: committed.index,
        operation: committed.operation,
        revision: committed.revision,
    })
}
