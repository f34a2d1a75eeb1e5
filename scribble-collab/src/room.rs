//! Rooms and the registry that owns them.
//!
//! A [`Room`] owns its participants (keyed by connection id, join order
//! kept for roster display) and one [`OperationLog`]. Sessions only hold the
//! room id; nothing points back from a participant to its room.
//!
//! Rooms are created on first join and dropped as soon as the last
//! participant leaves. History goes with them.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::operation::{Operation, Stroke, Vec2};
use crate::oplog::{OperationLog, Redone, Undone};

/// Participant colors, handed out in join order and cycling.
pub const PALETTE: [&str; 8] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#FFA07A",
    "#98D8C8", "#F7DC6F", "#BB8FCE", "#85C1E2",
];

/// A connected member of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub display_name: String,
    pub color: String,
    /// Last known pointer position. Never part of history.
    pub last_cursor: Option<Vec2>,
}

impl Participant {
    /// Name used when the client did not supply one: `User` + the first
    /// four hex digits of the id.
    pub fn default_name(id: Uuid) -> String {
        let hex = id.simple().to_string();
        format!("User{}", &hex[..4])
    }
}

/// Everything a client needs to rebuild the room from scratch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    /// Participants in join order.
    pub roster: Vec<Participant>,
    /// The visible prefix of the room's log.
    pub history: Vec<Operation>,
    /// Log revision the snapshot was taken at.
    pub revision: u64,
}

impl RoomSnapshot {
    /// Cursor of the log at snapshot time.
    pub fn cursor(&self) -> usize {
        self.history.len()
    }
}

/// Outcome of [`Room::join`].
#[derive(Debug, Clone, PartialEq)]
pub struct JoinResult {
    pub participant: Participant,
    pub snapshot: RoomSnapshot,
}

/// Outcome of [`Room::leave`].
#[derive(Debug, Clone, PartialEq)]
pub enum LeaveResult {
    /// Participant removed, these remain.
    Remaining(Vec<Participant>),
    /// Participant removed and the room is now empty.
    Close,
    NotFound,
}

/// A freshly committed operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Committed {
    pub index: usize,
    pub operation: Operation,
    pub revision: u64,
}

/// One shared canvas.
#[derive(Debug)]
pub struct Room {
    id: String,
    participants: IndexMap<Uuid, Participant>,
    log: OperationLog,
    color_cursor: usize,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            participants: IndexMap::new(),
            log: OperationLog::new(),
            color_cursor: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add a participant and return the reconciliation snapshot.
    ///
    /// A blank or missing `display_name` falls back to
    /// [`Participant::default_name`]. Joining twice with the same id
    /// returns the existing entry without consuming a palette slot.
    pub fn join(&mut self, participant_id: Uuid, display_name: Option<&str>) -> JoinResult {
        if let Some(existing) = self.participants.get(&participant_id) {
            return JoinResult {
                participant: existing.clone(),
                snapshot: self.snapshot(),
            };
        }

        let color = PALETTE[self.color_cursor % PALETTE.len()].to_string();
        self.color_cursor += 1;

        let display_name = display_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Participant::default_name(participant_id));

        let participant = Participant {
            id: participant_id,
            display_name,
            color,
            last_cursor: None,
        };
        self.participants.insert(participant_id, participant.clone());

        JoinResult {
            participant,
            snapshot: self.snapshot(),
        }
    }

    /// Remove a participant.
    pub fn leave(&mut self, participant_id: &Uuid) -> LeaveResult {
        if self.participants.shift_remove(participant_id).is_none() {
            return LeaveResult::NotFound;
        }
        if self.participants.is_empty() {
            LeaveResult::Close
        } else {
            LeaveResult::Remaining(self.roster())
        }
    }

    /// Record a participant's pointer position. `false` if unknown.
    pub fn update_cursor(&mut self, participant_id: &Uuid, position: Vec2) -> bool {
        match self.participants.get_mut(participant_id) {
            Some(participant) => {
                participant.last_cursor = Some(position);
                true
            }
            None => false,
        }
    }

    pub fn commit_draw(&mut self, author: Uuid, stroke: Stroke) -> Committed {
        self.commit(Operation::draw(author, stroke))
    }

    pub fn commit_clear(&mut self, author: Uuid) -> Committed {
        self.commit(Operation::clear(author))
    }

    /// Whether committing `operation` keeps the stored history within
    /// `max_bytes` of encoding.
    pub fn fits(&self, operation: &Operation, max_bytes: usize) -> bool {
        self.log.bytes_after_append(operation) <= max_bytes
    }

    pub fn commit(&mut self, operation: Operation) -> Committed {
        let index = self.log.append(operation);
        Committed {
            index,
            operation: self.log.visible_prefix()[index].clone(),
            revision: self.log.revision(),
        }
    }

    pub fn undo(&mut self) -> Option<Undone> {
        self.log.undo()
    }

    pub fn redo(&mut self) -> Option<Redone> {
        self.log.redo()
    }

    /// Participants in join order.
    pub fn roster(&self) -> Vec<Participant> {
        self.participants.values().cloned().collect()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            roster: self.roster(),
            history: self.log.visible_prefix().to_vec(),
            revision: self.log.revision(),
        }
    }

    pub fn participant(&self, participant_id: &Uuid) -> Option<&Participant> {
        self.participants.get(participant_id)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn is_full(&self, max_participants: usize) -> bool {
        self.participants.len() >= max_participants
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }
}

/// Why a join was refused by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("room {room_id} is full ({capacity} participants)")]
    RoomFull { room_id: String, capacity: usize },
}

/// Room id → room. Creates rooms lazily and drops empty ones.
#[derive(Debug)]
pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
    max_participants: usize,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl RoomRegistry {
    pub fn new(max_participants: usize) -> Self {
        Self {
            rooms: HashMap::new(),
            max_participants,
        }
    }

    /// Return the room, creating an empty one if the id is unseen.
    pub fn get_or_create(&mut self, room_id: &str) -> &mut Room {
        self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            log::info!("Room {room_id} created");
            Room::new(room_id)
        })
    }

    /// Join `room_id`, creating it if needed. Refuses full rooms without
    /// creating anything.
    pub fn join(
        &mut self,
        room_id: &str,
        participant_id: Uuid,
        display_name: Option<&str>,
    ) -> Result<JoinResult, JoinError> {
        if let Some(room) = self.rooms.get(room_id) {
            if room.participant(&participant_id).is_none() && room.is_full(self.max_participants) {
                return Err(JoinError::RoomFull {
                    room_id: room_id.to_string(),
                    capacity: self.max_participants,
                });
            }
        }
        Ok(self.get_or_create(room_id).join(participant_id, display_name))
    }

    /// Remove a participant; destroys the room when it empties.
    pub fn leave(&mut self, room_id: &str, participant_id: &Uuid) -> LeaveResult {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return LeaveResult::NotFound;
        };
        let result = room.leave(participant_id);
        if result == LeaveResult::Close {
            self.rooms.remove(room_id);
            log::info!("Room {room_id} removed (empty)");
        }
        result
    }

    pub fn get(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn get_mut(&mut self, room_id: &str) -> Option<&mut Room> {
        self.rooms.get_mut(room_id)
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }

    pub fn max_participants(&self) -> usize {
        self.max_participants
    }
}
