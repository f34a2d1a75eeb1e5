//! Client-side replica of a room's visible history.
//!
//! The mirror holds exactly the visible prefix the server last told it
//! about, tagged with the log revision that produced it. Incremental
//! updates (commit, redo) only apply when they are the next revision and
//! line up with the mirror's length; full-state updates (join, resync, undo)
//! replace the mirror outright. Anything else marks the mirror stale, and
//! the owner is expected to ask the server for a resync.

use crate::operation::{effective_ops, Operation};
use crate::protocol::ServerMessage;
use crate::room::RoomSnapshot;

/// What [`HistoryMirror::apply`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorUpdate {
    /// Contents replaced by a full prefix.
    Replaced,
    /// One operation appended.
    Applied,
    /// Not a history message, already reflected, or waiting for a resync.
    Ignored,
    /// The message does not follow from the mirror's state. Reported once,
    /// on the transition to stale.
    Diverged { expected: u64, received: u64 },
}

#[derive(Debug, Clone, Default)]
pub struct HistoryMirror {
    operations: Vec<Operation>,
    /// `None` until the first snapshot arrives.
    revision: Option<u64>,
    stale: bool,
}

impl HistoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, msg: &ServerMessage) -> MirrorUpdate {
        match msg {
            ServerMessage::Joined { snapshot, .. } | ServerMessage::Resync { snapshot } => {
                self.replace(snapshot);
                MirrorUpdate::Replaced
            }

            ServerMessage::HistoryTruncated { history, revision, .. } => {
                match self.revision {
                    Some(current) if *revision > current => {}
                    _ => return MirrorUpdate::Ignored,
                }
                self.operations = history.clone();
                self.revision = Some(*revision);
                self.stale = false;
                MirrorUpdate::Replaced
            }

            ServerMessage::OperationCommitted { index, operation, revision } => {
                self.append(*index, operation, *revision)
            }

            ServerMessage::HistoryExtended { cursor, operation, revision } => {
                match cursor.checked_sub(1) {
                    Some(index) => self.append(index, operation, *revision),
                    None => self.diverge(*revision),
                }
            }

            _ => MirrorUpdate::Ignored,
        }
    }

    /// Replace the contents with a snapshot and clear any staleness.
    pub fn replace(&mut self, snapshot: &RoomSnapshot) {
        self.operations = snapshot.history.clone();
        self.revision = Some(snapshot.revision);
        self.stale = false;
    }

    fn append(&mut self, index: usize, operation: &Operation, revision: u64) -> MirrorUpdate {
        let Some(current) = self.revision else {
            return MirrorUpdate::Ignored;
        };
        if revision <= current || self.stale {
            return MirrorUpdate::Ignored;
        }
        if revision != current + 1 || index != self.operations.len() {
            return self.diverge(revision);
        }
        self.operations.push(operation.clone());
        self.revision = Some(revision);
        MirrorUpdate::Applied
    }

    fn diverge(&mut self, received: u64) -> MirrorUpdate {
        if self.stale {
            return MirrorUpdate::Ignored;
        }
        self.stale = true;
        let expected = self.revision.map_or(0, |r| r + 1);
        log::debug!("History mirror diverged: expected revision {expected}, got {received}");
        MirrorUpdate::Diverged { expected, received }
    }

    /// The visible prefix as last reported by the server.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Operations a renderer has to draw: everything after the last clear.
    pub fn effective_operations(&self) -> &[Operation] {
        effective_ops(&self.operations)
    }

    pub fn cursor(&self) -> usize {
        self.operations.len()
    }

    pub fn revision(&self) -> Option<u64> {
        self.revision
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn is_synced(&self) -> bool {
        self.revision.is_some() && !self.stale
    }
}
