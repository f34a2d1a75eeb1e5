//! Per-room linear history with a shared undo/redo cursor.
//!
//! ```text
//!  history:  [ op0 | op1 | op2 | op3 | op4 ]
//!                              ▲
//!                           cursor = 3
//!  visible prefix = op0..op2      redo-reserve = op3, op4
//! ```
//!
//! The canvas is always exactly "replay `history[..cursor]` from empty".
//! Appending while a redo-reserve exists destroys the reserve: history is a
//! single branch, never a tree.

use crate::operation::Operation;
use crate::protocol::FrameCodec;

/// Worst-case growth of an operation's encoding once the log stamps its
/// sequence (a varint u64 takes up to 9 bytes instead of 1).
const SEQUENCE_STAMP_BYTES: usize = 8;

/// Result of a successful undo.
#[derive(Debug, Clone, PartialEq)]
pub struct Undone {
    /// Cursor after the undo (= new visible prefix length).
    pub cursor: usize,
    /// The operation that just left the visible prefix.
    pub operation: Operation,
    pub revision: u64,
}

/// Result of a successful redo.
#[derive(Debug, Clone, PartialEq)]
pub struct Redone {
    /// Index of the re-applied operation; the cursor is now `index + 1`.
    pub index: usize,
    pub operation: Operation,
    pub revision: u64,
}

/// Append/undo/redo state machine for one room. No I/O.
#[derive(Debug, Clone, Default)]
pub struct OperationLog {
    history: Vec<Operation>,
    /// Encoded size of each entry of `history`.
    sizes: Vec<usize>,
    cursor: usize,
    /// Last sequence stamp handed out. Never reused, even after truncation.
    last_sequence: u64,
    /// Bumped by every successful append/undo/redo.
    revision: u64,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit `op`, discarding any redo-reserve.
    ///
    /// Stamps the next sequence number and returns the committed index
    /// (the cursor before the append).
    pub fn append(&mut self, mut op: Operation) -> usize {
        self.history.truncate(self.cursor);
        self.sizes.truncate(self.cursor);

        self.last_sequence += 1;
        op.sequence = self.last_sequence;

        self.sizes.push(encoded_len(&op));
        self.history.push(op);
        self.cursor = self.history.len();
        self.revision += 1;
        self.cursor - 1
    }

    /// Step the cursor back one operation. `None` when nothing is applied.
    pub fn undo(&mut self) -> Option<Undone> {
        if self.cursor == 0 {
            return None;
        }
        self.cursor -= 1;
        self.revision += 1;
        Some(Undone {
            cursor: self.cursor,
            operation: self.history[self.cursor].clone(),
            revision: self.revision,
        })
    }

    /// Re-apply the first operation of the redo-reserve. `None` when the
    /// reserve is empty.
    pub fn redo(&mut self) -> Option<Redone> {
        if self.cursor == self.history.len() {
            return None;
        }
        let index = self.cursor;
        self.cursor += 1;
        self.revision += 1;
        Some(Redone {
            index,
            operation: self.history[index].clone(),
            revision: self.revision,
        })
    }

    /// `history[..cursor]`: what every participant should see.
    pub fn visible_prefix(&self) -> &[Operation] {
        &self.history[..self.cursor]
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Total stored operations, including the redo-reserve.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Number of operations available to redo.
    pub fn redo_depth(&self) -> usize {
        self.history.len() - self.cursor
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor < self.history.len()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Encoded size of every stored operation, redo-reserve included. Any
    /// visible prefix the log can reach is at most this large.
    pub fn history_bytes(&self) -> usize {
        self.sizes.iter().sum()
    }

    /// What [`history_bytes`](Self::history_bytes) would be after
    /// appending `op`.
    pub fn bytes_after_append(&self, op: &Operation) -> usize {
        self.sizes[..self.cursor].iter().sum::<usize>() + encoded_len(op) + SEQUENCE_STAMP_BYTES
    }
}

fn encoded_len(op: &Operation) -> usize {
    FrameCodec::encoded_len(op).unwrap_or_default()
}
