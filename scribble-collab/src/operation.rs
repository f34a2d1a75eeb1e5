//! Committed canvas edits.
//!
//! An [`Operation`] is immutable once the room's
//! [`OperationLog`](crate::oplog::OperationLog) has stamped it. Ordering is
//! decided by `sequence` (server arrival order); `timestamp_ms` is carried
//! for display only.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// 2D position in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Vec2) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Both components are finite (no NaN / infinity).
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl Default for Vec2 {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Drawing tool used for a stroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Tool {
    #[default]
    Brush,
    Eraser,
}

/// A finished freehand stroke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub tool: Tool,
    /// CSS hex color, e.g. `#1e90ff`.
    pub color: String,
    pub width: f32,
    pub points: Vec<Vec2>,
}

impl Stroke {
    /// Start a stroke at `origin`.
    pub fn begin(origin: Vec2, tool: Tool, color: impl Into<String>, width: f32) -> Self {
        Self {
            tool,
            color: color.into(),
            width,
            points: vec![origin],
        }
    }

    /// Total polyline length.
    pub fn length(&self) -> f32 {
        self.points
            .windows(2)
            .map(|pair| pair[0].distance(&pair[1]))
            .sum()
    }
}

/// What an operation does to the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationKind {
    Draw(Stroke),
    /// Wipes everything drawn before it.
    Clear,
}

/// A committed edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Commit order within the room. Assigned by the log, starts at 1.
    pub sequence: u64,
    pub author: Uuid,
    /// Wall-clock milliseconds since the Unix epoch, display only.
    pub timestamp_ms: u64,
    pub kind: OperationKind,
}

impl Operation {
    /// Unstamped draw operation; the log assigns `sequence` on append.
    pub fn draw(author: Uuid, stroke: Stroke) -> Self {
        Self {
            sequence: 0,
            author,
            timestamp_ms: now_ms(),
            kind: OperationKind::Draw(stroke),
        }
    }

    /// Unstamped clear operation.
    pub fn clear(author: Uuid) -> Self {
        Self {
            sequence: 0,
            author,
            timestamp_ms: now_ms(),
            kind: OperationKind::Clear,
        }
    }

    pub fn is_clear(&self) -> bool {
        matches!(self.kind, OperationKind::Clear)
    }

    pub fn stroke(&self) -> Option<&Stroke> {
        match &self.kind {
            OperationKind::Draw(stroke) => Some(stroke),
            OperationKind::Clear => None,
        }
    }
}

/// Operations that still affect the rendered canvas: everything after the
/// last `Clear` in `ops`.
pub fn effective_ops(ops: &[Operation]) -> &[Operation] {
    match ops.iter().rposition(Operation::is_clear) {
        Some(last_clear) => &ops[last_clear + 1..],
        None => ops,
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
