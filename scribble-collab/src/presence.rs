//! Client-side live state of the other participants: roster, pointers and
//! strokes still being drawn.
//!
//! ```text
//! RemoteDrawStart ──► live stroke (per author) ──► RemoteDrawMove …
//!                                   │
//!          OperationCommitted ──────┤ by the same author: dropped, the
//!                                   │ committed copy lives in the mirror
//!          ParticipantLeft ─────────┘ dropped with the author's cursor
//! ```
//!
//! Nothing here is ever part of history.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::operation::{OperationKind, Stroke, Vec2};
use crate::protocol::ServerMessage;
use crate::room::Participant;

/// A remote stroke that has not been committed yet.
#[derive(Debug, Clone)]
pub struct LiveStroke {
    pub stroke: Stroke,
    last_update: Instant,
}

impl LiveStroke {
    fn new(stroke: Stroke) -> Self {
        Self {
            stroke,
            last_update: Instant::now(),
        }
    }

    /// Check if this stroke has received no points for `timeout`.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_update.elapsed() > timeout
    }
}

/// Tracks every remote participant's ephemeral state.
#[derive(Debug, Default)]
pub struct PresenceBoard {
    /// Our own participant id, once joined. Our events are never tracked.
    local_id: Option<Uuid>,
    /// Participants in join order, including ourselves.
    roster: Vec<Participant>,
    live_strokes: HashMap<Uuid, LiveStroke>,
    cursors: HashMap<Uuid, Vec2>,
}

impl PresenceBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle an incoming server message. Messages without presence
    /// content are ignored.
    pub fn handle_message(&mut self, msg: &ServerMessage) {
        match msg {
            ServerMessage::Joined { self_id, snapshot, .. } => {
                self.local_id = Some(*self_id);
                self.live_strokes.clear();
                self.cursors.clear();
                self.set_roster(&snapshot.roster);
            }

            ServerMessage::Resync { snapshot } => {
                self.set_roster(&snapshot.roster);
            }

            ServerMessage::ParticipantJoined { roster, .. } => {
                self.set_roster(roster);
            }

            ServerMessage::ParticipantLeft { participant_id, roster } => {
                self.live_strokes.remove(participant_id);
                self.cursors.remove(participant_id);
                self.set_roster(roster);
            }

            ServerMessage::RemoteDrawStart { author, point, tool, color, width } => {
                if self.is_local(author) {
                    return;
                }
                let stroke = Stroke::begin(*point, *tool, color.clone(), *width);
                self.live_strokes.insert(*author, LiveStroke::new(stroke));
            }

            ServerMessage::RemoteDrawMove { author, point } => {
                // A stroke begun before we joined has no start; skip its tail.
                if let Some(live) = self.live_strokes.get_mut(author) {
                    live.stroke.points.push(*point);
                    live.last_update = Instant::now();
                }
            }

            ServerMessage::RemoteDrawCancel { author } => {
                self.live_strokes.remove(author);
            }

            ServerMessage::RemoteCursorMove { author, position } => {
                if !self.is_local(author) {
                    self.cursors.insert(*author, *position);
                }
            }

            ServerMessage::OperationCommitted { operation, .. } => {
                if let OperationKind::Draw(_) = operation.kind {
                    self.live_strokes.remove(&operation.author);
                }
            }

            _ => {}
        }
    }

    /// Replace the roster, forgetting state of anyone no longer in it.
    fn set_roster(&mut self, roster: &[Participant]) {
        self.roster = roster.to_vec();
        let present: Vec<Uuid> = roster.iter().map(|p| p.id).collect();
        self.live_strokes.retain(|id, _| present.contains(id));
        self.cursors.retain(|id, _| present.contains(id));
        for participant in roster {
            if self.is_local(&participant.id) {
                continue;
            }
            if let Some(position) = participant.last_cursor {
                self.cursors.entry(participant.id).or_insert(position);
            }
        }
    }

    fn is_local(&self, id: &Uuid) -> bool {
        self.local_id.as_ref() == Some(id)
    }

    /// Remove live strokes that stopped growing for longer than `timeout`.
    pub fn cleanup_idle_strokes(&mut self, timeout: Duration) -> Vec<Uuid> {
        let stale: Vec<Uuid> = self
            .live_strokes
            .iter()
            .filter(|(_, live)| live.is_idle(timeout))
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.live_strokes.remove(id);
        }

        stale
    }

    pub fn local_id(&self) -> Option<Uuid> {
        self.local_id
    }

    pub fn roster(&self) -> &[Participant] {
        &self.roster
    }

    pub fn participant(&self, id: &Uuid) -> Option<&Participant> {
        self.roster.iter().find(|p| p.id == *id)
    }

    pub fn live_stroke(&self, author: &Uuid) -> Option<&Stroke> {
        self.live_strokes.get(author).map(|live| &live.stroke)
    }

    pub fn live_strokes(&self) -> impl Iterator<Item = (&Uuid, &Stroke)> {
        self.live_strokes.iter().map(|(id, live)| (id, &live.stroke))
    }

    pub fn cursor(&self, author: &Uuid) -> Option<Vec2> {
        self.cursors.get(author).copied()
    }

    pub fn cursors(&self) -> &HashMap<Uuid, Vec2> {
        &self.cursors
    }
}

/// Rate limiter for outgoing cursor updates (33ms = 30fps).
#[derive(Debug, Clone)]
pub struct CursorThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
    /// Most recent position swallowed by the limiter.
    pending: Option<Vec2>,
}

impl Default for CursorThrottle {
    fn default() -> Self {
        Self::new(Duration::from_millis(33))
    }
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
            pending: None,
        }
    }

    /// Returns the position if it should go out now. Otherwise it is kept
    /// as pending and `None` is returned.
    pub fn offer(&mut self, position: Vec2) -> Option<Vec2> {
        let ready = self
            .last_sent
            .map_or(true, |last| last.elapsed() >= self.interval);
        if !ready {
            self.pending = Some(position);
            return None;
        }
        self.pending = None;
        self.last_sent = Some(Instant::now());
        Some(position)
    }

    /// Take the last throttled position, if any, regardless of timing.
    pub fn flush(&mut self) -> Option<Vec2> {
        let position = self.pending.take()?;
        self.last_sent = Some(Instant::now());
        Some(position)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}
