//! Per-room fan-out of pre-encoded frames.
//!
//! Uses a tokio broadcast channel: a frame is encoded once and every
//! connection in the room gets an `Arc` to it. Each [`Envelope`] carries an
//! optional excluded participant (the author of a relayed event) and a
//! per-group publish sequence number, which a connection uses to skip frames
//! already covered by a snapshot it was sent. Relay frames (live strokes,
//! cursors) are never covered by a snapshot and are marked as such.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// One published frame.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Position in this group's publish order, starting at 1.
    pub seq: u64,
    /// Participant that must not receive this frame.
    pub exclude: Option<Uuid>,
    /// Live-drawing relay rather than room state.
    pub relay: bool,
    pub frame: Arc<Vec<u8>>,
}

impl Envelope {
    /// Whether `participant` should receive this frame.
    pub fn is_for(&self, participant: &Uuid) -> bool {
        self.exclude.as_ref() != Some(participant)
    }

    /// Whether a snapshot taken at publish sequence `snapshot_seq` already
    /// reflects this frame.
    pub fn covered_by(&self, snapshot_seq: u64) -> bool {
        !self.relay && self.seq <= snapshot_seq
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub receivers: usize,
}

/// Broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    capacity: usize,
    /// Last assigned `Envelope::seq`.
    published: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a receiver may fall behind before it
    /// starts losing them (reported as `RecvError::Lagged`).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            published: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Publish a frame to every subscriber. Returns the number of receivers
    /// it was queued for (filtering by `exclude` happens at the receiver).
    pub fn publish(&self, exclude: Option<Uuid>, frame: Arc<Vec<u8>>) -> usize {
        self.send(exclude, false, frame)
    }

    /// Publish a live-drawing relay frame.
    pub fn publish_relay(&self, exclude: Option<Uuid>, frame: Arc<Vec<u8>>) -> usize {
        self.send(exclude, true, frame)
    }

    fn send(&self, exclude: Option<Uuid>, relay: bool, frame: Arc<Vec<u8>>) -> usize {
        let seq = self.published.fetch_add(1, Ordering::SeqCst) + 1;
        self.sender
            .send(Envelope { seq, exclude, relay, frame })
            .unwrap_or(0)
    }

    /// Sequence number of the most recently published frame.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.published(),
            receivers: self.receiver_count(),
        }
    }
}
