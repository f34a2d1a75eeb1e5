//! # scribble-collab: Shared canvas synchronization
//!
//! Server-authoritative drawing rooms: every room keeps one linear history
//! of committed operations with a shared undo/redo cursor, relays strokes
//! in progress to the other participants, and hands newcomers a snapshot
//! they can rebuild the canvas from.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │  one SyncSession
//!        ▼                                   ▼  per connection
//! ┌─────────────┐                     ┌─────────────┐
//! │HistoryMirror│                     │RoomRegistry │
//! │PresenceBoard│                     │ Room ─ Log  │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`]: Committed edits (strokes, clears)
//! - [`oplog`]: Per-room history with undo/redo cursor
//! - [`room`]: Rooms, participants and the registry
//! - [`session`]: Per-connection protocol state machine
//! - [`protocol`]: Message vocabularies and the frame codec
//! - [`broadcast`]: Per-room fan-out of encoded frames
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client
//! - [`mirror`]: Client-side history replica
//! - [`presence`]: Remote live strokes and cursors
//! - [`config`]: Server configuration

pub mod operation;
pub mod oplog;
pub mod room;
pub mod session;
pub mod protocol;
pub mod broadcast;
pub mod server;
pub mod client;
pub mod mirror;
pub mod presence;
pub mod config;

// Re-exports for convenience
pub use operation::{effective_ops, Operation, OperationKind, Stroke, Tool, Vec2};
pub use oplog::{OperationLog, Redone, Undone};
pub use room::{
    Committed, JoinError, JoinResult, LeaveResult, Participant, Room, RoomRegistry,
    RoomSnapshot, PALETTE,
};
pub use session::{Audience, Dispatch, SessionLimits, SyncSession};
pub use protocol::{
    ClientMessage, CommitRejection, FrameCodec, JoinRejection, ProtocolError, ServerMessage,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope};
pub use server::{ServerError, ServerStats, SyncServer};
pub use client::{ClientError, ConnectionState, SyncClient, SyncEvent};
pub use mirror::{HistoryMirror, MirrorUpdate};
pub use presence::{CursorThrottle, LiveStroke, PresenceBoard};
pub use config::{ConfigError, ServerConfig};
