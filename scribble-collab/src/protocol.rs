//! Wire protocol: closed message vocabularies and the frame codec.
//!
//! Frame format (one WebSocket binary message):
//! ```text
//! ┌────────┬──────────────────────────────────────────────┐
//! │ flag   │ body                                         │
//! │ 1 byte │ 0 = bincode message                          │
//! │        │ 1 = lz4(bincode message), u32 LE size prefix │
//! └────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Messages are bincode-encoded (standard config, serde mode). Frames whose
//! bincode encoding exceeds the codec's compression threshold, typically
//! join snapshots with long histories, are LZ4-compressed.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::operation::{Operation, Tool, Vec2};
use crate::room::{Participant, RoomSnapshot};

const FLAG_RAW: u8 = 0;
const FLAG_LZ4: u8 = 1;

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Bind this connection to a room. Only valid once.
    Join {
        room_id: String,
        display_name: Option<String>,
    },
    /// Begin a live stroke.
    DrawStart {
        point: Vec2,
        tool: Tool,
        color: String,
        width: f32,
    },
    /// Extend the live stroke.
    DrawMove { point: Vec2 },
    /// Commit the live stroke held by the session.
    DrawEnd,
    CursorMove { position: Vec2 },
    Undo,
    Redo,
    ClearCanvas,
    /// Ask for a fresh snapshot after the local mirror detected a gap.
    SyncRequest,
    Ping { nonce: u64 },
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Reconciliation snapshot for the joiner.
    Joined {
        self_id: Uuid,
        participant: Participant,
        snapshot: RoomSnapshot,
    },
    JoinRejected { reason: JoinRejection },
    ParticipantJoined {
        participant: Participant,
        roster: Vec<Participant>,
    },
    ParticipantLeft {
        participant_id: Uuid,
        roster: Vec<Participant>,
    },
    RemoteDrawStart {
        author: Uuid,
        point: Vec2,
        tool: Tool,
        color: String,
        width: f32,
    },
    RemoteDrawMove { author: Uuid, point: Vec2 },
    /// The author's live stroke was dropped without being committed.
    RemoteDrawCancel { author: Uuid },
    RemoteCursorMove { author: Uuid, position: Vec2 },
    OperationCommitted {
        index: usize,
        operation: Operation,
        revision: u64,
    },
    /// Sent after undo: the complete new visible prefix.
    HistoryTruncated {
        cursor: usize,
        history: Vec<Operation>,
        revision: u64,
    },
    /// Sent after redo: `operation` now sits at `cursor - 1`.
    HistoryExtended {
        cursor: usize,
        operation: Operation,
        revision: u64,
    },
    Resync { snapshot: RoomSnapshot },
    /// The sender's draw-end or clear was not committed.
    CommitRejected { reason: CommitRejection },
    Pong { nonce: u64 },
}

impl ServerMessage {
    /// Log revision produced by this message, for history-changing messages.
    pub fn revision(&self) -> Option<u64> {
        match self {
            ServerMessage::OperationCommitted { revision, .. }
            | ServerMessage::HistoryTruncated { revision, .. }
            | ServerMessage::HistoryExtended { revision, .. } => Some(*revision),
            ServerMessage::Joined { snapshot, .. } | ServerMessage::Resync { snapshot } => {
                Some(snapshot.revision)
            }
            _ => None,
        }
    }

    /// Live-drawing relay that no snapshot reflects.
    pub fn is_relay(&self) -> bool {
        matches!(
            self,
            ServerMessage::RemoteDrawStart { .. }
                | ServerMessage::RemoteDrawMove { .. }
                | ServerMessage::RemoteDrawCancel { .. }
                | ServerMessage::RemoteCursorMove { .. }
        )
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Joined { .. } => "joined",
            ServerMessage::JoinRejected { .. } => "join-rejected",
            ServerMessage::ParticipantJoined { .. } => "participant-joined",
            ServerMessage::ParticipantLeft { .. } => "participant-left",
            ServerMessage::RemoteDrawStart { .. } => "remote-draw-start",
            ServerMessage::RemoteDrawMove { .. } => "remote-draw-move",
            ServerMessage::RemoteDrawCancel { .. } => "remote-draw-cancel",
            ServerMessage::RemoteCursorMove { .. } => "remote-cursor-move",
            ServerMessage::OperationCommitted { .. } => "operation-committed",
            ServerMessage::HistoryTruncated { .. } => "history-truncated",
            ServerMessage::HistoryExtended { .. } => "history-extended",
            ServerMessage::Resync { .. } => "resync",
            ServerMessage::CommitRejected { .. } => "commit-rejected",
            ServerMessage::Pong { .. } => "pong",
        }
    }
}

/// Why a join request was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinRejection {
    /// Empty (after trimming) or longer than the server allows.
    InvalidRoomId,
    RoomFull { capacity: usize },
}

impl std::fmt::Display for JoinRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinRejection::InvalidRoomId => write!(f, "invalid room id"),
            JoinRejection::RoomFull { capacity } => {
                write!(f, "room is full ({capacity} participants)")
            }
        }
    }
}

/// Why a commit was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitRejection {
    /// The room's history would no longer fit in one snapshot frame.
    HistoryFull { max_bytes: usize },
}

impl std::fmt::Display for CommitRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitRejection::HistoryFull { max_bytes } => {
                write!(f, "room history is full ({max_bytes} bytes)")
            }
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("decompression failed: {0}")]
    Decompression(String),
    #[error("empty frame")]
    EmptyFrame,
    #[error("unknown frame flag {0:#04x}")]
    UnknownFrameFlag(u8),
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },
}

/// Encodes and decodes frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    /// Raw encodings longer than this are LZ4-compressed.
    pub compression_threshold: usize,
    /// Upper bound on a frame and on its decompressed body.
    pub max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            compression_threshold: 4 * 1024,
            max_frame_bytes: 8 * 1024 * 1024,
        }
    }
}

impl FrameCodec {
    pub fn new(compression_threshold: usize, max_frame_bytes: usize) -> Self {
        Self {
            compression_threshold,
            max_frame_bytes,
        }
    }

    /// Serialize `msg` into a frame.
    pub fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, ProtocolError> {
        let raw = bincode::serde::encode_to_vec(msg, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;

        if raw.len() > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                size: raw.len(),
                max: self.max_frame_bytes,
            });
        }

        let (flag, body) = if raw.len() > self.compression_threshold {
            (FLAG_LZ4, lz4_flex::compress_prepend_size(&raw))
        } else {
            (FLAG_RAW, raw)
        };

        let mut frame = Vec::with_capacity(body.len() + 1);
        frame.push(flag);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Parse a frame. Oversized frames are rejected before any allocation
    /// proportional to their declared size.
    pub fn decode<T: DeserializeOwned>(&self, frame: &[u8]) -> Result<T, ProtocolError> {
        if frame.len() > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_bytes,
            });
        }
        let (&flag, body) = frame.split_first().ok_or(ProtocolError::EmptyFrame)?;

        match flag {
            FLAG_RAW => decode_body(body),
            FLAG_LZ4 => {
                let declared = body
                    .get(..4)
                    .and_then(|prefix| prefix.try_into().ok())
                    .map(u32::from_le_bytes)
                    .ok_or_else(|| ProtocolError::Decompression("missing size prefix".into()))?
                    as usize;
                if declared > self.max_frame_bytes {
                    return Err(ProtocolError::FrameTooLarge {
                        size: declared,
                        max: self.max_frame_bytes,
                    });
                }
                let raw = lz4_flex::decompress_size_prepended(body)
                    .map_err(|e| ProtocolError::Decompression(e.to_string()))?;
                decode_body(&raw)
            }
            other => Err(ProtocolError::UnknownFrameFlag(other)),
        }
    }

    /// Length of the uncompressed bincode encoding of `msg`.
    pub fn encoded_len<T: Serialize>(msg: &T) -> Result<usize, ProtocolError> {
        bincode::serde::encode_to_vec(msg, bincode::config::standard())
            .map(|raw| raw.len())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Whether a frame was sent compressed.
    pub fn is_compressed(frame: &[u8]) -> bool {
        frame.first() == Some(&FLAG_LZ4)
    }
}

fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(body, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Operation, Stroke};

    fn long_stroke(points: usize) -> Stroke {
        let mut stroke = Stroke::begin(Vec2::ZERO, Tool::Brush, "#FF6B6B", 5.0);
        for i in 1..points {
            stroke.points.push(Vec2::new(i as f32, (i % 17) as f32));
        }
        stroke
    }

    #[test]
    fn test_client_message_roundtrip() {
        let codec = FrameCodec::default();
        let msg = ClientMessage::DrawStart {
            point: Vec2::new(10.5, 20.25),
            tool: Tool::Eraser,
            color: "#ffffff".into(),
            width: 12.0,
        };
        let frame = codec.encode(&msg).unwrap();
        assert!(!FrameCodec::is_compressed(&frame));
        let decoded: ClientMessage = codec.decode(&frame).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_large_snapshot_is_compressed() {
        let codec = FrameCodec::default();
        let op = Operation::draw(Uuid::new_v4(), long_stroke(5_000));
        let msg = ServerMessage::Resync {
            snapshot: RoomSnapshot {
                roster: Vec::new(),
                history: vec![op],
                revision: 1,
            },
        };

        let frame = codec.encode(&msg).unwrap();
        assert!(FrameCodec::is_compressed(&frame));
        let decoded: ServerMessage = codec.decode(&frame).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_unit_variants_are_tiny() {
        let codec = FrameCodec::default();
        let frame = codec.encode(&ClientMessage::Undo).unwrap();
        assert!(frame.len() <= 2, "undo frame is {} bytes", frame.len());
    }

    #[test]
    fn test_decode_empty_frame() {
        let codec = FrameCodec::default();
        let err = codec.decode::<ClientMessage>(&[]).unwrap_err();
        assert_eq!(err, ProtocolError::EmptyFrame);
    }

    #[test]
    fn test_decode_unknown_flag() {
        let codec = FrameCodec::default();
        let err = codec.decode::<ClientMessage>(&[7, 0, 0]).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownFrameFlag(7));
    }

    #[test]
    fn test_decode_garbage_body() {
        let codec = FrameCodec::default();
        assert!(codec.decode::<ClientMessage>(&[0, 0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let codec = FrameCodec::new(64, 16);
        let err = codec.decode::<ClientMessage>(&[0u8; 32]).unwrap_err();
        assert_eq!(err, ProtocolError::FrameTooLarge { size: 32, max: 16 });
    }

    #[test]
    fn test_decode_rejects_compression_bomb_header() {
        let codec = FrameCodec::new(64, 1024);
        let mut frame = vec![1u8];
        frame.extend_from_slice(&(u32::MAX).to_le_bytes());
        frame.extend_from_slice(&[0u8; 8]);

        let err = codec.decode::<ClientMessage>(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_encode_rejects_oversized_message() {
        let codec = FrameCodec::new(1 << 20, 128);
        let msg = ServerMessage::OperationCommitted {
            index: 0,
            operation: Operation::draw(Uuid::nil(), long_stroke(500)),
            revision: 1,
        };
        assert!(matches!(
            codec.encode(&msg),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_server_message_revision() {
        let commit = ServerMessage::OperationCommitted {
            index: 3,
            operation: Operation::clear(Uuid::nil()),
            revision: 9,
        };
        assert_eq!(commit.revision(), Some(9));
        assert_eq!(ServerMessage::Pong { nonce: 1 }.revision(), None);
        assert_eq!(
            ServerMessage::RemoteDrawMove { author: Uuid::nil(), point: Vec2::ZERO }.revision(),
            None
        );
    }

    #[test]
    fn test_relay_messages() {
        let author = Uuid::nil();
        assert!(ServerMessage::RemoteDrawCancel { author }.is_relay());
        assert!(ServerMessage::RemoteCursorMove { author, position: Vec2::ZERO }.is_relay());
        assert!(!ServerMessage::ParticipantLeft { participant_id: author, roster: Vec::new() }
            .is_relay());
        assert!(!ServerMessage::OperationCommitted {
            index: 0,
            operation: Operation::clear(author),
            revision: 1,
        }
        .is_relay());
    }

    #[test]
    fn test_encoded_len_matches_raw_frame() {
        let codec = FrameCodec::new(usize::MAX, usize::MAX);
        let op = Operation::draw(Uuid::new_v4(), long_stroke(40));
        let frame = codec.encode(&op).unwrap();
        assert_eq!(FrameCodec::encoded_len(&op).unwrap(), frame.len() - 1);
    }

    #[test]
    fn test_join_rejection_display() {
        assert_eq!(JoinRejection::InvalidRoomId.to_string(), "invalid room id");
        assert_eq!(
            JoinRejection::RoomFull { capacity: 4 }.to_string(),
            "room is full (4 participants)"
        );
    }
}
