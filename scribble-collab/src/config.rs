//! Server configuration and its environment overlay.

use thiserror::Error;

use crate::protocol::FrameCodec;
use crate::session::{SessionLimits, MAX_COLOR_LEN};

/// Upper bound on one roster entry's encoding, excluding the display name
/// (id, color, last cursor, length prefixes).
const PARTICIPANT_FIXED_BYTES: usize = 80;
/// Room for everything in a join snapshot frame besides the roster and the
/// history (tags, ids, the joiner's own entry, revision, counts).
const SNAPSHOT_FIXED_BYTES: usize = 1024;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Constraint(String),
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum participants per room
    pub max_participants_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// WebSocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Connections silent for longer than this are closed
    pub idle_timeout_secs: u64,
    pub max_stroke_points: usize,
    pub max_stroke_width: f32,
    pub max_room_id_len: usize,
    pub max_display_name_len: usize,
    /// Frames larger than this are LZ4-compressed
    pub compression_threshold: usize,
    pub max_frame_bytes: usize,
    /// Accepted `Origin` headers. Empty allows any origin.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            max_participants_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 90,
            max_stroke_points: 10_000,
            max_stroke_width: 200.0,
            max_room_id_len: 64,
            max_display_name_len: 32,
            compression_threshold: 4 * 1024,
            max_frame_bytes: 8 * 1024 * 1024,
            allowed_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with the process environment.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `SCRIBBLE_BIND` | `bind_addr` |
    /// | `PORT` | port part of `bind_addr` |
    /// | `SCRIBBLE_MAX_PARTICIPANTS` | `max_participants_per_room` |
    /// | `SCRIBBLE_BROADCAST_CAPACITY` | `broadcast_capacity` |
    /// | `SCRIBBLE_HEARTBEAT_SECS` | `heartbeat_interval_secs` |
    /// | `SCRIBBLE_IDLE_TIMEOUT_SECS` | `idle_timeout_secs` |
    /// | `ALLOWED_ORIGINS` | `allowed_origins` (comma separated, `*` = any) |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(bind) = lookup("SCRIBBLE_BIND") {
            config.bind_addr = bind.trim().to_string();
        }
        if let Some(port) = lookup("PORT") {
            let port: u16 = parse("PORT", &port)?;
            config.bind_addr = match config.bind_addr.rsplit_once(':') {
                Some((host, _)) => format!("{host}:{port}"),
                None => format!("{}:{port}", config.bind_addr),
            };
        }
        if let Some(v) = lookup("SCRIBBLE_MAX_PARTICIPANTS") {
            config.max_participants_per_room = parse("SCRIBBLE_MAX_PARTICIPANTS", &v)?;
        }
        if let Some(v) = lookup("SCRIBBLE_BROADCAST_CAPACITY") {
            config.broadcast_capacity = parse("SCRIBBLE_BROADCAST_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("SCRIBBLE_HEARTBEAT_SECS") {
            config.heartbeat_interval_secs = parse("SCRIBBLE_HEARTBEAT_SECS", &v)?;
        }
        if let Some(v) = lookup("SCRIBBLE_IDLE_TIMEOUT_SECS") {
            config.idle_timeout_secs = parse("SCRIBBLE_IDLE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("ALLOWED_ORIGINS") {
            config.allowed_origins = parse_origins(&v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addr.is_empty() {
            return Err(ConfigError::Constraint("bind address is empty".into()));
        }
        if self.max_participants_per_room == 0 {
            return Err(ConfigError::Constraint(
                "max participants per room must be at least 1".into(),
            ));
        }
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::Constraint(
                "broadcast capacity must be at least 1".into(),
            ));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Constraint(
                "heartbeat interval must be at least 1 second".into(),
            ));
        }
        if self.idle_timeout_secs <= self.heartbeat_interval_secs {
            return Err(ConfigError::Constraint(format!(
                "idle timeout ({}s) must exceed heartbeat interval ({}s)",
                self.idle_timeout_secs, self.heartbeat_interval_secs
            )));
        }
        if !(self.max_stroke_width.is_finite() && self.max_stroke_width > 0.0) {
            return Err(ConfigError::Constraint(
                "max stroke width must be positive".into(),
            ));
        }
        if self.history_budget() == 0 {
            return Err(ConfigError::Constraint(format!(
                "max frame size ({} bytes) cannot hold a full roster of {}",
                self.max_frame_bytes, self.max_participants_per_room
            )));
        }
        Ok(())
    }

    /// Validation bounds handed to each session.
    pub fn limits(&self) -> SessionLimits {
        SessionLimits {
            max_stroke_points: self.max_stroke_points,
            max_stroke_width: self.max_stroke_width,
            max_room_id_len: self.max_room_id_len,
            max_display_name_len: self.max_display_name_len,
            max_color_len: MAX_COLOR_LEN,
            max_history_bytes: self.history_budget(),
        }
    }

    /// Encoded history bytes a room may hold while a join snapshot with a
    /// full roster still fits in `max_frame_bytes`.
    pub fn history_budget(&self) -> usize {
        // Names are counted in chars; a char is at most 4 bytes of UTF-8.
        let per_participant = PARTICIPANT_FIXED_BYTES + 4 * self.max_display_name_len;
        let roster = self.max_participants_per_room.saturating_mul(per_participant);
        self.max_frame_bytes
            .saturating_sub(roster)
            .saturating_sub(SNAPSHOT_FIXED_BYTES)
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.compression_threshold, self.max_frame_bytes)
    }

    /// Whether a handshake with this `Origin` header may proceed. Requests
    /// without the header (non-browser clients) are always accepted.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            _ if self.allowed_origins.is_empty() => true,
            None => true,
            Some(origin) => self.allowed_origins.iter().any(|allowed| allowed == origin),
        }
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_origins(value: &str) -> Vec<String> {
    let origins: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect();
    if origins.iter().any(|origin| origin == "*") {
        Vec::new()
    } else {
        origins
    }
}
