use crate::world::position::Position;
use thiserror::Error;

/// Failures while reading or writing the node-tree map format.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("map data ended unexpectedly")]
    Truncated,
    #[error("unknown node type 0x{node_type:02x} inside node 0x{parent:02x}")]
    UnknownNodeType { node_type: u8, parent: u8 },
    #[error("map format version {0} is not supported")]
    VersionUnsupported(u32),
    #[error("containers nested {depth} deep, the format allows {limit}")]
    NestingTooDeep { depth: usize, limit: usize },
    #[error("item cannot be encoded: {0}")]
    Unencodable(String),
    #[error("map data is corrupt: {0}")]
    Corrupt(String),
    #[error("map i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    pub(crate) fn corrupt(message: impl Into<String>) -> Self {
        CodecError::Corrupt(message.into())
    }
}

/// Recoverable edit rejections. The submitter resyncs and re-derives its edit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    #[error("tile {position} is being edited elsewhere, retry")]
    TileLocked { position: Position, holder: u32 },
    #[error("edit is out of date: {reason}")]
    StaleVersion {
        position: Option<Position>,
        reason: String,
    },
    #[error("position {0} is outside the map")]
    OutOfBounds(Position),
}

impl ConflictError {
    pub(crate) fn stale(position: Option<Position>, reason: impl Into<String>) -> Self {
        ConflictError::StaleVersion {
            position,
            reason: reason.into(),
        }
    }

    /// Tile the conflict refers to, used to scope the follow-up resync.
    pub fn position(&self) -> Option<Position> {
        match self {
            ConflictError::TileLocked { position, .. } => Some(*position),
            ConflictError::StaleVersion { position, .. } => *position,
            ConflictError::OutOfBounds(position) => Some(*position),
        }
    }
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("protocol mismatch: expected version {expected}, peer speaks {actual}")]
    ProtocolMismatch { expected: u32, actual: u32 },
    #[error("peer timed out")]
    Timeout,
    #[error("malformed message: {0}")]
    Malformed(#[from] CodecError),
    #[error("message of {len} bytes exceeds session.max_frame_len ({max} bytes)")]
    FrameTooLarge { len: usize, max: usize },
    #[error("network i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    pub(crate) fn lost(message: impl Into<String>) -> Self {
        NetworkError::ConnectionLost(message.into())
    }
}

/// Errors surfaced by the editor command surface.
#[derive(Debug, Error)]
pub enum EditorError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("no collaboration session is active")]
    NoSession,
    #[error("a collaboration session is already active")]
    SessionActive,
    #[error("map store lock poisoned")]
    Poisoned,
}
