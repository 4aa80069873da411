//! Error taxonomy per the design's error-handling split: protocol violations
//! are peer-local and close one connection; storage faults are torrent-fatal.

use thiserror::Error;

/// A violation of the wire protocol by a single peer. Always closes that
/// peer's connection; never propagates further.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerProtocolError {
    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),

    #[error("bitfield received after the first message")]
    LateBitfield,

    #[error("message {kind} had wrong payload length {got}, expected {expected}")]
    BadLength {
        kind: &'static str,
        got: usize,
        expected: usize,
    },

    #[error("piece index {index} out of range (have {num_pieces} pieces)")]
    IndexOutOfRange { index: u32, num_pieces: u32 },

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for PeerProtocolError {
    fn from(e: std::io::Error) -> Self {
        PeerProtocolError::Io(e.to_string())
    }
}

/// Torrent-fatal faults. Once raised, the engine stops driving this torrent.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("on-disk corruption detected: {0}")]
    Corruption(String),

    #[error("channel closed: {0}")]
    Channel(String),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for EngineError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        EngineError::Channel(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
