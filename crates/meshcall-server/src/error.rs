use meshcall_protocol::{ProtocolError, RoomId, TrackId};
use std::fmt;
use thiserror::Error;

use crate::mux::{StreamId, StreamRole};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Media(#[from] meshcall_media::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Interceptor error: {0}")]
    Interceptor(#[from] webrtc::interceptor::Error),

    #[error("Invalid frame: {0}")]
    Frame(String),

    #[error("Stream identifiers exhausted on this link")]
    StreamsExhausted,

    #[error("Room already open on this link: {0}")]
    RoomExists(RoomId),

    #[error("Stream {0} already in use on this link")]
    StreamInUse(StreamId),

    #[error("Stream {0} belongs to the other side of the link")]
    ForeignStream(StreamId),

    #[error("Link closed")]
    LinkClosed,

    #[error("Track not found: {0}")]
    TrackNotFound(TrackId),

    #[error("Track already added: {0}")]
    TrackExists(TrackId),

    #[error("SSRC {0} already bound to a local track")]
    SsrcInUse(u32),

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error(transparent)]
    Close(#[from] CloseErrors),
}

pub type Result<T> = std::result::Result<T, Error>;

/// What failed to close
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseTarget {
    Channel(StreamRole),
    Room(RoomId),
    Link,
}

impl fmt::Display for CloseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseTarget::Channel(role) => write!(f, "{} channel", role),
            CloseTarget::Room(room) => write!(f, "room {}", room),
            CloseTarget::Link => write!(f, "link"),
        }
    }
}

/// Every failure seen while tearing something down. Teardown never stops at
/// the first failure, so this may hold several errors.
#[derive(Debug, Default)]
pub struct CloseErrors {
    errors: Vec<(CloseTarget, Error)>,
}

impl CloseErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one close
    pub fn add(&mut self, target: CloseTarget, result: Result<()>) {
        if let Err(e) = result {
            self.errors.push((target, e));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[(CloseTarget, Error)] {
        &self.errors
    }

    /// Whether a close of `target` failed
    pub fn failed(&self, target: &CloseTarget) -> bool {
        self.errors.iter().any(|(t, _)| t == target)
    }

    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Close(self))
        }
    }
}

impl fmt::Display for CloseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "close failed")?;
        for (i, (target, error)) in self.errors.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}: {}", sep, target, error)?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseErrors {}
