//! Stream identifier contract
//!
//! - Stream 0 is the ordered, reliable metadata stream. Every room on a link
//!   shares it.
//! - Each room gets one odd stream `N` for unordered, best-effort media (RTP
//!   and RTCP) and the even stream `N + 1` for ordered, reliable data channel
//!   messages.
//!
//! Incoming frames are demultiplexed from the stream id and its parity alone.

use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u16);

impl StreamId {
    pub const METADATA: StreamId = StreamId(0);

    pub fn role(self) -> StreamRole {
        if self.0 == 0 {
            StreamRole::Metadata
        } else if self.0 % 2 == 1 {
            StreamRole::Media
        } else {
            StreamRole::Data
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The logical channel a stream carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRole {
    Metadata,
    Media,
    Data,
}

impl StreamRole {
    /// Messages are delivered in the order they were sent
    pub fn ordered(self) -> bool {
        !matches!(self, StreamRole::Media)
    }

    /// Messages are never dropped by the receiving side
    pub fn reliable(self) -> bool {
        !matches!(self, StreamRole::Media)
    }
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamRole::Metadata => write!(f, "metadata"),
            StreamRole::Media => write!(f, "media"),
            StreamRole::Data => write!(f, "data"),
        }
    }
}

/// The pair of streams owned by one room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoomStreams {
    media: StreamId,
}

impl RoomStreams {
    /// Build the pair from its media stream, which must be odd
    pub fn from_media(media: StreamId) -> Option<Self> {
        (media.role() == StreamRole::Media && media.0 < u16::MAX).then_some(Self { media })
    }

    pub fn metadata(&self) -> StreamId {
        StreamId::METADATA
    }

    pub fn media(&self) -> StreamId {
        self.media
    }

    pub fn data(&self) -> StreamId {
        StreamId(self.media.0 + 1)
    }

    /// The side of the link whose half of the stream space this pair is in
    pub fn owner(&self) -> LinkSide {
        let pair = (self.media.0 - 1) / 2;
        if pair % 2 == 0 {
            LinkSide::Dialer
        } else {
            LinkSide::Acceptor
        }
    }
}

/// Which end of a node link this is. Both ends may open rooms, so each side
/// allocates from its own half of the stream space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSide {
    Dialer,
    Acceptor,
}

impl LinkSide {
    pub fn peer(self) -> Self {
        match self {
            LinkSide::Dialer => LinkSide::Acceptor,
            LinkSide::Acceptor => LinkSide::Dialer,
        }
    }
}

/// Hands out room stream pairs.
///
/// Pair `p` maps to media stream `2p + 1` and data stream `2p + 2`. The
/// dialing side takes even pairs (media 1, 5, 9, ...) and the accepting side
/// odd pairs (media 3, 7, 11, ...). Identifiers are never reused on a link.
#[derive(Debug, Clone)]
pub struct StreamAllocator {
    side: LinkSide,
    next: u32,
}

impl StreamAllocator {
    pub fn new(side: LinkSide) -> Self {
        Self { side, next: 0 }
    }

    pub fn allocate(&mut self) -> Result<RoomStreams> {
        let offset = match self.side {
            LinkSide::Dialer => 0,
            LinkSide::Acceptor => 1,
        };
        let pair = self.next * 2 + offset;
        let media = 2 * pair + 1;

        if media + 1 > u16::MAX as u32 {
            return Err(Error::StreamsExhausted);
        }

        self.next += 1;
        Ok(RoomStreams {
            media: StreamId(media as u16),
        })
    }
}
