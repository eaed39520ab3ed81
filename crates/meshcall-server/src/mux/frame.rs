//! Link framing
//!
//! ```text
//! +-----------+---------+-------------+----------------------------+
//! | stream u16| kind u8 | length u32  | body (length bytes)        |
//! +-----------+---------+-------------+----------------------------+
//! ```
//!
//! The body of an `Open` frame, and of any frame on stream 0, starts with the
//! room id (`len u8 | utf-8 bytes`) followed by the payload. All integers are
//! big endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use meshcall_protocol::RoomId;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::stream_id::StreamId;
use crate::error::{Error, Result};

/// Largest frame body accepted from a peer
pub const MAX_FRAME_LEN: u32 = 1 << 20;

const HEADER_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// A message for an open stream
    Data = 0,
    /// Opens a room on the media stream carried in the header
    Open = 1,
    /// Ends a stream
    Close = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameKind::Data),
            1 => Ok(FrameKind::Open),
            2 => Ok(FrameKind::Close),
            other => Err(Error::Frame(format!("unknown frame kind {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream: StreamId,
    pub kind: FrameKind,
    pub room: Option<RoomId>,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(stream: StreamId, payload: Bytes) -> Self {
        Self {
            stream,
            kind: FrameKind::Data,
            room: None,
            payload,
        }
    }

    pub fn metadata(room: RoomId, payload: Bytes) -> Self {
        Self {
            stream: StreamId::METADATA,
            kind: FrameKind::Data,
            room: Some(room),
            payload,
        }
    }

    pub fn open(room: RoomId, media: StreamId) -> Self {
        Self {
            stream: media,
            kind: FrameKind::Open,
            room: Some(room),
            payload: Bytes::new(),
        }
    }

    pub fn close(stream: StreamId, room: Option<RoomId>) -> Self {
        Self {
            stream,
            kind: FrameKind::Close,
            room,
            payload: Bytes::new(),
        }
    }

    fn has_room(stream: StreamId, kind: FrameKind) -> bool {
        stream == StreamId::METADATA || kind == FrameKind::Open
    }

    pub fn encode(&self) -> Result<Bytes> {
        let room = match (Self::has_room(self.stream, self.kind), &self.room) {
            (true, Some(room)) => Some(room.as_str().as_bytes()),
            (true, None) => {
                return Err(Error::Frame(format!(
                    "frame on stream {} requires a room",
                    self.stream
                )));
            }
            (false, _) => None,
        };

        let room_len = match room {
            Some(room) => {
                if room.len() > u8::MAX as usize {
                    return Err(Error::Frame(format!(
                        "room id of {} bytes is too long",
                        room.len()
                    )));
                }
                room.len() + 1
            }
            None => 0,
        };

        let body_len = room_len + self.payload.len();
        if body_len > MAX_FRAME_LEN as usize {
            return Err(Error::Frame(format!("frame of {} bytes is too large", body_len)));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
        buf.put_u16(self.stream.0);
        buf.put_u8(self.kind as u8);
        buf.put_u32(body_len as u32);
        if let Some(room) = room {
            buf.put_u8(room.len() as u8);
            buf.put_slice(room);
        }
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }

    /// Read one frame. Returns `None` on a clean end of stream between frames;
    /// a stream that ends inside a frame is an error.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Self>> {
        let mut header = [0u8; HEADER_LEN];
        let n = reader.read(&mut header).await?;
        if n == 0 {
            return Ok(None);
        }
        read_rest(reader, &mut header[n..], "header").await?;

        let mut header = &header[..];
        let stream = StreamId(header.get_u16());
        let kind = FrameKind::try_from(header.get_u8())?;
        let len = header.get_u32();

        if len > MAX_FRAME_LEN {
            return Err(Error::Frame(format!("frame of {} bytes is too large", len)));
        }

        let mut body = vec![0u8; len as usize];
        read_rest(reader, &mut body, "body").await?;
        let mut body = Bytes::from(body);

        let room = if Self::has_room(stream, kind) {
            if !body.has_remaining() {
                return Err(Error::Frame("missing room id".to_string()));
            }
            let room_len = body.get_u8() as usize;
            if body.remaining() < room_len {
                return Err(Error::Frame("truncated room id".to_string()));
            }
            let room = body.split_to(room_len);
            let room = std::str::from_utf8(&room)
                .map_err(|_| Error::Frame("room id is not utf-8".to_string()))?;
            Some(RoomId::from(room))
        } else {
            None
        };

        Ok(Some(Self {
            stream,
            kind,
            room,
            payload: body,
        }))
    }
}

async fn read_rest<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8], part: &str) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(Error::Frame(format!("link ended inside a frame {}", part)))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode(raw: &[u8]) -> Result<Option<Frame>> {
        let mut reader = raw;
        Frame::read(&mut reader).await
    }

    #[tokio::test]
    async fn test_metadata_frames_carry_room() {
        let frame = Frame::metadata(RoomId::from("lobby"), Bytes::from_static(b"{}"));
        let raw = frame.encode().unwrap();

        assert_eq!(&raw[..2], &[0, 0]);
        assert_eq!(raw[2], FrameKind::Data as u8);
        assert_eq!(raw[7], 5);
        assert_eq!(&raw[8..13], b"lobby");

        assert_eq!(decode(&raw).await.unwrap().unwrap(), frame);
    }

    #[tokio::test]
    async fn test_media_frames_have_no_room() {
        let frame = Frame::data(StreamId(3), Bytes::from_static(&[0x80, 96]));
        let raw = frame.encode().unwrap();
        assert_eq!(raw.len(), HEADER_LEN + 2);
        assert_eq!(decode(&raw).await.unwrap().unwrap(), frame);
    }

    #[tokio::test]
    async fn test_open_and_close_frames() {
        let open = Frame::open(RoomId::from("r"), StreamId(7));
        assert_eq!(decode(&open.encode().unwrap()).await.unwrap().unwrap(), open);

        let close = Frame::close(StreamId(8), None);
        assert_eq!(decode(&close.encode().unwrap()).await.unwrap().unwrap(), close);
    }

    #[tokio::test]
    async fn test_clean_eof() {
        assert!(decode(&[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_bad_frames() {
        // Unknown kind
        assert!(matches!(decode(&[0, 1, 9, 0, 0, 0, 0]).await, Err(Error::Frame(_))));
        // Oversized length
        assert!(matches!(
            decode(&[0, 1, 0, 0xff, 0xff, 0xff, 0xff]).await,
            Err(Error::Frame(_))
        ));
        // Metadata frame without a room
        assert!(matches!(decode(&[0, 0, 0, 0, 0, 0, 0]).await, Err(Error::Frame(_))));
        // Truncated header and body
        assert!(matches!(decode(&[0, 1, 0]).await, Err(Error::Frame(_))));
        assert!(matches!(decode(&[0]).await, Err(Error::Frame(_))));
        assert!(matches!(decode(&[0, 1, 0, 0, 0, 0, 4, 1, 2]).await, Err(Error::Frame(_))));

        assert!(Frame::close(StreamId::METADATA, None).encode().is_err());
        let long_room = RoomId::new("x".repeat(300));
        assert!(Frame::open(long_room, StreamId(1)).encode().is_err());
    }
}
