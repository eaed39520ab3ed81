//! Stream multiplexer for one node-to-node link
//!
//! Carries the metadata, media and data streams of every room on a single
//! byte stream (normally a TCP connection). The read loop never waits on a
//! stream's reader. Media frames are delivered best-effort: when a room's
//! media reader falls behind, frames are dropped and counted. Metadata and
//! data frames are delivered in order and never dropped, so a reader that
//! falls a full queue behind has its stream reset instead.

use async_trait::async_trait;
use bytes::Bytes;
use meshcall_protocol::RoomId;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::conn::{copy_message, eof, StreamConn};
use super::frame::{Frame, FrameKind};
use super::stream_id::{LinkSide, RoomStreams, StreamAllocator, StreamId, StreamRole};
use crate::error::{Error, Result};

/// Inbound queue depth for ordered streams; a reader this far behind has its
/// stream reset
const ORDERED_QUEUE: usize = 256;

/// Inbound queue depth for media streams; frames beyond it are dropped
const MEDIA_QUEUE: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RouteKey {
    Metadata(RoomId),
    Stream(StreamId),
}

/// Where the read loop delivers one stream's frames
struct Route {
    tx: mpsc::Sender<Bytes>,
    reset: Arc<AtomicBool>,
}

/// The three connections of one room on a link
pub struct RoomConns {
    pub room_id: RoomId,
    pub streams: RoomStreams,
    pub metadata: Arc<MuxStream>,
    pub media: Arc<MuxStream>,
    pub data: Arc<MuxStream>,
}

struct Shared {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    routes: RwLock<HashMap<RouteKey, Route>>,
    rooms: RwLock<HashMap<RoomId, RoomStreams>>,
    allocator: Mutex<StreamAllocator>,
    side: LinkSide,
    closed: watch::Sender<bool>,
    dropped: AtomicU64,
    resets: AtomicU64,
}

impl Shared {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn write_frame(&self, frame: &Frame) -> Result<()> {
        if self.is_closed() {
            return Err(Error::LinkClosed);
        }

        let raw = frame.encode()?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&raw).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn register_room(self: &Arc<Self>, room: RoomId, streams: RoomStreams) -> Result<RoomConns> {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(&room) {
            return Err(Error::RoomExists(room));
        }

        let mut routes = self.routes.write().await;
        for id in [streams.media(), streams.data()] {
            if routes.contains_key(&RouteKey::Stream(id)) {
                return Err(Error::StreamInUse(id));
            }
        }
        rooms.insert(room.clone(), streams);

        let mut stream = |key: RouteKey, id: StreamId| {
            let capacity = if id.role().reliable() {
                ORDERED_QUEUE
            } else {
                MEDIA_QUEUE
            };
            let (tx, rx) = mpsc::channel(capacity);
            let reset = Arc::new(AtomicBool::new(false));
            routes.insert(
                key.clone(),
                Route {
                    tx,
                    reset: reset.clone(),
                },
            );

            Arc::new(MuxStream {
                id,
                room: room.clone(),
                key,
                inbound: Mutex::new(rx),
                reset,
                shared: self.clone(),
                closed: watch::channel(false).0,
            })
        };

        let metadata = stream(RouteKey::Metadata(room.clone()), StreamId::METADATA);
        let media = stream(RouteKey::Stream(streams.media()), streams.media());
        let data = stream(RouteKey::Stream(streams.data()), streams.data());

        Ok(RoomConns {
            room_id: room,
            streams,
            metadata,
            media,
            data,
        })
    }

    async fn unregister_room(&self, room: &RoomId) {
        if let Some(streams) = self.rooms.write().await.remove(room) {
            let mut routes = self.routes.write().await;
            routes.remove(&RouteKey::Metadata(room.clone()));
            routes.remove(&RouteKey::Stream(streams.media()));
            routes.remove(&RouteKey::Stream(streams.data()));
        }
    }

    fn route_key(frame: &Frame) -> RouteKey {
        match &frame.room {
            Some(room) if frame.stream == StreamId::METADATA => RouteKey::Metadata(room.clone()),
            _ => RouteKey::Stream(frame.stream),
        }
    }

    async fn deliver(&self, frame: Frame) {
        let key = Self::route_key(&frame);
        let tx = self.routes.read().await.get(&key).map(|route| route.tx.clone());
        let Some(tx) = tx else {
            tracing::debug!("Dropping frame for unknown stream {}", frame.stream);
            return;
        };

        match tx.try_send(frame.payload) {
            Ok(()) => {}
            // Receiver gone means the stream is being closed locally
            Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) if frame.stream.role().reliable() => {
                self.reset(&key).await;
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 100 == 1 {
                    tracing::debug!(
                        "Media stream {} backlogged, {} frames dropped on this link",
                        frame.stream,
                        dropped
                    );
                }
            }
        }
    }

    /// Cut off an ordered stream whose reader fell a full queue behind. Its
    /// reader sees a reset, which tears the owning room down.
    async fn reset(&self, key: &RouteKey) {
        let Some(route) = self.routes.write().await.remove(key) else {
            return;
        };
        route.reset.store(true, Ordering::Release);
        self.resets.fetch_add(1, Ordering::Relaxed);

        match key {
            RouteKey::Metadata(room) => {
                tracing::warn!("Metadata stream of room {} fell behind, resetting it", room)
            }
            RouteKey::Stream(id) => tracing::warn!("Stream {} fell behind, resetting it", id),
        }
    }

    async fn accept(self: &Arc<Self>, frame: Frame, accepted: &mpsc::UnboundedSender<RoomConns>) {
        let Some(room) = frame.room else {
            return;
        };

        let Some(streams) = RoomStreams::from_media(frame.stream) else {
            tracing::warn!("Peer opened room {} on invalid media stream {}", room, frame.stream);
            return;
        };

        if streams.owner() != self.side.peer() {
            tracing::warn!(
                "Rejecting room {} opened by peer: {}",
                room,
                Error::ForeignStream(frame.stream)
            );
            return;
        }

        match self.register_room(room.clone(), streams).await {
            Ok(conns) => {
                tracing::info!(
                    "Peer opened room {} on streams {}/{}",
                    room,
                    streams.media(),
                    streams.data()
                );
                if accepted.send(conns).is_err() {
                    tracing::debug!("No one accepting rooms, dropping {}", room);
                }
            }
            Err(e) => tracing::warn!("Rejecting room opened by peer: {}", e),
        }
    }

    async fn remote_close(&self, frame: Frame) {
        let key = Self::route_key(&frame);
        self.routes.write().await.remove(&key);

        if let (RouteKey::Stream(id), StreamRole::Media) = (&key, frame.stream.role()) {
            self.rooms
                .write()
                .await
                .retain(|_, streams| streams.media() != *id);
        }

        tracing::debug!("Peer closed stream {}", frame.stream);
    }

    async fn shutdown(&self) {
        self.closed.send_replace(true);
        // Dropping the senders ends every stream on the link
        self.routes.write().await.clear();
        self.rooms.write().await.clear();
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    shared: Arc<Shared>,
    accepted: mpsc::UnboundedSender<RoomConns>,
) {
    loop {
        let frame = match Frame::read(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::info!("Node link closed by peer");
                break;
            }
            Err(e) => {
                tracing::warn!("Node link read failed: {}", e);
                break;
            }
        };

        match frame.kind {
            FrameKind::Data => shared.deliver(frame).await,
            FrameKind::Open => shared.accept(frame, &accepted).await,
            FrameKind::Close => shared.remote_close(frame).await,
        }
    }

    shared.shutdown().await;
}

/// Multiplexes rooms over one byte stream
pub struct StreamMux {
    shared: Arc<Shared>,
    accepted: Mutex<mpsc::UnboundedReceiver<RoomConns>>,
    reader: JoinHandle<()>,
}

impl StreamMux {
    pub fn new<T>(io: T, side: LinkSide) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            writer: Mutex::new(Box::new(writer)),
            routes: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            allocator: Mutex::new(StreamAllocator::new(side)),
            side,
            closed: watch::channel(false).0,
            dropped: AtomicU64::new(0),
            resets: AtomicU64::new(0),
        });

        let reader = tokio::spawn(read_loop(reader, shared.clone(), accepted_tx));

        Self {
            shared,
            accepted: Mutex::new(accepted_rx),
            reader,
        }
    }

    pub fn side(&self) -> LinkSide {
        self.shared.side
    }

    /// Allocate streams for a room and announce it to the peer
    pub async fn open_room(&self, room: RoomId) -> Result<RoomConns> {
        if self.shared.is_closed() {
            return Err(Error::LinkClosed);
        }

        let streams = self.shared.allocator.lock().await.allocate()?;
        let conns = self.shared.register_room(room.clone(), streams).await?;

        if let Err(e) = self
            .shared
            .write_frame(&Frame::open(room.clone(), streams.media()))
            .await
        {
            self.shared.unregister_room(&room).await;
            return Err(e);
        }

        tracing::info!(
            "Opened room {} on streams {}/{}",
            room,
            streams.media(),
            streams.data()
        );

        Ok(conns)
    }

    /// Next room opened by the peer, or `None` once the link is closed
    pub async fn accept_room(&self) -> Option<RoomConns> {
        self.accepted.lock().await.recv().await
    }

    /// Streams of a room currently open on this link
    pub async fn room_streams(&self, room: &RoomId) -> Option<RoomStreams> {
        self.shared.rooms.read().await.get(room).copied()
    }

    /// Media frames dropped because a reader fell behind
    pub fn dropped_media_frames(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Ordered streams reset because their reader fell behind
    pub fn reset_streams(&self) -> u64 {
        self.shared.resets.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Resolves once the link has gone down
    pub async fn closed(&self) {
        let mut closed = self.shared.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.send_replace(true) {
            return Ok(());
        }

        self.reader.abort();
        let result = self.shared.writer.lock().await.shutdown().await;
        self.shared.shutdown().await;
        result.map_err(Error::from)
    }
}

impl Drop for StreamMux {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// One stream of a room, as seen by the channel that owns it
pub struct MuxStream {
    id: StreamId,
    room: RoomId,
    key: RouteKey,
    inbound: Mutex<mpsc::Receiver<Bytes>>,
    reset: Arc<AtomicBool>,
    shared: Arc<Shared>,
    closed: watch::Sender<bool>,
}

fn reset_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "stream reader fell behind")
}

impl MuxStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn role(&self) -> StreamRole {
        self.id.role()
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room
    }
}

fn to_io(e: Error) -> io::Error {
    match e {
        Error::Io(e) => e,
        Error::LinkClosed => io::Error::new(io::ErrorKind::NotConnected, "link closed"),
        other => io::Error::other(other.to_string()),
    }
}

#[async_trait]
impl StreamConn for MuxStream {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.reset.load(Ordering::Acquire) {
            return Err(reset_error());
        }

        let mut closed = self.closed.subscribe();
        let mut inbound = self.inbound.lock().await;

        tokio::select! {
            message = inbound.recv() => match message {
                Some(message) => copy_message(&message, buf),
                None if self.reset.load(Ordering::Acquire) => Err(reset_error()),
                None => Err(eof()),
            },
            _ = closed.wait_for(|closed| *closed) => Err(eof()),
        }
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        if *self.closed.borrow() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "stream closed"));
        }

        let payload = Bytes::copy_from_slice(buf);
        let frame = match self.role() {
            StreamRole::Metadata => Frame::metadata(self.room.clone(), payload),
            StreamRole::Media | StreamRole::Data => Frame::data(self.id, payload),
        };

        self.shared.write_frame(&frame).await.map_err(to_io)?;
        Ok(buf.len())
    }

    async fn close(&self) -> io::Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }

        self.shared.routes.write().await.remove(&self.key);
        if self.role() == StreamRole::Media {
            self.shared.rooms.write().await.remove(&self.room);
        }

        let room = (self.role() == StreamRole::Metadata).then(|| self.room.clone());
        self.shared
            .write_frame(&Frame::close(self.id, room))
            .await
            .map_err(to_io)
    }
}
