//! One link between two server nodes, carrying any number of rooms

use meshcall_media::CodecRegistry;
use meshcall_protocol::{ClientId, RoomId, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tracing::Span;
use webrtc::interceptor::Interceptor;

use crate::error::{CloseErrors, CloseTarget, Result};
use crate::mux::{LinkSide, RoomConns, StreamMux};
use crate::pubsub::{PubTrack, PubTrackKey, PubTrackSet};
use crate::servertransport::{MetadataEvent, Params, ServerTransport};

/// Collaborators shared by every room transport on a link
#[derive(Clone, Default)]
pub struct LinkOptions {
    pub interceptor: Option<Arc<dyn Interceptor + Send + Sync>>,
    pub codec_registry: Option<Arc<CodecRegistry>>,
}

type Rooms = Arc<RwLock<HashMap<RoomId, Arc<ServerTransport>>>>;

pub struct NodeLink {
    mux: StreamMux,
    options: LinkOptions,
    rooms: Rooms,
    published: Arc<RwLock<PubTrackSet>>,
    span: Span,
}

impl NodeLink {
    pub fn new<T>(io: T, side: LinkSide, options: LinkOptions) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let span = tracing::info_span!("node_link", side = ?side);

        Self {
            mux: StreamMux::new(io, side),
            options,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            published: Arc::new(RwLock::new(PubTrackSet::new())),
            span,
        }
    }

    pub fn side(&self) -> LinkSide {
        self.mux.side()
    }

    /// Open a room on the link and build its transport
    pub async fn open_room(&self, room: RoomId) -> Result<Arc<ServerTransport>> {
        let conns = self.mux.open_room(room).await?;
        Ok(self.attach(conns).await)
    }

    /// Transport for the next room the peer opens, or `None` once the link is
    /// down
    pub async fn accept_room(&self) -> Option<Arc<ServerTransport>> {
        let conns = self.mux.accept_room().await?;
        Some(self.attach(conns).await)
    }

    async fn attach(&self, conns: RoomConns) -> Arc<ServerTransport> {
        let room = conns.room_id.clone();

        let mut params = Params::new(conns.metadata, conns.media, conns.data).with_log(self.span.clone());
        params.interceptor = self.options.interceptor.clone();
        params.codec_registry = self.options.codec_registry.clone();

        let transport = ServerTransport::new(params).await;
        let events = transport.events();

        tracing::info!(
            parent: &self.span,
            "Room {} attached to {} (media stream {}, data stream {})",
            room,
            transport.client_id(),
            conns.streams.media(),
            conns.streams.data()
        );

        // Tracks announced before the event subscription existed
        {
            let mut published = self.published.write().await;
            for track in transport.remote_tracks().await {
                published.insert(track.pub_track());
            }
        }

        let previous = self
            .rooms
            .write()
            .await
            .insert(room.clone(), transport.clone());
        if let Some(previous) = previous {
            tracing::warn!(parent: &self.span, "Replacing transport for room {}", room);
            let _ = previous.close().await;
        }

        tokio::spawn(track_room(
            room,
            transport.client_id().clone(),
            Arc::downgrade(&transport),
            events,
            self.rooms.clone(),
            self.published.clone(),
        ));

        transport
    }

    pub async fn transport(&self, room: &RoomId) -> Option<Arc<ServerTransport>> {
        self.rooms.read().await.get(room).cloned()
    }

    pub async fn rooms(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Every track the peer currently publishes on this link
    pub async fn published_tracks(&self) -> Vec<PubTrack> {
        self.published.read().await.iter().cloned().collect()
    }

    pub async fn published_by_user(&self, user_id: &UserId) -> Vec<PubTrack> {
        self.published
            .read()
            .await
            .by_user(user_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn is_published(&self, key: &PubTrackKey) -> bool {
        self.published.read().await.contains(key)
    }

    /// Media frames dropped by the link because a room fell behind
    pub fn dropped_media_frames(&self) -> u64 {
        self.mux.dropped_media_frames()
    }

    /// Metadata or data streams reset because a room stopped reading them
    pub fn reset_streams(&self) -> u64 {
        self.mux.reset_streams()
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    /// Resolves once the underlying link has gone down
    pub async fn closed(&self) {
        self.mux.closed().await
    }

    /// Close every room transport, then the link itself
    pub async fn close(&self) -> Result<()> {
        let rooms: Vec<(RoomId, Arc<ServerTransport>)> = self.rooms.write().await.drain().collect();

        let mut errors = CloseErrors::new();
        for (room, transport) in rooms {
            errors.add(CloseTarget::Room(room), transport.close().await);
        }
        errors.add(CloseTarget::Link, self.mux.close().await);

        tracing::info!(parent: &self.span, "Node link closed");
        errors.into_result()
    }
}

/// Keep the published track set in line with one room's metadata events, and
/// forget the room once its transport is done.
async fn track_room(
    room: RoomId,
    client_id: ClientId,
    transport: Weak<ServerTransport>,
    mut events: tokio::sync::broadcast::Receiver<MetadataEvent>,
    rooms: Rooms,
    published: Arc<RwLock<PubTrackSet>>,
) {
    let done = match transport.upgrade() {
        Some(transport) => transport.done(),
        None => return,
    };

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(MetadataEvent::TrackAdded(track)) => {
                    published.write().await.insert(track.pub_track());
                }
                Ok(MetadataEvent::TrackRemoved(track)) => {
                    published
                        .write()
                        .await
                        .remove(track.client_id(), track.track_id());
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Room {} missed {} metadata events", room, skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = done.wait() => break,
        }
    }

    let removed = published.write().await.remove_client(&client_id);
    if !removed.is_empty() {
        tracing::debug!("Room {} closed, dropped {} published tracks", room, removed.len());
    }

    let mut rooms = rooms.write().await;
    let current = rooms
        .get(&room)
        .is_some_and(|entry| Weak::ptr_eq(&Arc::downgrade(entry), &transport));
    if current {
        rooms.remove(&room);
        tracing::info!("Room {} removed from link", room);
    }
}
