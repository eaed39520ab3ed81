//! Metadata channel: track announcements and subscriptions for one room

use meshcall_media::{CodecRegistry, RegisteredCodec};
use meshcall_protocol::{ClientId, TrackEvent, TrackEventKind, TrackId, TrackJson, UserId};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};
use webrtc::interceptor::stream_info::StreamInfo;
use webrtc::rtp;

use crate::error::{Error, Result};
use crate::mux::StreamConn;
use crate::pubsub::PubTrack;
use crate::servertransport::media::MediaStream;
use crate::transport::{Done, DoneTrigger, Track};

const METADATA_MTU: usize = 64 * 1024;

const EVENT_QUEUE: usize = 64;

/// A track this node publishes to the remote node
#[derive(Debug, Clone)]
pub struct LocalTrack {
    json: TrackJson,
    ssrc: u32,
    user_id: UserId,
}

impl LocalTrack {
    pub fn new(json: TrackJson, ssrc: u32, user_id: UserId) -> Self {
        Self {
            json,
            ssrc,
            user_id,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }
}

impl Track for LocalTrack {
    fn unique_id(&self) -> TrackId {
        self.json.unique_id()
    }

    fn user_id(&self) -> UserId {
        self.user_id.clone()
    }

    fn track_json(&self) -> &TrackJson {
        &self.json
    }
}

/// A track announced by the remote node
#[derive(Debug)]
pub struct RemoteTrack {
    json: TrackJson,
    ssrc: u32,
    user_id: UserId,
    publisher: ClientId,
    codec: RegisteredCodec,
    packets: Mutex<mpsc::Receiver<rtp::packet::Packet>>,
}

impl RemoteTrack {
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn codec(&self) -> &RegisteredCodec {
        &self.codec
    }

    /// Identity of this track as published through the transport it
    /// arrived on
    pub fn pub_track(&self) -> PubTrack {
        PubTrack::new(self.publisher.clone(), self)
    }

    /// Next RTP packet for this track. None once the track is removed or
    /// the transport is closed.
    pub async fn read_rtp(&self) -> Option<rtp::packet::Packet> {
        self.packets.lock().await.recv().await
    }
}

impl Track for RemoteTrack {
    fn unique_id(&self) -> TrackId {
        self.json.unique_id()
    }

    fn user_id(&self) -> UserId {
        self.user_id.clone()
    }

    fn track_json(&self) -> &TrackJson {
        &self.json
    }
}

#[derive(Debug, Clone)]
pub enum MetadataEvent {
    TrackAdded(Arc<RemoteTrack>),
    TrackRemoved(PubTrack),
    /// The remote node subscribed to one of our tracks
    Subscribed(TrackId),
    Unsubscribed(TrackId),
}

pub struct MetadataTransportParams {
    pub conn: Arc<dyn StreamConn>,
    pub media: Arc<MediaStream>,
    pub client_id: ClientId,
    pub codec_registry: Arc<CodecRegistry>,
    pub span: Span,
}

struct TrackState {
    client_id: ClientId,
    media: Arc<MediaStream>,
    codec_registry: Arc<CodecRegistry>,
    local_tracks: RwLock<HashMap<TrackId, LocalTrack>>,
    remote_tracks: RwLock<HashMap<TrackId, Arc<RemoteTrack>>>,
    events: broadcast::Sender<MetadataEvent>,
}

impl TrackState {
    async fn handle_event(&self, event: TrackEvent) -> Result<()> {
        let track_id = event.track.unique_id();

        match event.kind {
            TrackEventKind::Add => {
                let codec = self
                    .codec_registry
                    .resolve(&event.track.codec)
                    .ok_or_else(|| Error::UnsupportedCodec(event.track.codec.mime_type.clone()))?
                    .clone();

                if self.remote_tracks.read().await.contains_key(&track_id) {
                    tracing::debug!("Track {} already announced", track_id);
                    return Ok(());
                }

                let packets = self.media.register_remote(event.ssrc).await;
                let track = Arc::new(RemoteTrack {
                    json: event.track,
                    ssrc: event.ssrc,
                    user_id: event.user_id,
                    publisher: self.client_id.clone(),
                    codec,
                    packets: Mutex::new(packets),
                });

                tracing::info!(
                    "Remote track {} added for user {} ({}, ssrc {})",
                    track_id,
                    track.user_id,
                    track.codec.codec.mime_type,
                    track.ssrc
                );
                self.remote_tracks
                    .write()
                    .await
                    .insert(track_id, track.clone());
                let _ = self.events.send(MetadataEvent::TrackAdded(track));
            }
            TrackEventKind::Remove => {
                let track = self
                    .remote_tracks
                    .write()
                    .await
                    .remove(&track_id)
                    .ok_or_else(|| Error::TrackNotFound(track_id.clone()))?;

                self.media.unregister_remote(track.ssrc).await;
                tracing::info!("Remote track {} removed", track_id);
                let _ = self.events.send(MetadataEvent::TrackRemoved(track.pub_track()));
            }
            TrackEventKind::Sub => {
                if !self.local_tracks.read().await.contains_key(&track_id) {
                    return Err(Error::TrackNotFound(track_id));
                }
                tracing::debug!("Remote node subscribed to {}", track_id);
                let _ = self.events.send(MetadataEvent::Subscribed(track_id));
            }
            TrackEventKind::Unsub => {
                if !self.local_tracks.read().await.contains_key(&track_id) {
                    return Err(Error::TrackNotFound(track_id));
                }
                tracing::debug!("Remote node unsubscribed from {}", track_id);
                let _ = self.events.send(MetadataEvent::Unsubscribed(track_id));
            }
        }

        Ok(())
    }
}

async fn read_loop(conn: Arc<dyn StreamConn>, state: Arc<TrackState>, closed: DoneTrigger) {
    let mut buf = vec![0u8; METADATA_MTU];

    loop {
        let n = match conn.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::debug!("Metadata stream ended");
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                tracing::warn!("Dropping oversized metadata message: {}", e);
                continue;
            }
            Err(e) => {
                tracing::warn!("Metadata stream read failed: {}", e);
                break;
            }
        };

        let event = match TrackEvent::from_bytes(&buf[..n]) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Invalid track event: {}", e);
                continue;
            }
        };

        if let Err(e) = state.handle_event(event).await {
            tracing::warn!("Failed to handle track event: {}", e);
        }
    }

    closed.fire();
}

/// Ordered, reliable track signalling for one room
pub struct MetadataTransport {
    conn: Arc<dyn StreamConn>,
    state: Arc<TrackState>,
    reader: JoinHandle<()>,
    closed: Done,
    closing: AtomicBool,
    span: Span,
}

impl MetadataTransport {
    pub fn new(params: MetadataTransportParams) -> Self {
        let state = Arc::new(TrackState {
            client_id: params.client_id,
            media: params.media,
            codec_registry: params.codec_registry,
            local_tracks: RwLock::new(HashMap::new()),
            remote_tracks: RwLock::new(HashMap::new()),
            events: broadcast::channel(EVENT_QUEUE).0,
        });

        let trigger = DoneTrigger::new();
        let closed = trigger.signal();
        let reader = tokio::spawn(
            read_loop(params.conn.clone(), state.clone(), trigger).instrument(params.span.clone()),
        );

        Self {
            conn: params.conn,
            state,
            reader,
            closed,
            closing: AtomicBool::new(false),
            span: params.span,
        }
    }

    async fn send_event(&self, kind: TrackEventKind, track: &dyn Track, ssrc: u32) -> Result<()> {
        let event = TrackEvent {
            kind,
            track: track.track_json().clone(),
            ssrc,
            user_id: track.user_id(),
        };
        self.conn.send(&event.to_bytes()?).await?;
        Ok(())
    }

    /// Publish a track to the remote node
    pub async fn add_track(&self, track: LocalTrack) -> Result<()> {
        let track_id = track.unique_id();
        let codec = self
            .state
            .codec_registry
            .resolve(&track.json.codec)
            .ok_or_else(|| Error::UnsupportedCodec(track.json.codec.mime_type.clone()))?
            .clone();

        // Reserve the id and SSRC before anything is announced
        {
            let mut local_tracks = self.state.local_tracks.write().await;
            if local_tracks.contains_key(&track_id) {
                return Err(Error::TrackExists(track_id));
            }
            if local_tracks.values().any(|local| local.ssrc == track.ssrc) {
                return Err(Error::SsrcInUse(track.ssrc));
            }
            local_tracks.insert(track_id.clone(), track.clone());
        }

        if let Err(e) = self.publish(&track, &track_id, &codec).await {
            self.state.local_tracks.write().await.remove(&track_id);
            return Err(e);
        }

        tracing::info!(parent: &self.span, "Published track {} (ssrc {})", track_id, track.ssrc);
        Ok(())
    }

    async fn publish(&self, track: &LocalTrack, track_id: &TrackId, codec: &RegisteredCodec) -> Result<()> {
        self.state
            .media
            .bind_local_stream(StreamInfo {
                id: track_id.to_string(),
                ssrc: track.ssrc,
                payload_type: codec.payload_type,
                mime_type: codec.codec.mime_type.clone(),
                clock_rate: codec.codec.clock_rate,
                channels: codec.codec.channels,
                sdp_fmtp_line: codec.codec.sdp_fmtp_line.clone(),
                ..Default::default()
            })
            .await?;

        if let Err(e) = self.send_event(TrackEventKind::Add, track, track.ssrc).await {
            self.state.media.unbind_local_stream(track.ssrc).await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn remove_track(&self, track_id: &TrackId) -> Result<()> {
        let track = self
            .state
            .local_tracks
            .write()
            .await
            .remove(track_id)
            .ok_or_else(|| Error::TrackNotFound(track_id.clone()))?;

        self.state.media.unbind_local_stream(track.ssrc).await;
        tracing::info!(parent: &self.span, "Unpublished track {}", track_id);
        self.send_event(TrackEventKind::Remove, &track, track.ssrc).await
    }

    /// Ask the remote node to forward one of its tracks
    pub async fn subscribe(&self, track_id: &TrackId) -> Result<()> {
        let track = self
            .remote_track(track_id)
            .await
            .ok_or_else(|| Error::TrackNotFound(track_id.clone()))?;
        self.send_event(TrackEventKind::Sub, track.as_ref(), track.ssrc).await
    }

    pub async fn unsubscribe(&self, track_id: &TrackId) -> Result<()> {
        let track = self
            .remote_track(track_id)
            .await
            .ok_or_else(|| Error::TrackNotFound(track_id.clone()))?;
        self.send_event(TrackEventKind::Unsub, track.as_ref(), track.ssrc).await
    }

    pub async fn local_tracks(&self) -> Vec<LocalTrack> {
        self.state.local_tracks.read().await.values().cloned().collect()
    }

    pub async fn remote_tracks(&self) -> Vec<Arc<RemoteTrack>> {
        self.state.remote_tracks.read().await.values().cloned().collect()
    }

    pub async fn remote_track(&self, track_id: &TrackId) -> Option<Arc<RemoteTrack>> {
        self.state.remote_tracks.read().await.get(track_id).cloned()
    }

    pub fn events(&self) -> broadcast::Receiver<MetadataEvent> {
        self.state.events.subscribe()
    }

    /// Fires when the read loop has stopped
    pub fn closed(&self) -> Done {
        self.closed.clone()
    }

    pub async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.state.local_tracks.write().await.clear();
        self.state.remote_tracks.write().await.clear();

        let result = self.conn.close().await;
        self.reader.abort();

        tracing::debug!(parent: &self.span, "Metadata transport closed");
        result.map_err(Error::from)
    }
}

impl Drop for MetadataTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
