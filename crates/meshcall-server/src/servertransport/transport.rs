use meshcall_media::CodecRegistry;
use meshcall_protocol::{ClientId, DataMessage, TrackId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};
use webrtc::interceptor::noop::NoOp;
use webrtc::interceptor::Interceptor;
use webrtc::{rtcp, rtp};

use crate::error::{CloseErrors, CloseTarget, Result};
use crate::mux::{StreamConn, StreamRole};
use crate::servertransport::data::{DataTransport, DataTransportParams};
use crate::servertransport::media::{MediaStream, MediaStreamParams};
use crate::servertransport::metadata::{
    LocalTrack, MetadataEvent, MetadataTransport, MetadataTransportParams, RemoteTrack,
};
use crate::transport::{Done, DoneTrigger, Transport, TransportType};

/// Construction options for a [`ServerTransport`]
pub struct Params {
    pub metadata_conn: Arc<dyn StreamConn>,
    pub media_conn: Arc<dyn StreamConn>,
    pub data_conn: Arc<dyn StreamConn>,
    /// Defaults to a pass-through interceptor
    pub interceptor: Option<Arc<dyn Interceptor + Send + Sync>>,
    /// Defaults to [`CodecRegistry::new_default`]
    pub codec_registry: Option<Arc<CodecRegistry>>,
    /// Parent span for everything the transport logs
    pub log: Span,
}

impl Params {
    pub fn new(
        metadata_conn: Arc<dyn StreamConn>,
        media_conn: Arc<dyn StreamConn>,
        data_conn: Arc<dyn StreamConn>,
    ) -> Self {
        Self {
            metadata_conn,
            media_conn,
            data_conn,
            interceptor: None,
            codec_registry: None,
            log: Span::current(),
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor + Send + Sync>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    pub fn with_codec_registry(mut self, codec_registry: Arc<CodecRegistry>) -> Self {
        self.codec_registry = Some(codec_registry);
        self
    }

    pub fn with_log(mut self, log: Span) -> Self {
        self.log = log;
        self
    }
}

/// Server-to-server transport for one room: metadata, media and data
/// channels with a single identity and a single close.
pub struct ServerTransport {
    client_id: ClientId,
    metadata: MetadataTransport,
    media: Arc<MediaStream>,
    data: DataTransport,
    closing: AtomicBool,
    done_trigger: DoneTrigger,
    done: Done,
    watcher: OnceLock<JoinHandle<()>>,
    span: Span,
}

impl ServerTransport {
    pub async fn new(params: Params) -> Arc<Self> {
        let client_id = ClientId::new_server_node();
        let span = tracing::info_span!(parent: &params.log, "server_transport", client_id = %client_id);

        let interceptor = params
            .interceptor
            .unwrap_or_else(|| Arc::new(NoOp) as Arc<dyn Interceptor + Send + Sync>);
        let codec_registry = params
            .codec_registry
            .unwrap_or_else(|| Arc::new(CodecRegistry::new_default()));

        let media = Arc::new(
            MediaStream::new(MediaStreamParams {
                conn: params.media_conn,
                interceptor,
                span: span.clone(),
            })
            .await,
        );

        let metadata = MetadataTransport::new(MetadataTransportParams {
            conn: params.metadata_conn,
            media: media.clone(),
            client_id: client_id.clone(),
            codec_registry,
            span: span.clone(),
        });

        let data = DataTransport::new(DataTransportParams {
            conn: params.data_conn,
            span: span.clone(),
        });

        tracing::info!(parent: &span, "Created server transport {}", client_id);

        let done_trigger = DoneTrigger::new();
        let done = done_trigger.signal();
        let channels = [metadata.closed(), media.closed(), data.closed()];

        let transport = Arc::new(Self {
            client_id,
            metadata,
            media,
            data,
            closing: AtomicBool::new(false),
            done_trigger,
            done,
            watcher: OnceLock::new(),
            span,
        });

        let watcher = tokio::spawn(
            watch_channels(Arc::downgrade(&transport), channels).instrument(transport.span.clone()),
        );
        let _ = transport.watcher.set(watcher);

        transport
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn transport_type(&self) -> TransportType {
        TransportType::Server
    }

    /// Fires once the transport has fully closed
    pub fn done(&self) -> Done {
        self.done.clone()
    }

    pub fn metadata(&self) -> &MetadataTransport {
        &self.metadata
    }

    pub fn media(&self) -> &Arc<MediaStream> {
        &self.media
    }

    pub fn data(&self) -> &DataTransport {
        &self.data
    }

    pub async fn add_track(&self, track: LocalTrack) -> Result<()> {
        self.metadata.add_track(track).await
    }

    pub async fn remove_track(&self, track_id: &TrackId) -> Result<()> {
        self.metadata.remove_track(track_id).await
    }

    pub async fn subscribe(&self, track_id: &TrackId) -> Result<()> {
        self.metadata.subscribe(track_id).await
    }

    pub async fn unsubscribe(&self, track_id: &TrackId) -> Result<()> {
        self.metadata.unsubscribe(track_id).await
    }

    pub async fn remote_tracks(&self) -> Vec<Arc<RemoteTrack>> {
        self.metadata.remote_tracks().await
    }

    pub fn events(&self) -> broadcast::Receiver<MetadataEvent> {
        self.metadata.events()
    }

    pub async fn write_rtp(&self, packet: &rtp::packet::Packet) -> Result<usize> {
        self.media.write_rtp(packet).await
    }

    pub async fn write_rtcp(
        &self,
        packets: &[Box<dyn rtcp::packet::Packet + Send + Sync>],
    ) -> Result<usize> {
        self.media.write_rtcp(packets).await
    }

    pub async fn send_data(&self, message: &DataMessage) -> Result<()> {
        self.data.send(message).await
    }

    pub async fn recv_data(&self) -> Option<DataMessage> {
        self.data.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Close data, then media, then metadata. Every channel is closed even if
    /// an earlier one fails, and every failure is returned. Only the first
    /// call does anything.
    pub async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut errors = CloseErrors::new();
        errors.add(CloseTarget::Channel(StreamRole::Data), self.data.close().await);
        errors.add(CloseTarget::Channel(StreamRole::Media), self.media.close().await);
        errors.add(
            CloseTarget::Channel(StreamRole::Metadata),
            self.metadata.close().await,
        );

        self.done_trigger.fire();

        if errors.is_empty() {
            tracing::info!(parent: &self.span, "Closed server transport {}", self.client_id);
        } else {
            tracing::warn!(parent: &self.span, "Server transport {}: {}", self.client_id, errors);
        }
        errors.into_result()
    }
}

impl Drop for ServerTransport {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get() {
            watcher.abort();
        }
    }
}

/// Close the transport once any channel's read loop stops on its own
async fn watch_channels(transport: Weak<ServerTransport>, channels: [Done; 3]) {
    let [metadata, media, data] = channels;
    let role = tokio::select! {
        _ = metadata.wait() => StreamRole::Metadata,
        _ = media.wait() => StreamRole::Media,
        _ = data.wait() => StreamRole::Data,
    };

    let Some(transport) = transport.upgrade() else {
        return;
    };
    if transport.is_closed() {
        return;
    }

    tracing::info!("Remote ended the {} channel, closing transport", role);
    if let Err(e) = transport.close().await {
        tracing::warn!("{}", e);
    }
}

#[async_trait::async_trait]
impl Transport for ServerTransport {
    fn client_id(&self) -> &ClientId {
        ServerTransport::client_id(self)
    }

    fn transport_type(&self) -> TransportType {
        ServerTransport::transport_type(self)
    }

    fn done(&self) -> Done {
        ServerTransport::done(self)
    }

    async fn close(&self) -> Result<()> {
        ServerTransport::close(self).await
    }
}
