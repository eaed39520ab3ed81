//! Media channel: RTP and RTCP for one room, on the room's odd stream

use async_trait::async_trait;
use meshcall_media::{MediaPacket, PacketKind, RECEIVE_MTU};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};
use webrtc::interceptor::stream_info::StreamInfo;
use webrtc::interceptor::{Attributes, Interceptor, RTCPWriter, RTPWriter};
use webrtc::rtcp;
use webrtc::rtp;
use webrtc::util::Marshal;

use crate::error::{Error, Result};
use crate::mux::StreamConn;
use crate::transport::{Done, DoneTrigger};

/// Queue depth per remote track. RTP beyond it is dropped.
const REMOTE_TRACK_QUEUE: usize = 128;

const RTCP_QUEUE: usize = 64;

/// A batch of RTCP packets received together
pub type RtcpBatch = Arc<Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>>;

/// Writes marshalled packets straight to the media connection. Interceptors
/// wrap it.
struct ConnWriter {
    conn: Arc<dyn StreamConn>,
}

fn interceptor_error(e: impl std::fmt::Display) -> webrtc::interceptor::Error {
    webrtc::interceptor::Error::Other(e.to_string())
}

#[async_trait]
impl RTPWriter for ConnWriter {
    async fn write(
        &self,
        pkt: &rtp::packet::Packet,
        _attributes: &Attributes,
    ) -> std::result::Result<usize, webrtc::interceptor::Error> {
        let raw = pkt.marshal().map_err(interceptor_error)?;
        self.conn.send(&raw).await.map_err(interceptor_error)
    }
}

#[async_trait]
impl RTCPWriter for ConnWriter {
    async fn write(
        &self,
        pkts: &[Box<dyn rtcp::packet::Packet + Send + Sync>],
        _attributes: &Attributes,
    ) -> std::result::Result<usize, webrtc::interceptor::Error> {
        let raw = rtcp::packet::marshal(pkts).map_err(interceptor_error)?;
        self.conn.send(&raw).await.map_err(interceptor_error)
    }
}

/// Packet counters for one media stream
#[derive(Debug, Default)]
struct MediaStats {
    rtp_packets: AtomicU64,
    rtcp_packets: AtomicU64,
    dropped_packets: AtomicU64,
    unknown_ssrc: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaStatsSnapshot {
    pub rtp_packets: u64,
    pub rtcp_packets: u64,
    /// RTP dropped because a remote track reader fell behind
    pub dropped_packets: u64,
    /// RTP for an SSRC no remote track was registered for
    pub unknown_ssrc: u64,
    /// Buffers that could not be classified or decoded
    pub errors: u64,
}

/// Routes inbound packets to remote tracks and RTCP subscribers
struct PacketRouter {
    remote: RwLock<HashMap<u32, mpsc::Sender<rtp::packet::Packet>>>,
    rtcp: broadcast::Sender<RtcpBatch>,
    stats: MediaStats,
}

impl PacketRouter {
    fn new() -> Self {
        Self {
            remote: RwLock::new(HashMap::new()),
            rtcp: broadcast::channel(RTCP_QUEUE).0,
            stats: MediaStats::default(),
        }
    }

    async fn route(&self, buf: &[u8]) -> Result<PacketKind> {
        match MediaPacket::parse(buf)? {
            MediaPacket::Rtp(packet) => {
                self.stats.rtp_packets.fetch_add(1, Ordering::Relaxed);

                let ssrc = packet.header.ssrc;
                let tx = self.remote.read().await.get(&ssrc).cloned();
                match tx {
                    Some(tx) => {
                        if tx.try_send(packet).is_err() {
                            self.stats.dropped_packets.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    None => {
                        let unknown = self.stats.unknown_ssrc.fetch_add(1, Ordering::Relaxed);
                        if unknown % 100 == 0 {
                            tracing::debug!("RTP for unregistered SSRC {}", ssrc);
                        }
                    }
                }
                Ok(PacketKind::Rtp)
            }
            MediaPacket::Rtcp(packets) => {
                self.stats.rtcp_packets.fetch_add(1, Ordering::Relaxed);
                // No subscribers is fine
                let _ = self.rtcp.send(Arc::new(packets));
                Ok(PacketKind::Rtcp)
            }
        }
    }

    fn snapshot(&self) -> MediaStatsSnapshot {
        MediaStatsSnapshot {
            rtp_packets: self.stats.rtp_packets.load(Ordering::Relaxed),
            rtcp_packets: self.stats.rtcp_packets.load(Ordering::Relaxed),
            dropped_packets: self.stats.dropped_packets.load(Ordering::Relaxed),
            unknown_ssrc: self.stats.unknown_ssrc.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
        }
    }
}

async fn read_loop(conn: Arc<dyn StreamConn>, router: Arc<PacketRouter>, closed: DoneTrigger) {
    let mut buf = vec![0u8; RECEIVE_MTU];

    loop {
        let n = match conn.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::debug!("Media stream ended");
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                router.stats.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Dropping oversized media packet: {}", e);
                continue;
            }
            Err(e) => {
                tracing::warn!("Media stream read failed: {}", e);
                break;
            }
        };

        if let Err(e) = router.route(&buf[..n]).await {
            router.stats.errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Dropping media packet: {}", e);
        }
    }

    closed.fire();
}

struct LocalStream {
    info: StreamInfo,
    writer: Arc<dyn RTPWriter + Send + Sync>,
}

pub struct MediaStreamParams {
    pub conn: Arc<dyn StreamConn>,
    pub interceptor: Arc<dyn Interceptor + Send + Sync>,
    pub span: Span,
}

/// Unordered, best-effort RTP/RTCP for one room
pub struct MediaStream {
    conn: Arc<dyn StreamConn>,
    interceptor: Arc<dyn Interceptor + Send + Sync>,
    writer: Arc<ConnWriter>,
    rtcp_writer: Arc<dyn RTCPWriter + Send + Sync>,
    local_streams: RwLock<HashMap<u32, LocalStream>>,
    router: Arc<PacketRouter>,
    reader: JoinHandle<()>,
    closed: Done,
    closing: AtomicBool,
    span: Span,
}

impl MediaStream {
    pub async fn new(params: MediaStreamParams) -> Self {
        let writer = Arc::new(ConnWriter {
            conn: params.conn.clone(),
        });
        let rtcp_writer = params.interceptor.bind_rtcp_writer(writer.clone()).await;

        let router = Arc::new(PacketRouter::new());
        let trigger = DoneTrigger::new();
        let closed = trigger.signal();
        let reader = tokio::spawn(
            read_loop(params.conn.clone(), router.clone(), trigger).instrument(params.span.clone()),
        );

        Self {
            conn: params.conn,
            interceptor: params.interceptor,
            writer,
            rtcp_writer,
            local_streams: RwLock::new(HashMap::new()),
            router,
            reader,
            closed,
            closing: AtomicBool::new(false),
            span: params.span,
        }
    }

    /// Route outgoing RTP for `info.ssrc` through the interceptor. An SSRC
    /// can only be bound once.
    pub async fn bind_local_stream(&self, info: StreamInfo) -> Result<()> {
        let mut streams = self.local_streams.write().await;
        if streams.contains_key(&info.ssrc) {
            return Err(Error::SsrcInUse(info.ssrc));
        }

        let writer = self
            .interceptor
            .bind_local_stream(&info, self.writer.clone())
            .await;

        tracing::debug!(parent: &self.span, "Bound local stream {} (ssrc {})", info.id, info.ssrc);
        streams.insert(info.ssrc, LocalStream { info, writer });
        Ok(())
    }

    pub async fn unbind_local_stream(&self, ssrc: u32) -> bool {
        let stream = self.local_streams.write().await.remove(&ssrc);
        match stream {
            Some(stream) => {
                self.interceptor.unbind_local_stream(&stream.info).await;
                true
            }
            None => false,
        }
    }

    /// Send an RTP packet. Packets for bound SSRCs pass through the
    /// interceptor, anything else is written as is.
    pub async fn write_rtp(&self, packet: &rtp::packet::Packet) -> Result<usize> {
        let attributes = Attributes::new();
        let writer = self
            .local_streams
            .read()
            .await
            .get(&packet.header.ssrc)
            .map(|stream| stream.writer.clone());

        let n = match writer {
            Some(writer) => writer.write(packet, &attributes).await?,
            None => RTPWriter::write(self.writer.as_ref(), packet, &attributes).await?,
        };
        Ok(n)
    }

    pub async fn write_rtcp(
        &self,
        packets: &[Box<dyn rtcp::packet::Packet + Send + Sync>],
    ) -> Result<usize> {
        Ok(self.rtcp_writer.write(packets, &Attributes::new()).await?)
    }

    /// Start receiving RTP for an SSRC announced by the remote node
    pub async fn register_remote(&self, ssrc: u32) -> mpsc::Receiver<rtp::packet::Packet> {
        let (tx, rx) = mpsc::channel(REMOTE_TRACK_QUEUE);
        if self.router.remote.write().await.insert(ssrc, tx).is_some() {
            tracing::warn!(parent: &self.span, "Replacing remote track reader for ssrc {}", ssrc);
        }
        rx
    }

    pub async fn unregister_remote(&self, ssrc: u32) -> bool {
        self.router.remote.write().await.remove(&ssrc).is_some()
    }

    pub fn subscribe_rtcp(&self) -> broadcast::Receiver<RtcpBatch> {
        self.router.rtcp.subscribe()
    }

    /// Classify and dispatch one received buffer
    pub async fn handle_packet(&self, buf: &[u8]) -> Result<PacketKind> {
        self.router.route(buf).await
    }

    pub fn stats(&self) -> MediaStatsSnapshot {
        self.router.snapshot()
    }

    /// Fires when the read loop has stopped
    pub fn closed(&self) -> Done {
        self.closed.clone()
    }

    pub async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let streams: Vec<LocalStream> = self
            .local_streams
            .write()
            .await
            .drain()
            .map(|(_, stream)| stream)
            .collect();
        for stream in streams {
            self.interceptor.unbind_local_stream(&stream.info).await;
        }
        self.router.remote.write().await.clear();

        let result = self.conn.close().await;
        self.reader.abort();

        tracing::debug!(parent: &self.span, "Media stream closed");
        result.map_err(Error::from)
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
