//! Integration tests for server-to-server transports
//!
//! Run with: cargo test -p meshcall-server --test transport_tests

use async_trait::async_trait;
use bytes::Bytes;
use meshcall_media::CodecRegistry;
use meshcall_protocol::{Codec, DataKind, DataMessage, PeerId, RoomId, TrackId, TrackJson, UserId};
use meshcall_server::mux::{pipe, LinkSide, StreamConn, StreamRole};
use meshcall_server::servertransport::{LocalTrack, MetadataEvent};
use meshcall_server::{
    CloseTarget, Error, LinkOptions, NodeLink, Params, ServerTransport, Track, Transport,
    TransportType,
};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tokio_test::assert_ok;
use webrtc::interceptor::noop::NoOp;
use webrtc::rtp;

const WAIT: Duration = Duration::from_secs(2);

/// Connection that never receives anything and records its closes
struct TestConn {
    role: &'static str,
    fail_close: bool,
    closes: AtomicUsize,
    log: Arc<Mutex<Vec<&'static str>>>,
    closed: watch::Sender<bool>,
}

impl TestConn {
    fn new(role: &'static str, fail_close: bool, log: Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
        Arc::new(Self {
            role,
            fail_close,
            closes: AtomicUsize::new(0),
            log,
            closed: watch::channel(false).0,
        })
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamConn for TestConn {
    async fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
        Err(io::Error::new(io::ErrorKind::UnexpectedEof, "closed"))
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    async fn close(&self) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(self.role);
        self.closed.send_replace(true);

        if self.fail_close {
            Err(io::Error::other(format!("{} close failed", self.role)))
        } else {
            Ok(())
        }
    }
}

struct TestConns {
    metadata: Arc<TestConn>,
    media: Arc<TestConn>,
    data: Arc<TestConn>,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl TestConns {
    fn new(fail_metadata: bool, fail_media: bool, fail_data: bool) -> Self {
        let log = Arc::new(Mutex::new(Vec::new()));
        Self {
            metadata: TestConn::new("metadata", fail_metadata, log.clone()),
            media: TestConn::new("media", fail_media, log.clone()),
            data: TestConn::new("data", fail_data, log.clone()),
            log,
        }
    }

    fn params(&self) -> Params {
        Params::new(self.metadata.clone(), self.media.clone(), self.data.clone())
    }
}

fn opus_track(id: &str) -> TrackJson {
    TrackJson {
        id: id.to_string(),
        stream_id: "alice-stream".to_string(),
        peer_id: PeerId::from("alice-peer"),
        codec: Codec {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        },
    }
}

fn rtp_packet(ssrc: u32, sequence_number: u16) -> rtp::packet::Packet {
    rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            payload_type: 111,
            sequence_number,
            timestamp: 960 * sequence_number as u32,
            ssrc,
            ..Default::default()
        },
        payload: Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]),
    }
}

async fn next_event(events: &mut broadcast::Receiver<MetadataEvent>) -> MetadataEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for metadata event")
        .expect("metadata events closed")
}

fn linked_nodes() -> (NodeLink, NodeLink) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    (
        NodeLink::new(a, LinkSide::Dialer, LinkOptions::default()),
        NodeLink::new(b, LinkSide::Acceptor, LinkOptions::default()),
    )
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let conns = TestConns::new(false, false, false);
    let transport = ServerTransport::new(conns.params()).await;
    let done = transport.done();
    assert!(!done.is_done());

    assert_ok!(transport.close().await);
    assert_ok!(transport.close().await);

    assert!(done.is_done());
    assert_eq!(conns.metadata.closes(), 1);
    assert_eq!(conns.media.closes(), 1);
    assert_eq!(conns.data.closes(), 1);
}

#[tokio::test]
async fn test_concurrent_close_closes_each_channel_once() {
    let conns = TestConns::new(false, false, false);
    let transport = ServerTransport::new(conns.params()).await;

    let closers: Vec<_> = (0..16)
        .map(|_| {
            let transport = transport.clone();
            tokio::spawn(async move { transport.close().await })
        })
        .collect();

    for closer in closers {
        timeout(WAIT, closer).await.unwrap().unwrap().unwrap();
    }

    timeout(WAIT, transport.done().wait()).await.unwrap();
    assert_eq!(conns.metadata.closes(), 1);
    assert_eq!(conns.media.closes(), 1);
    assert_eq!(conns.data.closes(), 1);
}

#[tokio::test]
async fn test_close_order_is_data_media_metadata() {
    let conns = TestConns::new(false, false, false);
    let transport = ServerTransport::new(conns.params()).await;

    assert_ok!(transport.close().await);

    assert_eq!(*conns.log.lock().unwrap(), vec!["data", "media", "metadata"]);
}

#[tokio::test]
async fn test_close_reports_every_failure() {
    let conns = TestConns::new(true, true, false);
    let transport = ServerTransport::new(conns.params()).await;

    let errors = match transport.close().await {
        Err(Error::Close(errors)) => errors,
        other => panic!("expected aggregated close error, got {:?}", other),
    };

    assert_eq!(errors.len(), 2);
    assert!(errors.failed(&CloseTarget::Channel(StreamRole::Media)));
    assert!(errors.failed(&CloseTarget::Channel(StreamRole::Metadata)));
    assert!(!errors.failed(&CloseTarget::Channel(StreamRole::Data)));

    let message = errors.to_string();
    assert!(message.contains("media close failed"));
    assert!(message.contains("metadata close failed"));

    // Every channel was still attempted and the signal still fired
    assert_eq!(conns.data.closes(), 1);
    assert!(transport.done().is_done());

    // Later calls do not report the failures again
    assert_ok!(transport.close().await);
}

#[tokio::test]
async fn test_default_collaborators() {
    let defaults = TestConns::new(false, false, false);
    let implicit = ServerTransport::new(defaults.params()).await;

    let explicit_conns = TestConns::new(false, false, false);
    let explicit = ServerTransport::new(
        explicit_conns
            .params()
            .with_interceptor(Arc::new(NoOp))
            .with_codec_registry(Arc::new(CodecRegistry::new_default())),
    )
    .await;

    for transport in [&implicit, &explicit] {
        transport
            .add_track(LocalTrack::new(opus_track("mic"), 1000, UserId::from("alice")))
            .await
            .unwrap();
        transport.write_rtp(&rtp_packet(1000, 1)).await.unwrap();
        transport
            .send_data(&DataMessage::text("hello"))
            .await
            .unwrap();
        assert_ok!(transport.close().await);
    }
}

#[tokio::test]
async fn test_server_identity() {
    let mut ids = std::collections::HashSet::new();

    for _ in 0..16 {
        let conns = TestConns::new(false, false, false);
        let transport = ServerTransport::new(conns.params()).await;

        assert!(transport.client_id().as_str().starts_with("node:"));
        assert!(transport.client_id().is_server_node());
        assert!(ids.insert(transport.client_id().clone()));

        // Constant for the transport's lifetime
        let before = transport.client_id().clone();
        assert_ok!(transport.close().await);
        assert_eq!(transport.client_id(), &before);
    }
}

#[tokio::test]
async fn test_polymorphic_transport() {
    let conns = TestConns::new(false, false, false);
    let transport: Arc<dyn Transport> = ServerTransport::new(conns.params()).await;

    assert_eq!(transport.transport_type(), TransportType::Server);
    assert!(transport.client_id().is_server_node());

    assert_ok!(transport.close().await);
    assert!(transport.done().is_done());
}

#[tokio::test]
async fn test_remote_termination_closes_transport() {
    let (metadata, _metadata_remote) = pipe(16);
    let (media, media_remote) = pipe(16);
    let (data, _data_remote) = pipe(16);

    let transport = ServerTransport::new(Params::new(metadata, media, data)).await;
    let done = transport.done();

    media_remote.close().await.unwrap();

    timeout(WAIT, done.wait()).await.unwrap();
    assert!(done.is_done());
    assert!(transport.is_closed());

    // Explicit close after the fact is a no-op
    assert_ok!(transport.close().await);
}

#[tokio::test]
async fn test_tracks_media_and_data_across_link() {
    let (dialer, acceptor) = linked_nodes();
    let room = RoomId::from("standup");

    let local = dialer.open_room(room.clone()).await.unwrap();
    let remote = timeout(WAIT, acceptor.accept_room()).await.unwrap().unwrap();
    assert!(dialer.transport(&room).await.is_some());
    assert!(acceptor.transport(&room).await.is_some());

    let mut remote_events = remote.events();
    let mut local_events = local.events();

    local
        .add_track(LocalTrack::new(opus_track("mic"), 4242, UserId::from("alice")))
        .await
        .unwrap();

    let track = match next_event(&mut remote_events).await {
        MetadataEvent::TrackAdded(track) => track,
        other => panic!("unexpected event: {:?}", other),
    };
    assert_eq!(track.unique_id(), TrackId::from("alice-stream:mic"));
    assert_eq!(track.user_id(), UserId::from("alice"));
    assert_eq!(track.ssrc(), 4242);
    assert_eq!(track.track_json(), &opus_track("mic"));

    let pub_track = track.pub_track();
    assert_eq!(pub_track.client_id(), remote.client_id());
    assert_eq!(pub_track.track_id(), &TrackId::from("alice-stream:mic"));

    // RTP follows the announcement
    for seq in 1..=3 {
        local.write_rtp(&rtp_packet(4242, seq)).await.unwrap();
    }
    for seq in 1..=3 {
        let packet = timeout(WAIT, track.read_rtp()).await.unwrap().unwrap();
        assert_eq!(packet.header.sequence_number, seq);
        assert_eq!(packet.payload, Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]));
    }

    // Data channel messages arrive in order
    local.send_data(&DataMessage::text("first")).await.unwrap();
    local
        .send_data(&DataMessage::binary(vec![1, 2, 3]))
        .await
        .unwrap();
    let first = timeout(WAIT, remote.recv_data()).await.unwrap().unwrap();
    assert_eq!(first.kind, DataKind::String);
    assert_eq!(first.data, b"first");
    let second = timeout(WAIT, remote.recv_data()).await.unwrap().unwrap();
    assert_eq!(second.kind, DataKind::Binary);

    remote.send_data(&DataMessage::text("reply")).await.unwrap();
    let reply = timeout(WAIT, local.recv_data()).await.unwrap().unwrap();
    assert_eq!(reply.data, b"reply");

    // Subscription requests flow back to the publisher
    remote.subscribe(&track.unique_id()).await.unwrap();
    match next_event(&mut local_events).await {
        MetadataEvent::Subscribed(track_id) => assert_eq!(track_id, track.unique_id()),
        other => panic!("unexpected event: {:?}", other),
    }

    // The acceptor's link tracks what its peer publishes
    let mut published = false;
    for _ in 0..100 {
        if acceptor.is_published(&pub_track.key()).await {
            published = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(published);
    assert_eq!(
        acceptor.published_by_user(&UserId::from("alice")).await,
        vec![pub_track.clone()]
    );

    local.remove_track(&track.unique_id()).await.unwrap();
    match next_event(&mut remote_events).await {
        MetadataEvent::TrackRemoved(removed) => assert_eq!(removed, pub_track),
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(timeout(WAIT, track.read_rtp()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_rooms_on_one_link_are_independent() {
    let (dialer, acceptor) = linked_nodes();

    let local_a = dialer.open_room(RoomId::from("a")).await.unwrap();
    let local_b = dialer.open_room(RoomId::from("b")).await.unwrap();
    let remote_a = timeout(WAIT, acceptor.accept_room()).await.unwrap().unwrap();
    let remote_b = timeout(WAIT, acceptor.accept_room()).await.unwrap().unwrap();

    local_b.send_data(&DataMessage::text("to b")).await.unwrap();
    local_a.send_data(&DataMessage::text("to a")).await.unwrap();

    let a = timeout(WAIT, remote_a.recv_data()).await.unwrap().unwrap();
    let b = timeout(WAIT, remote_b.recv_data()).await.unwrap().unwrap();
    assert_eq!(a.data, b"to a");
    assert_eq!(b.data, b"to b");

    // Closing one room leaves the other running
    local_a.close().await.unwrap();
    timeout(WAIT, remote_a.done().wait()).await.unwrap();
    assert!(!remote_b.done().is_done());

    local_b.send_data(&DataMessage::text("still here")).await.unwrap();
    let b = timeout(WAIT, remote_b.recv_data()).await.unwrap().unwrap();
    assert_eq!(b.data, b"still here");

    let mut rooms = Vec::new();
    for _ in 0..100 {
        rooms = acceptor.rooms().await;
        if rooms.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(rooms, vec![RoomId::from("b")]);
}

#[tokio::test]
async fn test_unread_data_in_one_room_does_not_stall_the_link() {
    let (dialer, acceptor) = linked_nodes();

    let local_a = dialer.open_room(RoomId::from("a")).await.unwrap();
    let local_b = dialer.open_room(RoomId::from("b")).await.unwrap();
    let remote_a = timeout(WAIT, acceptor.accept_room()).await.unwrap().unwrap();
    let remote_b = timeout(WAIT, acceptor.accept_room()).await.unwrap().unwrap();
    let mut remote_b_events = remote_b.events();

    // Nobody reads room a's data channel
    for _ in 0..1000 {
        assert_ok!(local_a.send_data(&DataMessage::text("backlog")).await);
    }

    // Room b's metadata, media and data still get through
    local_b
        .add_track(LocalTrack::new(opus_track("mic"), 77, UserId::from("bob")))
        .await
        .unwrap();
    let track = match next_event(&mut remote_b_events).await {
        MetadataEvent::TrackAdded(track) => track,
        other => panic!("unexpected event: {:?}", other),
    };
    local_b.write_rtp(&rtp_packet(77, 1)).await.unwrap();
    let packet = timeout(WAIT, track.read_rtp()).await.unwrap().unwrap();
    assert_eq!(packet.header.sequence_number, 1);

    local_b.send_data(&DataMessage::text("to b")).await.unwrap();
    let b = timeout(WAIT, remote_b.recv_data()).await.unwrap().unwrap();
    assert_eq!(b.data, b"to b");
    assert_eq!(acceptor.dropped_media_frames(), 0);
    assert_eq!(acceptor.reset_streams(), 1);

    // Room a was reset: what was queued drains, then the room shuts down on
    // both ends while room b stays up
    let mut drained = 0;
    while timeout(WAIT, remote_a.recv_data()).await.unwrap().is_some() {
        drained += 1;
    }
    assert!(drained < 1000);
    timeout(WAIT, remote_a.done().wait()).await.unwrap();
    timeout(WAIT, local_a.done().wait()).await.unwrap();
    assert!(!remote_b.done().is_done());
    assert!(!acceptor.is_closed());
}

#[tokio::test]
async fn test_link_close_ends_every_room() {
    let (dialer, acceptor) = linked_nodes();

    let local = dialer.open_room(RoomId::from("lobby")).await.unwrap();
    let remote = timeout(WAIT, acceptor.accept_room()).await.unwrap().unwrap();

    dialer.close().await.unwrap();

    assert!(local.done().is_done());
    assert!(dialer.rooms().await.is_empty());
    assert!(dialer.is_closed());

    timeout(WAIT, remote.done().wait()).await.unwrap();
    timeout(WAIT, acceptor.closed()).await.unwrap();
    assert!(timeout(WAIT, acceptor.accept_room()).await.unwrap().is_none());
}
