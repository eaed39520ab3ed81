use serde::{Deserialize, Serialize};

use crate::identifiers::{PeerId, TrackId};

/// Codec descriptor carried with every track announcement
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Codec {
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
    pub sdp_fmtp_line: String,
}

impl Codec {
    /// "audio" or "video", taken from the mime type
    pub fn kind(&self) -> &str {
        self.mime_type.split('/').next().unwrap_or_default()
    }
}

/// Interchange representation of a track for node-to-node transmission.
///
/// `stream_id` groups tracks that share one media source (e.g. simulcast
/// layers); `peer_id` is the logical peer, which is not necessarily the
/// client that carries the track.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackJson {
    pub id: String,
    #[serde(rename = "streamID")]
    pub stream_id: String,
    #[serde(rename = "peerId")]
    pub peer_id: PeerId,
    pub codec: Codec,
}

impl TrackJson {
    /// Identity of this track, unique across the system
    pub fn unique_id(&self) -> TrackId {
        TrackId::new(format!("{}:{}", self.stream_id, self.id))
    }
}
