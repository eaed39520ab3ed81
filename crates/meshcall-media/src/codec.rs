//! Codec registry
//!
//! Codecs a node is willing to forward between nodes, keyed by mime type and
//! RTP payload type. Remote track announcements are only accepted for codecs
//! found here.

use meshcall_protocol::Codec;
use webrtc::api::media_engine::MediaEngine;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};

/// Media kind of a codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
    Audio,
    Video,
}

impl CodecKind {
    fn of(codec: &Codec) -> Option<Self> {
        match codec.kind().to_ascii_lowercase().as_str() {
            "audio" => Some(CodecKind::Audio),
            "video" => Some(CodecKind::Video),
            _ => None,
        }
    }
}

impl From<CodecKind> for RTPCodecType {
    fn from(kind: CodecKind) -> Self {
        match kind {
            CodecKind::Audio => RTPCodecType::Audio,
            CodecKind::Video => RTPCodecType::Video,
        }
    }
}

/// A codec with the payload type it was registered under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredCodec {
    pub codec: Codec,
    pub payload_type: u8,
    pub kind: CodecKind,
}

impl RegisteredCodec {
    fn to_parameters(&self) -> RTCRtpCodecParameters {
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: self.codec.mime_type.clone(),
                clock_rate: self.codec.clock_rate,
                channels: self.codec.channels,
                sdp_fmtp_line: self.codec.sdp_fmtp_line.clone(),
                rtcp_feedback: vec![],
            },
            payload_type: self.payload_type,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CodecRegistry {
    codecs: Vec<RegisteredCodec>,
}

impl CodecRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in audio and video codecs
    pub fn new_default() -> Self {
        let mut registry = Self::new();

        registry.register(
            Codec {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            },
            111,
        );

        registry.register(
            Codec {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
            },
            96,
        );

        // Baseline profile, level 3.1, NAL unit mode
        registry.register(
            Codec {
                mime_type: "video/H264".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_string(),
            },
            102,
        );

        registry
    }

    /// Register a codec under a payload type, replacing any codec already
    /// using that payload type. Codecs whose mime type is neither audio nor
    /// video are ignored.
    pub fn register(&mut self, codec: Codec, payload_type: u8) -> bool {
        let Some(kind) = CodecKind::of(&codec) else {
            tracing::warn!("Ignoring codec with unknown kind: {}", codec.mime_type);
            return false;
        };

        if let Some(pos) = self
            .codecs
            .iter()
            .position(|c| c.payload_type == payload_type)
        {
            tracing::debug!(
                "Replacing codec {} on payload type {}",
                self.codecs[pos].codec.mime_type,
                payload_type
            );
            self.codecs.remove(pos);
        }

        self.codecs.push(RegisteredCodec {
            codec,
            payload_type,
            kind,
        });
        true
    }

    /// First codec with a matching mime type (case-insensitive)
    pub fn find_by_mime(&self, mime_type: &str) -> Option<&RegisteredCodec> {
        self.codecs
            .iter()
            .find(|c| c.codec.mime_type.eq_ignore_ascii_case(mime_type))
    }

    pub fn find_by_payload_type(&self, payload_type: u8) -> Option<&RegisteredCodec> {
        self.codecs.iter().find(|c| c.payload_type == payload_type)
    }

    /// Resolve an announced codec against the registry
    pub fn resolve(&self, codec: &Codec) -> Option<&RegisteredCodec> {
        self.codecs.iter().find(|c| {
            c.codec.mime_type.eq_ignore_ascii_case(&codec.mime_type)
                && c.codec.clock_rate == codec.clock_rate
        })
    }

    pub fn codecs(&self, kind: CodecKind) -> impl Iterator<Item = &RegisteredCodec> {
        self.codecs.iter().filter(move |c| c.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    /// Register every codec with a WebRTC media engine
    pub fn fill_media_engine(&self, media_engine: &mut MediaEngine) -> Result<(), webrtc::Error> {
        for registered in &self.codecs {
            media_engine.register_codec(registered.to_parameters(), registered.kind.into())?;
        }
        Ok(())
    }
}
