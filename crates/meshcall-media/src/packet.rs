//! RTP/RTCP demultiplexing for media streams
//!
//! A room's media stream carries both RTP and RTCP. Packets are told apart
//! by the payload type byte as described in RFC 5761.

use bytes::Bytes;
use webrtc::rtcp;
use webrtc::rtp;
use webrtc::util::{Marshal, Unmarshal};

use crate::{Error, Result};

/// Size of the receive buffer for a media stream. Must fit the largest RTP
/// packet a peer may send.
pub const RECEIVE_MTU: usize = 8192;

const RTP_HEADER_LEN: usize = 12;
const RTCP_HEADER_LEN: usize = 4;

/// Payload type range that identifies RTCP (RFC 5761, section 4)
const RTCP_PAYLOAD_TYPES: std::ops::RangeInclusive<u8> = 192..=223;

/// Classification of a received buffer, without decoding it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Rtp,
    Rtcp,
}

impl PacketKind {
    pub fn classify(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(Error::NoData);
        }

        if buf.len() < RTCP_HEADER_LEN || buf[0] >> 6 != 2 {
            return Err(Error::UnknownPacket);
        }

        if RTCP_PAYLOAD_TYPES.contains(&buf[1]) {
            return Ok(PacketKind::Rtcp);
        }

        if buf.len() < RTP_HEADER_LEN {
            return Err(Error::UnknownPacket);
        }

        Ok(PacketKind::Rtp)
    }
}

/// A decoded packet from a media stream
#[derive(Debug, Clone)]
pub enum MediaPacket {
    Rtp(rtp::packet::Packet),
    Rtcp(Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>),
}

impl MediaPacket {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        match PacketKind::classify(buf)? {
            PacketKind::Rtp => {
                let mut raw = buf;
                let packet = rtp::packet::Packet::unmarshal(&mut raw)
                    .map_err(|e| Error::Malformed("rtp", e.to_string()))?;
                Ok(MediaPacket::Rtp(packet))
            }
            PacketKind::Rtcp => {
                let mut raw = buf;
                let packets = rtcp::packet::unmarshal(&mut raw)
                    .map_err(|e| Error::Malformed("rtcp", e.to_string()))?;
                Ok(MediaPacket::Rtcp(packets))
            }
        }
    }

    pub fn kind(&self) -> PacketKind {
        match self {
            MediaPacket::Rtp(_) => PacketKind::Rtp,
            MediaPacket::Rtcp(_) => PacketKind::Rtcp,
        }
    }

    pub fn marshal(&self) -> Result<Bytes> {
        match self {
            MediaPacket::Rtp(packet) => packet
                .marshal()
                .map_err(|e| Error::Malformed("rtp", e.to_string())),
            MediaPacket::Rtcp(packets) => {
                rtcp::packet::marshal(packets).map_err(|e| Error::Malformed("rtcp", e.to_string()))
            }
        }
    }
}
