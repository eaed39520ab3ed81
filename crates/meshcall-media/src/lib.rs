//! Media utilities for Meshcall node-to-node transports
//!
//! This crate provides:
//! - The codec registry shared by every transport on a node
//! - RTP/RTCP classification and decoding for media streams

pub mod codec;
pub mod packet;

pub use codec::{CodecKind, CodecRegistry, RegisteredCodec};
pub use packet::{MediaPacket, PacketKind, RECEIVE_MTU};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot handle empty buffer")]
    NoData,

    #[error("unknown packet")]
    UnknownPacket,

    #[error("malformed {0} packet: {1}")]
    Malformed(&'static str, String),
}

pub type Result<T> = std::result::Result<T, Error>;
