//! Server-to-server transport
//!
//! A node pair shares one multiplexed link. Stream 0 carries the ordered
//! metadata channel for every room. Each room then owns one odd stream N for
//! unordered media and the even stream N + 1 for ordered data-channel
//! messages. See [`crate::mux`] for how streams are carried.

mod data;
mod media;
mod metadata;
mod transport;

pub use data::{DataTransport, DataTransportParams};
pub use media::{MediaStatsSnapshot, MediaStream, MediaStreamParams, RtcpBatch};
pub use metadata::{
    LocalTrack, MetadataEvent, MetadataTransport, MetadataTransportParams, RemoteTrack,
};
pub use transport::{Params, ServerTransport};
