//! Node link multiplexing
//!
//! Splits one physical link between two nodes into the metadata, media and
//! data streams of every room carried over it.

mod conn;
mod frame;
mod stream_id;
mod stream_mux;

pub use conn::{pipe, PipeConn, StreamConn};
pub use frame::{Frame, FrameKind, MAX_FRAME_LEN};
pub use stream_id::{LinkSide, RoomStreams, StreamAllocator, StreamId, StreamRole};
pub use stream_mux::{MuxStream, RoomConns, StreamMux};
