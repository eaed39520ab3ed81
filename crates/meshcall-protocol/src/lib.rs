//! Shared protocol definitions for node-to-node Meshcall transports

pub mod identifiers;
pub mod messages;
pub mod types;

pub use identifiers::*;
pub use messages::*;
pub use types::*;
