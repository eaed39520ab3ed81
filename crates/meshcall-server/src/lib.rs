//! Meshcall Server Library
//!
//! Server-to-server transport for linking media routing nodes: one
//! multiplexed link per node pair, carrying a metadata, media and data
//! channel for every room.

pub mod config;
pub mod error;
pub mod link;
pub mod mux;
pub mod pubsub;
pub mod servertransport;
pub mod transport;

pub use error::{CloseErrors, CloseTarget, Error, Result};
pub use link::{LinkOptions, NodeLink};
pub use servertransport::{Params, ServerTransport};
pub use transport::{Done, Track, Transport, TransportType};

use mux::LinkSide;
use tokio::net::{TcpListener, TcpStream};

/// Dial the configured peer, or wait for it to dial us, and build the link
pub async fn connect(config: &config::Config, options: LinkOptions) -> anyhow::Result<NodeLink> {
    let (stream, side) = match &config.peer_address {
        Some(peer) => {
            tracing::info!("Dialing peer node at {}", peer);
            (TcpStream::connect(peer).await?, LinkSide::Dialer)
        }
        None => {
            let listener = TcpListener::bind(&config.bind_address).await?;
            tracing::info!("Waiting for peer node on {}", config.bind_address);
            let (stream, addr) = listener.accept().await?;
            tracing::info!("Peer node connected from {}", addr);
            (stream, LinkSide::Acceptor)
        }
    };

    stream.set_nodelay(true)?;
    Ok(NodeLink::new(stream, side, options))
}
