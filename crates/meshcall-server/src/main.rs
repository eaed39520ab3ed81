use anyhow::Result;
use meshcall_server::servertransport::MetadataEvent;
use meshcall_server::{config, LinkOptions, ServerTransport};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshcall_server=debug,meshcall_node=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Meshcall node...");

    let config = config::Config::load()?;
    let link = Arc::new(meshcall_server::connect(&config, LinkOptions::default()).await?);

    for room in &config.rooms {
        match link.open_room(room.clone()).await {
            Ok(transport) => {
                tokio::spawn(serve_room(transport));
            }
            Err(e) => tracing::error!("Failed to open room {}: {}", room, e),
        }
    }

    let acceptor = link.clone();
    tokio::spawn(async move {
        while let Some(transport) = acceptor.accept_room().await {
            tokio::spawn(serve_room(transport));
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
        _ = link.closed() => tracing::warn!("Peer link went down"),
    }

    if let Err(e) = link.close().await {
        tracing::warn!("{}", e);
    }

    Ok(())
}

/// Log a room's track events and drain its data channel until it closes
async fn serve_room(transport: Arc<ServerTransport>) {
    let mut events = transport.events();
    let done = transport.done();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(MetadataEvent::TrackAdded(track)) => {
                    tracing::info!("Peer published {:?}", track.pub_track());
                }
                Ok(MetadataEvent::TrackRemoved(track)) => {
                    tracing::info!("Peer unpublished {:?}", track);
                }
                Ok(MetadataEvent::Subscribed(track_id)) => {
                    tracing::info!("Peer subscribed to {}", track_id);
                }
                Ok(MetadataEvent::Unsubscribed(track_id)) => {
                    tracing::info!("Peer unsubscribed from {}", track_id);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            },
            message = transport.recv_data() => match message {
                Some(message) => {
                    tracing::debug!("Data message ({:?}, {} bytes)", message.kind, message.data.len());
                }
                None => break,
            },
            _ = done.wait() => break,
        }
    }

    tracing::debug!("Transport {} finished", transport.client_id());
}
