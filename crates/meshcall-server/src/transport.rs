//! Transport abstractions shared by client-facing and server-to-server
//! transports

use async_trait::async_trait;
use meshcall_protocol::{ClientId, TrackId, TrackJson, UserId};
use std::fmt;
use tokio::sync::watch;

use crate::error::Result;

/// Kind of transport, for callers that handle transports polymorphically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    /// Connected to a participant
    Client,
    /// Connected to another server node
    Server,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Client => write!(f, "client"),
            TransportType::Server => write!(f, "server"),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn client_id(&self) -> &ClientId;

    fn transport_type(&self) -> TransportType;

    /// Completion signal, fired once the transport has closed
    fn done(&self) -> Done;

    async fn close(&self) -> Result<()>;
}

/// A published track as seen by a transport
pub trait Track: Send + Sync {
    /// Identity of the track, unique across the system
    fn unique_id(&self) -> TrackId;

    /// User the track belongs to
    fn user_id(&self) -> UserId;

    fn track_json(&self) -> &TrackJson;
}

/// Fires a [`Done`] signal at most once
#[derive(Debug)]
pub struct DoneTrigger(watch::Sender<bool>);

impl DoneTrigger {
    pub fn new() -> Self {
        Self(watch::channel(false).0)
    }

    /// Fire the signal. Returns false if it had already fired.
    pub fn fire(&self) -> bool {
        self.0.send_if_modified(|done| {
            if *done {
                false
            } else {
                *done = true;
                true
            }
        })
    }

    pub fn signal(&self) -> Done {
        Done(self.0.subscribe())
    }
}

impl Default for DoneTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only, cloneable completion signal. Observers that subscribe after it
/// fired still see it as done.
#[derive(Debug, Clone)]
pub struct Done(watch::Receiver<bool>);

impl Done {
    pub fn is_done(&self) -> bool {
        *self.0.borrow()
    }

    /// Wait until the signal fires. Also returns if the trigger is dropped.
    pub async fn wait(&self) {
        let mut rx = self.0.clone();
        let _ = rx.wait_for(|done| *done).await;
    }
}
