use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Prefix for client identities that belong to another server node rather
/// than to a human participant.
pub const SERVER_NODE_PREFIX: &str = "node:";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identity of a connected client (a participant, or a remote server node)
    ClientId
);
string_id!(
    /// Identity of the user a track logically belongs to
    UserId
);
string_id!(
    /// System-wide unique track identity
    TrackId
);
string_id!(
    /// Logical peer a track was announced for
    PeerId
);
string_id!(
    /// Room (call) identity
    RoomId
);

impl ClientId {
    /// Generate a fresh identity for a server-to-server transport.
    pub fn new_server_node() -> Self {
        Self(format!("{}{}", SERVER_NODE_PREFIX, Uuid::new_v4()))
    }

    pub fn is_server_node(&self) -> bool {
        self.0.starts_with(SERVER_NODE_PREFIX)
    }
}
