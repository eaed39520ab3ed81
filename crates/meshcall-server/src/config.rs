use meshcall_protocol::RoomId;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    /// Dial this node instead of listening when set
    pub peer_address: Option<String>,
    /// Rooms to open on the link once it is up
    pub rooms: Vec<RoomId>,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let bind_address = lookup("MESHCALL_BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:7100".to_string());

        let peer_address = lookup("MESHCALL_PEER_ADDRESS").filter(|addr| !addr.trim().is_empty());

        let rooms = lookup("MESHCALL_ROOMS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|room| !room.is_empty())
                    .map(RoomId::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Config {
            bind_address,
            peer_address,
            rooms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned()).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]);
        assert_eq!(config.bind_address, "0.0.0.0:7100");
        assert!(config.peer_address.is_none());
        assert!(config.rooms.is_empty());
    }

    #[test]
    fn test_rooms_and_peer() {
        let config = load(&[
            ("MESHCALL_PEER_ADDRESS", "10.0.0.2:7100"),
            ("MESHCALL_ROOMS", " lobby, standup ,,"),
        ]);
        assert_eq!(config.peer_address.as_deref(), Some("10.0.0.2:7100"));
        assert_eq!(
            config.rooms,
            vec![RoomId::from("lobby"), RoomId::from("standup")]
        );
    }
}
