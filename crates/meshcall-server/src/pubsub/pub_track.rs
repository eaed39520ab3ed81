use meshcall_protocol::{ClientId, TrackId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::transport::Track;

/// Identity of a published track: who sends it, whose it is, and which
/// track it is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubTrack {
    client_id: ClientId,
    user_id: UserId,
    track_id: TrackId,
}

/// Two announcements with the same key refer to the same logical track
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PubTrackKey {
    pub client_id: ClientId,
    pub track_id: TrackId,
}

impl PubTrack {
    /// Derive the identity from the publishing client and what the track
    /// reports about itself.
    pub fn new(pub_client_id: ClientId, track: &dyn Track) -> Self {
        Self {
            client_id: pub_client_id,
            user_id: track.user_id(),
            track_id: track.unique_id(),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn track_id(&self) -> &TrackId {
        &self.track_id
    }

    pub fn key(&self) -> PubTrackKey {
        PubTrackKey {
            client_id: self.client_id.clone(),
            track_id: self.track_id.clone(),
        }
    }
}

/// Published tracks, deduplicated by publisher and track id
#[derive(Debug, Default)]
pub struct PubTrackSet {
    tracks: HashMap<PubTrackKey, PubTrack>,
}

impl PubTrackSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the same track was already present
    pub fn insert(&mut self, track: PubTrack) -> bool {
        self.tracks.insert(track.key(), track).is_none()
    }

    pub fn remove(&mut self, client_id: &ClientId, track_id: &TrackId) -> Option<PubTrack> {
        self.tracks.remove(&PubTrackKey {
            client_id: client_id.clone(),
            track_id: track_id.clone(),
        })
    }

    pub fn contains(&self, key: &PubTrackKey) -> bool {
        self.tracks.contains_key(key)
    }

    /// Drop every track published by a client, e.g. when its transport closes
    pub fn remove_client(&mut self, client_id: &ClientId) -> Vec<PubTrack> {
        let keys: Vec<PubTrackKey> = self
            .tracks
            .keys()
            .filter(|key| &key.client_id == client_id)
            .cloned()
            .collect();

        keys.iter()
            .filter_map(|key| self.tracks.remove(key))
            .collect()
    }

    pub fn by_user(&self, user_id: &UserId) -> Vec<&PubTrack> {
        self.tracks
            .values()
            .filter(|track| &track.user_id == user_id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PubTrack> {
        self.tracks.values()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcall_protocol::{Codec, PeerId, TrackJson};

    struct TestTrack {
        json: TrackJson,
        unique_id: &'static str,
        user_id: &'static str,
    }

    impl TestTrack {
        fn new(unique_id: &'static str, user_id: &'static str) -> Self {
            Self {
                json: TrackJson {
                    id: "t".to_string(),
                    stream_id: "s".to_string(),
                    peer_id: PeerId::from("p"),
                    codec: Codec {
                        mime_type: "audio/opus".to_string(),
                        clock_rate: 48000,
                        channels: 2,
                        sdp_fmtp_line: String::new(),
                    },
                },
                unique_id,
                user_id,
            }
        }
    }

    impl Track for TestTrack {
        fn unique_id(&self) -> TrackId {
            TrackId::from(self.unique_id)
        }

        fn user_id(&self) -> UserId {
            UserId::from(self.user_id)
        }

        fn track_json(&self) -> &TrackJson {
            &self.json
        }
    }

    #[test]
    fn test_derives_identity_from_track() {
        let track = TestTrack::new("T1", "U1");
        let pub_track = PubTrack::new(ClientId::from("C1"), &track);

        assert_eq!(pub_track.client_id(), &ClientId::from("C1"));
        assert_eq!(pub_track.user_id(), &UserId::from("U1"));
        assert_eq!(pub_track.track_id(), &TrackId::from("T1"));

        let json = serde_json::to_value(&pub_track).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"clientId": "C1", "userId": "U1", "trackId": "T1"})
        );
    }

    #[test]
    fn test_derivation_is_stable() {
        let track = TestTrack::new("T1", "U1");
        let first = PubTrack::new(ClientId::from("C1"), &track);
        for _ in 0..10 {
            assert_eq!(PubTrack::new(ClientId::from("C1"), &track), first);
        }
    }

    #[test]
    fn test_set_deduplicates_by_publisher_and_track() {
        let mut set = PubTrackSet::new();
        let track = TestTrack::new("T1", "U1");

        assert!(set.insert(PubTrack::new(ClientId::from("C1"), &track)));
        assert!(!set.insert(PubTrack::new(ClientId::from("C1"), &track)));
        assert!(set.insert(PubTrack::new(ClientId::from("C2"), &track)));
        assert_eq!(set.len(), 2);

        let other = TestTrack::new("T2", "U1");
        set.insert(PubTrack::new(ClientId::from("C1"), &other));
        assert_eq!(set.by_user(&UserId::from("U1")).len(), 3);

        let removed = set.remove_client(&ClientId::from("C1"));
        assert_eq!(removed.len(), 2);
        assert_eq!(set.len(), 1);
        assert!(set
            .remove(&ClientId::from("C2"), &TrackId::from("T1"))
            .is_some());
        assert!(set.is_empty());
    }
}
