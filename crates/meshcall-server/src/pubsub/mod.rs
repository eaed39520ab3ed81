//! Track identity and correlation across nodes

mod pub_track;

pub use pub_track::{PubTrack, PubTrackKey, PubTrackSet};
