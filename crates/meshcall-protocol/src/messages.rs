use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identifiers::UserId;
use crate::types::TrackJson;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Empty data channel message")]
    EmptyMessage,

    #[error("Unknown data channel payload kind: {0}")]
    UnknownDataKind(u8),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// What a metadata track event announces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackEventKind {
    /// Publisher announces a new track
    Add,
    /// Publisher withdraws a track
    Remove,
    /// Ask the publisher to start forwarding a track
    Sub,
    /// Ask the publisher to stop forwarding a track
    Unsub,
}

/// Message carried on the ordered metadata stream (stream 0). The room is
/// implied by the metadata sub-stream it travels on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackEvent {
    #[serde(rename = "type")]
    pub kind: TrackEventKind,
    pub track: TrackJson,
    pub ssrc: u32,
    pub user_id: UserId,
}

impl TrackEvent {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Data channel payload kind, using the WebRTC data channel PPIDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataKind {
    String = 51,
    Binary = 53,
}

impl TryFrom<u8> for DataKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            51 => Ok(DataKind::String),
            53 => Ok(DataKind::Binary),
            other => Err(ProtocolError::UnknownDataKind(other)),
        }
    }
}

/// Application message carried on a room's data channel stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    pub kind: DataKind,
    pub data: Vec<u8>,
}

impl DataMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: DataKind::String,
            data: text.into().into_bytes(),
        }
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: DataKind::Binary,
            data: data.into(),
        }
    }

    /// Encode as `kind | data`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 1);
        out.push(self.kind as u8);
        out.extend_from_slice(&self.data);
        out
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, ProtocolError> {
        let (&kind, data) = raw.split_first().ok_or(ProtocolError::EmptyMessage)?;
        Ok(Self {
            kind: DataKind::try_from(kind)?,
            data: data.to_vec(),
        })
    }
}
