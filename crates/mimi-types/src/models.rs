use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Room identifier, chosen by the room creator and shared alongside the secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random room id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier the event source assigns to a stored message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-assigned arrival position. Display order follows this marker,
/// never local processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArrivalMarker(pub DateTime<Utc>);

impl ArrivalMarker {
    pub fn now() -> Self {
        Self(Utc::now())
    }
}

/// Encrypted body of one message as stored on the sink.
///
/// `payload` is `base64(iv) + ":" + base64(ciphertext)` and `digest` is
/// `base64(sha256(plaintext))`. Both are opaque to everything except the codec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub payload: String,
    pub digest: String,
}

/// One record as delivered by the room event source.
///
/// Records are immutable: the source creates them, the client only reads them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: MessageId,
    pub sender_id: String,
    pub sender_display: String,
    /// `None` until the server has stamped the write.
    #[serde(default)]
    pub arrival_marker: Option<ArrivalMarker>,
    pub envelope: WireEnvelope,
}
