use serde::{Deserialize, Serialize};

use crate::models::WireEnvelope;

// -- Messages --

/// What the client hands to the persistence sink for one send.
/// The sink assigns the message id and arrival marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OutgoingMessage {
    pub sender_id: String,
    pub sender_display: String,
    pub envelope: WireEnvelope,
}
