//! MiMi shared types.
//!
//! Records exchanged between the room event source, the persistence sink and
//! the client-side encryption core. Message bodies only ever appear here in
//! encrypted wire form; sender identity travels as plaintext metadata.
pub mod api;
pub mod models;

pub use api::OutgoingMessage;
pub use models::{ArrivalMarker, MessageId, MessageRecord, RoomId, WireEnvelope};
