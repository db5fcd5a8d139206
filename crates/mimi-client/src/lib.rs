//! MiMi client core.
//!
//! Joins a room with a shared secret, keeps a decrypted, ordered view of the
//! room's encrypted message stream and encrypts outgoing messages.
//!
//! - `pipeline`: per-message decryption state machine (pure, synchronous)
//! - `dispatcher`: the single task owning the pipeline, fed by ordered events
//! - `room`: room membership, key derivation and the send path
//! - `store`: event source / sink seams plus an in-memory implementation
//! - `config`: environment configuration

pub mod config;
pub mod dispatcher;
pub mod pipeline;
pub mod room;
pub mod store;

pub use config::{ClientConfig, ConfigError};
pub use dispatcher::{Dispatcher, DispatcherClosed, PipelineEvent};
pub use pipeline::{DisplayBody, DisplayMessage, Generation, KeyState, MessageStatus, PipelineView};
pub use room::{Identity, RoomSession, SendError};
pub use store::{EventSource, MemoryStore, MessageSink, SinkError, Snapshot};
