//! Decryption state for one room context.
//!
//! [`Pipeline`] is the synchronous core: it merges envelope snapshots, holds
//! the key slot, hands out decrypt jobs and applies their outcomes. It never
//! runs cryptography itself; [`crate::dispatcher`] executes the jobs and feeds
//! the results back.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use mimi_crypto::{DecryptResult, DerivedKey, decrypt_wire};
use mimi_types::{ArrivalMarker, MessageId, MessageRecord, WireEnvelope};

/// Identifies one room context. A new generation is allocated on every join
/// and every leave; results tagged with an older generation are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Generation(pub u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen-{}", self.0)
    }
}

/// Per-message decryption state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    /// Envelope known, not decrypted yet.
    Received,
    Decrypted(String),
    /// AEAD verified but the stored digest did not match.
    IntegrityFailed,
    /// AEAD verification failed or the envelope was malformed.
    DecryptionFailed,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Received)
    }
}

impl From<DecryptResult> for MessageStatus {
    fn from(result: DecryptResult) -> Self {
        match result {
            DecryptResult::Plaintext(text) => Self::Decrypted(text),
            DecryptResult::IntegrityFailure => Self::IntegrityFailed,
            DecryptResult::DecryptionFailure => Self::DecryptionFailed,
        }
    }
}

/// A record from the event source plus its decryption status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    record: MessageRecord,
    status: MessageStatus,
}

impl Message {
    fn received(record: MessageRecord) -> Self {
        Self {
            record,
            status: MessageStatus::Received,
        }
    }

    pub fn record(&self) -> &MessageRecord {
        &self.record
    }

    pub fn id(&self) -> &MessageId {
        &self.record.id
    }

    pub fn status(&self) -> &MessageStatus {
        &self.status
    }

    fn to_display(&self) -> DisplayMessage {
        let body = match &self.status {
            MessageStatus::Received => DisplayBody::Pending,
            MessageStatus::Decrypted(text) => DisplayBody::Text(text.clone()),
            MessageStatus::IntegrityFailed => DisplayBody::IntegrityWarning,
            MessageStatus::DecryptionFailed => DisplayBody::DecryptionFailed,
        };
        DisplayMessage {
            id: self.record.id.clone(),
            sender_id: self.record.sender_id.clone(),
            sender_display: self.record.sender_display.clone(),
            arrival_marker: self.record.arrival_marker,
            body,
        }
    }
}

/// Display order: stamped records by marker, then records the server has not
/// stamped yet, ties broken by id.
fn display_order(record: &MessageRecord) -> (bool, Option<ArrivalMarker>, &MessageId) {
    (record.arrival_marker.is_none(), record.arrival_marker, &record.id)
}

/// What a renderer shows for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayBody {
    Pending,
    Text(String),
    IntegrityWarning,
    DecryptionFailed,
}

impl DisplayBody {
    pub const PENDING: &'static str = "[DECRYPTING…]";
    pub const INTEGRITY_WARNING: &'static str = "[MESSAGE INTEGRITY FAILED]";
    pub const DECRYPTION_FAILED: &'static str = "[DECRYPTION_FAILED]";

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for DisplayBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str(Self::PENDING),
            Self::Text(text) => f.write_str(text),
            Self::IntegrityWarning => f.write_str(Self::INTEGRITY_WARNING),
            Self::DecryptionFailed => f.write_str(Self::DECRYPTION_FAILED),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMessage {
    pub id: MessageId,
    pub sender_id: String,
    pub sender_display: String,
    pub arrival_marker: Option<ArrivalMarker>,
    pub body: DisplayBody,
}

/// Where the room key stands in the current context.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeyState {
    #[default]
    Absent,
    Deriving,
    Ready { fingerprint: String },
    /// Derivation failed; the user has to supply the secret again.
    Failed(String),
}

/// Immutable snapshot handed to readers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PipelineView {
    pub generation: Generation,
    pub key_state: KeyState,
    pub messages: Vec<DisplayMessage>,
}

impl PipelineView {
    pub fn pending_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.body == DisplayBody::Pending)
            .count()
    }

    pub fn is_settled(&self) -> bool {
        self.pending_count() == 0
    }
}

/// One unit of decryption work, independent of every other job.
pub struct DecryptJob {
    pub generation: Generation,
    pub id: MessageId,
    pub envelope: WireEnvelope,
    pub key: Arc<DerivedKey>,
}

impl DecryptJob {
    pub fn run(self) -> DecryptOutcome {
        let result = decrypt_wire(&self.key, &self.envelope);
        trace!(id = %self.id, generation = %self.generation, "decrypted: {}", status_label(&result));
        DecryptOutcome {
            generation: self.generation,
            id: self.id,
            envelope: self.envelope,
            result,
        }
    }
}

fn status_label(result: &DecryptResult) -> &'static str {
    match result {
        DecryptResult::Plaintext(_) => "plaintext",
        DecryptResult::IntegrityFailure => "integrity_failure",
        DecryptResult::DecryptionFailure => "decryption_failure",
    }
}

/// Result of a [`DecryptJob`], tagged with the context it was started in.
#[derive(Debug, Clone)]
pub struct DecryptOutcome {
    pub generation: Generation,
    pub id: MessageId,
    pub envelope: WireEnvelope,
    pub result: DecryptResult,
}

pub struct Pipeline {
    generation: Generation,
    key: Option<Arc<DerivedKey>>,
    key_state: KeyState,
    /// Kept in display order.
    messages: Vec<Message>,
    in_flight: HashSet<MessageId>,
}

impl Pipeline {
    pub fn new(generation: Generation) -> Self {
        Self {
            generation,
            key: None,
            key_state: KeyState::Absent,
            messages: Vec::new(),
            in_flight: HashSet::new(),
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn key_state(&self) -> &KeyState {
        &self.key_state
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Drop everything from the previous context and start `generation`.
    /// Ignored unless `generation` is newer than the current one.
    pub fn reset(&mut self, generation: Generation) -> bool {
        if generation <= self.generation {
            debug!(%generation, current = %self.generation, "Ignoring stale context reset");
            return false;
        }
        *self = Self::new(generation);
        true
    }

    pub fn key_deriving(&mut self) {
        if self.key.is_none() {
            self.key_state = KeyState::Deriving;
        }
    }

    pub fn key_failed(&mut self, reason: String) {
        if self.key.is_none() {
            self.key_state = KeyState::Failed(reason);
        }
    }

    /// Install the context's key and start decrypting everything still
    /// `Received`. The slot is written once per context; a second key for the
    /// same context is refused.
    pub fn key_ready(&mut self, key: Arc<DerivedKey>) -> Vec<DecryptJob> {
        if self.key.is_some() {
            warn!(generation = %self.generation, "Key already set for this context, ignoring");
            return Vec::new();
        }
        self.key_state = KeyState::Ready {
            fingerprint: key.fingerprint(),
        };
        self.key = Some(key);
        self.pending_jobs()
    }

    /// Merge a full snapshot from the event source.
    ///
    /// Known records with an unchanged envelope keep their status, new ones
    /// start as `Received`, and records missing from the snapshot are dropped.
    pub fn merge_snapshot(&mut self, records: &[MessageRecord]) -> Vec<DecryptJob> {
        let mut previous: HashMap<MessageId, Message> = self
            .messages
            .drain(..)
            .map(|m| (m.record.id.clone(), m))
            .collect();

        let mut seen = HashSet::with_capacity(records.len());
        let mut merged = Vec::with_capacity(records.len());

        for record in records {
            if !seen.insert(record.id.clone()) {
                debug!(id = %record.id, "Duplicate id in snapshot, keeping first");
                continue;
            }
            match previous.remove(&record.id) {
                Some(existing) if existing.record.envelope == record.envelope => {
                    merged.push(Message {
                        record: record.clone(),
                        status: existing.status,
                    });
                }
                Some(_) => {
                    debug!(id = %record.id, "Envelope changed, decrypting again");
                    self.in_flight.remove(&record.id);
                    merged.push(Message::received(record.clone()));
                }
                None => merged.push(Message::received(record.clone())),
            }
        }

        for id in previous.keys() {
            self.in_flight.remove(id);
        }

        merged.sort_by(|a, b| display_order(&a.record).cmp(&display_order(&b.record)));
        self.messages = merged;

        self.pending_jobs()
    }

    /// Apply a finished decrypt. Returns false when the outcome is stale:
    /// another generation, a message that is gone, or an envelope that has
    /// since been replaced.
    pub fn complete(&mut self, outcome: DecryptOutcome) -> bool {
        if outcome.generation != self.generation {
            debug!(id = %outcome.id, generation = %outcome.generation, "Discarding decrypt from old context");
            return false;
        }
        let Some(message) = self.messages.iter_mut().find(|m| m.record.id == outcome.id) else {
            debug!(id = %outcome.id, "Discarding decrypt for a message no longer listed");
            return false;
        };
        if message.record.envelope != outcome.envelope || message.status.is_terminal() {
            return false;
        }
        if !self.in_flight.remove(&outcome.id) {
            debug!(id = %outcome.id, "Discarding decrypt with no pending request");
            return false;
        }

        if outcome.result == DecryptResult::IntegrityFailure {
            warn!(id = %outcome.id, sender = %message.record.sender_id, "Message failed integrity check");
        }
        message.status = outcome.result.into();
        true
    }

    pub fn view(&self) -> PipelineView {
        PipelineView {
            generation: self.generation,
            key_state: self.key_state.clone(),
            messages: self.messages.iter().map(Message::to_display).collect(),
        }
    }

    /// Jobs for every `Received` message not already being decrypted.
    fn pending_jobs(&mut self) -> Vec<DecryptJob> {
        let Some(key) = &self.key else {
            return Vec::new();
        };

        let mut jobs = Vec::new();
        for message in &self.messages {
            if message.status.is_terminal() || self.in_flight.contains(&message.record.id) {
                continue;
            }
            self.in_flight.insert(message.record.id.clone());
            jobs.push(DecryptJob {
                generation: self.generation,
                id: message.record.id.clone(),
                envelope: message.record.envelope.clone(),
                key: Arc::clone(key),
            });
        }
        jobs
    }
}
