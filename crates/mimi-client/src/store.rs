use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use mimi_crypto::Envelope;
use mimi_types::{ArrivalMarker, MessageId, MessageRecord, OutgoingMessage, RoomId};

/// Full, replace-on-change view of a room's stored records.
pub type Snapshot = Arc<Vec<MessageRecord>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("Sink rejected message: {0}")]
    Rejected(String),

    #[error("Sink unavailable")]
    Unavailable,
}

/// Live source of encrypted records for a room.
pub trait EventSource: Send + Sync {
    /// Subscribe to a room. The receiver holds the current snapshot and is
    /// notified with a complete new one on every change.
    fn subscribe(&self, room_id: &RoomId) -> watch::Receiver<Snapshot>;
}

/// Accepts outgoing encrypted messages. The sink assigns id and arrival order.
pub trait MessageSink: Send + Sync {
    fn append(
        &self,
        room_id: &RoomId,
        message: OutgoingMessage,
    ) -> impl Future<Output = Result<MessageId, SinkError>> + Send;
}

struct RoomLog {
    records: Vec<MessageRecord>,
    snapshot_tx: watch::Sender<Snapshot>,
}

impl RoomLog {
    fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            records: Vec::new(),
            snapshot_tx,
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(Arc::new(self.records.clone()));
    }
}

/// In-process room storage implementing both collaborator traits.
/// Records are kept in insertion order; snapshots are published unsorted.
/// Appends whose envelope does not parse are rejected.
#[derive(Default)]
pub struct MemoryStore {
    rooms: Mutex<HashMap<RoomId, RoomLog>>,
    last_marker: Mutex<Option<ArrivalMarker>>,
    fail_next: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record exactly as given (id and marker included) and publish.
    pub fn insert_record(&self, room_id: &RoomId, record: MessageRecord) {
        let mut rooms = self.rooms.lock();
        let room = rooms.entry(room_id.clone()).or_insert_with(RoomLog::new);
        room.records.push(record);
        room.publish();
    }

    /// Overwrite a stored record by id, e.g. to simulate corruption at rest.
    /// Returns false if no such record exists.
    pub fn replace_record(&self, room_id: &RoomId, record: MessageRecord) -> bool {
        let mut rooms = self.rooms.lock();
        let Some(room) = rooms.get_mut(room_id) else {
            return false;
        };
        let Some(slot) = room.records.iter_mut().find(|r| r.id == record.id) else {
            return false;
        };
        *slot = record;
        room.publish();
        true
    }

    pub fn records(&self, room_id: &RoomId) -> Vec<MessageRecord> {
        self.rooms
            .lock()
            .get(room_id)
            .map(|room| room.records.clone())
            .unwrap_or_default()
    }

    /// Make the next `append` fail with [`SinkError::Unavailable`].
    pub fn fail_next_append(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Server clock with strictly increasing markers, so two writes in the
    /// same instant still have a defined order.
    fn next_marker(&self) -> ArrivalMarker {
        let mut last = self.last_marker.lock();
        let mut marker = ArrivalMarker::now();
        if let Some(prev) = *last {
            if marker <= prev {
                marker = ArrivalMarker(prev.0 + chrono::Duration::microseconds(1));
            }
        }
        *last = Some(marker);
        marker
    }
}

impl EventSource for MemoryStore {
    fn subscribe(&self, room_id: &RoomId) -> watch::Receiver<Snapshot> {
        let mut rooms = self.rooms.lock();
        rooms
            .entry(room_id.clone())
            .or_insert_with(RoomLog::new)
            .snapshot_tx
            .subscribe()
    }
}

impl MessageSink for MemoryStore {
    async fn append(
        &self,
        room_id: &RoomId,
        message: OutgoingMessage,
    ) -> Result<MessageId, SinkError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(SinkError::Unavailable);
        }
        if let Err(e) = Envelope::from_wire(&message.envelope) {
            warn!(room = %room_id, "Rejected malformed envelope: {}", e);
            return Err(SinkError::Rejected(e.to_string()));
        }

        let id = MessageId::new(Uuid::new_v4().to_string());
        let record = MessageRecord {
            id: id.clone(),
            sender_id: message.sender_id,
            sender_display: message.sender_display,
            arrival_marker: Some(self.next_marker()),
            envelope: message.envelope,
        };
        debug!(room = %room_id, id = %id, "Stored message");
        self.insert_record(room_id, record);
        Ok(id)
    }
}
