use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mimi_crypto::{DerivedKey, EncryptionError, KdfConfig, RoomSecret, derive_key, encrypt_message};
use mimi_types::{MessageId, OutgoingMessage, RoomId};

use crate::config::ClientConfig;
use crate::dispatcher::{Dispatcher, DispatcherClosed, PipelineEvent};
use crate::pipeline::{Generation, PipelineView};
use crate::store::{EventSource, MessageSink, SinkError, Snapshot};

/// Who is sending. Travels in plaintext next to each encrypted body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub sender_id: String,
    pub sender_display: String,
}

impl Identity {
    pub fn new(sender_id: impl Into<String>, sender_display: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            sender_display: sender_display.into(),
        }
    }
}

/// Sending failed. Every variant that carries a `draft` hands the unsent text
/// back so it can be restored for a retry.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("Message is empty")]
    EmptyMessage,

    #[error("Not in a room")]
    NotInRoom { draft: String },

    #[error("Room key is not available yet")]
    KeyUnavailable { draft: String },

    #[error("Failed to encrypt message: {source}")]
    Encryption {
        draft: String,
        source: EncryptionError,
    },

    #[error("Failed to send message: {source}")]
    Sink { draft: String, source: SinkError },
}

impl SendError {
    pub fn into_draft(self) -> Option<String> {
        match self {
            Self::EmptyMessage => None,
            Self::NotInRoom { draft }
            | Self::KeyUnavailable { draft }
            | Self::Encryption { draft, .. }
            | Self::Sink { draft, .. } => Some(draft),
        }
    }
}

/// State of one room membership. Dropping it cancels its background tasks.
struct RoomContext {
    room_id: RoomId,
    generation: Generation,
    /// Written once, by this context's derivation task.
    key_slot: Arc<OnceLock<Arc<DerivedKey>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for RoomContext {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// A client's presence in at most one room at a time.
///
/// Joining allocates a fresh context generation, derives the room key in the
/// background and streams the room's records into the decryption pipeline.
/// Leaving (or joining elsewhere) cancels all of that and resets the pipeline.
pub struct RoomSession<S> {
    store: Arc<S>,
    dispatcher: Dispatcher,
    kdf: KdfConfig,
    identity: Identity,
    context: Option<RoomContext>,
    dispatcher_task: JoinHandle<()>,
}

impl<S> RoomSession<S>
where
    S: EventSource + MessageSink + 'static,
{
    /// Start a session with its own pipeline dispatcher. Needs a tokio runtime.
    pub fn start(store: Arc<S>, config: &ClientConfig, identity: Identity) -> Self {
        let (dispatcher, dispatcher_task) = Dispatcher::spawn(config.channel_capacity);
        Self {
            store,
            dispatcher,
            kdf: config.kdf.clone(),
            identity,
            context: None,
            dispatcher_task,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.context.as_ref().map(|c| &c.room_id)
    }

    pub fn generation(&self) -> Option<Generation> {
        self.context.as_ref().map(|c| c.generation)
    }

    /// True once the current room's key has been derived.
    pub fn has_key(&self) -> bool {
        self.context
            .as_ref()
            .is_some_and(|c| c.key_slot.get().is_some())
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<PipelineView>> {
        self.dispatcher.subscribe()
    }

    pub fn view(&self) -> Arc<PipelineView> {
        self.dispatcher.view()
    }

    /// Enter `room_id` with the shared `secret`, leaving any current room.
    pub async fn join(
        &mut self,
        room_id: RoomId,
        secret: RoomSecret,
    ) -> Result<Generation, DispatcherClosed> {
        // Cancels the previous context's tasks.
        self.context = None;

        let generation = self.dispatcher.next_generation();
        self.dispatcher
            .send(PipelineEvent::ContextReset { generation })
            .await?;
        self.dispatcher
            .send(PipelineEvent::KeyDeriving { generation })
            .await?;

        let key_slot = Arc::new(OnceLock::new());
        let derivation = tokio::spawn(derive_into_slot(
            generation,
            secret,
            self.kdf.clone(),
            Arc::clone(&key_slot),
            self.dispatcher.sender(),
        ));
        let forwarder = tokio::spawn(forward_snapshots(
            generation,
            self.store.subscribe(&room_id),
            self.dispatcher.sender(),
        ));

        info!(room = %room_id, %generation, "Joined room");
        self.context = Some(RoomContext {
            room_id,
            generation,
            key_slot,
            tasks: vec![derivation, forwarder],
        });
        Ok(generation)
    }

    /// Leave the current room. The key and every message of that room are
    /// discarded; late results from it are ignored by generation.
    pub async fn leave(&mut self) -> Result<(), DispatcherClosed> {
        let Some(context) = self.context.take() else {
            return Ok(());
        };
        info!(room = %context.room_id, generation = %context.generation, "Left room");
        drop(context);

        let generation = self.dispatcher.next_generation();
        self.dispatcher
            .send(PipelineEvent::ContextReset { generation })
            .await
    }

    /// Encrypt `text` under the room key and hand it to the sink.
    pub async fn send(&self, text: &str) -> Result<MessageId, SendError> {
        if text.trim().is_empty() {
            return Err(SendError::EmptyMessage);
        }
        let draft = || text.to_string();

        let context = self
            .context
            .as_ref()
            .ok_or_else(|| SendError::NotInRoom { draft: draft() })?;
        let key = context
            .key_slot
            .get()
            .map(Arc::clone)
            .ok_or_else(|| SendError::KeyUnavailable { draft: draft() })?;

        let envelope = encrypt_message(&key, text).map_err(|source| SendError::Encryption {
            draft: draft(),
            source,
        })?;

        let outgoing = OutgoingMessage {
            sender_id: self.identity.sender_id.clone(),
            sender_display: self.identity.sender_display.clone(),
            envelope: envelope.to_wire(),
        };

        let id = self
            .store
            .append(&context.room_id, outgoing)
            .await
            .map_err(|source| {
                warn!(room = %context.room_id, "Send failed: {}", source);
                SendError::Sink {
                    draft: draft(),
                    source,
                }
            })?;
        debug!(room = %context.room_id, id = %id, "Message sent");
        Ok(id)
    }
}

impl<S> Drop for RoomSession<S> {
    fn drop(&mut self) {
        self.context = None;
        self.dispatcher_task.abort();
    }
}

/// Derive the key off the async runtime, fill the context's slot and tell
/// the pipeline. Runs once per context.
async fn derive_into_slot(
    generation: Generation,
    secret: RoomSecret,
    kdf: KdfConfig,
    key_slot: Arc<OnceLock<Arc<DerivedKey>>>,
    events_tx: mpsc::Sender<PipelineEvent>,
) {
    let derived = tokio::task::spawn_blocking(move || derive_key(&secret, &kdf)).await;

    let event = match derived {
        Ok(Ok(key)) => {
            let key = Arc::new(key);
            if key_slot.set(Arc::clone(&key)).is_err() {
                warn!(%generation, "Key slot already filled");
                return;
            }
            PipelineEvent::KeyReady { generation, key }
        }
        Ok(Err(e)) => PipelineEvent::KeyFailed {
            generation,
            reason: e.to_string(),
        },
        Err(e) => PipelineEvent::KeyFailed {
            generation,
            reason: format!("key derivation task failed: {}", e),
        },
    };

    let _ = events_tx.send(event).await;
}

/// Relay every snapshot of the room into the pipeline, current one first.
async fn forward_snapshots(
    generation: Generation,
    mut snapshots: watch::Receiver<Snapshot>,
    events_tx: mpsc::Sender<PipelineEvent>,
) {
    loop {
        let records = Arc::clone(&snapshots.borrow_and_update());
        if events_tx
            .send(PipelineEvent::EnvelopeSetUpdated {
                generation,
                records,
            })
            .await
            .is_err()
        {
            break;
        }
        if snapshots.changed().await.is_err() {
            debug!(%generation, "Event source closed");
            break;
        }
    }
}
