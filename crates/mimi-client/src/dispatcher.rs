use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mimi_crypto::DerivedKey;

use crate::pipeline::{DecryptJob, DecryptOutcome, Generation, Pipeline, PipelineView};
use crate::store::Snapshot;

/// Everything that can change the pipeline, in the order it happened.
/// Every event names the context generation it belongs to.
#[derive(Debug)]
pub enum PipelineEvent {
    /// A new context begins; everything from older ones is dropped.
    ContextReset { generation: Generation },
    KeyDeriving { generation: Generation },
    KeyReady {
        generation: Generation,
        key: Arc<DerivedKey>,
    },
    KeyFailed {
        generation: Generation,
        reason: String,
    },
    /// Full current record set from the event source.
    EnvelopeSetUpdated {
        generation: Generation,
        records: Snapshot,
    },
    /// A decrypt job finished. Normally posted by the dispatcher's own workers.
    DecryptCompleted(DecryptOutcome),
}

impl PipelineEvent {
    pub fn generation(&self) -> Generation {
        match self {
            Self::ContextReset { generation }
            | Self::KeyDeriving { generation }
            | Self::KeyReady { generation, .. }
            | Self::KeyFailed { generation, .. }
            | Self::EnvelopeSetUpdated { generation, .. } => *generation,
            Self::DecryptCompleted(outcome) => outcome.generation,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::ContextReset { .. } => "context_reset",
            Self::KeyDeriving { .. } => "key_deriving",
            Self::KeyReady { .. } => "key_ready",
            Self::KeyFailed { .. } => "key_failed",
            Self::EnvelopeSetUpdated { .. } => "envelope_set_updated",
            Self::DecryptCompleted(_) => "decrypt_completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Pipeline dispatcher has stopped")]
pub struct DispatcherClosed;

/// Handle to the task that owns the authoritative [`Pipeline`].
///
/// Producers post [`PipelineEvent`]s; readers watch immutable
/// [`PipelineView`] snapshots. Cloning the handle is cheap.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    events_tx: mpsc::Sender<PipelineEvent>,
    view_rx: watch::Receiver<Arc<PipelineView>>,
    /// Source of fresh context generations. Starts above the pipeline's
    /// initial generation so the first reset is always accepted.
    next_generation: AtomicU64,
}

impl Dispatcher {
    /// Spawn the consumer task on the current tokio runtime.
    pub fn spawn(capacity: usize) -> (Self, JoinHandle<()>) {
        let (events_tx, events_rx) = mpsc::channel(capacity.max(1));
        let pipeline = Pipeline::new(Generation::default());
        let (view_tx, view_rx) = watch::channel(Arc::new(pipeline.view()));

        let handle = tokio::spawn(run(pipeline, events_rx, view_tx));

        let dispatcher = Self {
            inner: Arc::new(DispatcherInner {
                events_tx,
                view_rx,
                next_generation: AtomicU64::new(1),
            }),
        };
        (dispatcher, handle)
    }

    /// Allocate a generation no earlier context has used.
    pub fn next_generation(&self) -> Generation {
        Generation(self.inner.next_generation.fetch_add(1, Ordering::SeqCst))
    }

    pub async fn send(&self, event: PipelineEvent) -> Result<(), DispatcherClosed> {
        self.inner
            .events_tx
            .send(event)
            .await
            .map_err(|_| DispatcherClosed)
    }

    /// Raw sender for producer tasks.
    pub fn sender(&self) -> mpsc::Sender<PipelineEvent> {
        self.inner.events_tx.clone()
    }

    /// Subscribe to view snapshots. The receiver starts at the current view.
    pub fn subscribe(&self) -> watch::Receiver<Arc<PipelineView>> {
        self.inner.view_rx.clone()
    }

    pub fn view(&self) -> Arc<PipelineView> {
        Arc::clone(&self.inner.view_rx.borrow())
    }
}

/// Consumer loop. Ends once every event sender is gone.
async fn run(
    mut pipeline: Pipeline,
    mut events_rx: mpsc::Receiver<PipelineEvent>,
    view_tx: watch::Sender<Arc<PipelineView>>,
) {
    // Worker results come back on their own channel so that the loop can
    // still observe the producers closing.
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<DecryptOutcome>();

    loop {
        let event = tokio::select! {
            event = events_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            Some(outcome) = done_rx.recv() => PipelineEvent::DecryptCompleted(outcome),
        };

        if apply(&mut pipeline, event, &done_tx) {
            view_tx.send_replace(Arc::new(pipeline.view()));
        }
    }

    debug!("Pipeline dispatcher stopped");
}

/// Apply one event. Returns true when the view changed.
fn apply(
    pipeline: &mut Pipeline,
    event: PipelineEvent,
    done_tx: &mpsc::UnboundedSender<DecryptOutcome>,
) -> bool {
    let generation = event.generation();

    if let PipelineEvent::ContextReset { generation } = event {
        if pipeline.reset(generation) {
            info!(%generation, "Context reset");
            return true;
        }
        return false;
    }

    if generation != pipeline.generation() {
        debug!(
            %generation,
            current = %pipeline.generation(),
            event = event.kind(),
            "Dropping event from stale context"
        );
        return false;
    }

    match event {
        PipelineEvent::ContextReset { .. } => false,
        PipelineEvent::KeyDeriving { .. } => {
            pipeline.key_deriving();
            true
        }
        PipelineEvent::KeyReady { key, .. } => {
            info!(%generation, fingerprint = %key.fingerprint(), "Room key ready");
            let jobs = pipeline.key_ready(key);
            spawn_jobs(jobs, done_tx);
            true
        }
        PipelineEvent::KeyFailed { reason, .. } => {
            warn!(%generation, "Room key derivation failed: {}", reason);
            pipeline.key_failed(reason);
            true
        }
        PipelineEvent::EnvelopeSetUpdated { records, .. } => {
            let jobs = pipeline.merge_snapshot(&records);
            debug!(%generation, records = records.len(), new_jobs = jobs.len(), "Merged snapshot");
            spawn_jobs(jobs, done_tx);
            true
        }
        PipelineEvent::DecryptCompleted(outcome) => pipeline.complete(outcome),
    }
}

/// Run each job on the blocking pool; jobs share nothing but the key.
fn spawn_jobs(jobs: Vec<DecryptJob>, done_tx: &mpsc::UnboundedSender<DecryptOutcome>) {
    for job in jobs {
        let done_tx = done_tx.clone();
        tokio::task::spawn_blocking(move || {
            // Receiver gone means the dispatcher stopped; nothing to report to.
            let _ = done_tx.send(job.run());
        });
    }
}
