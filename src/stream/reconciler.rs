use futures::StreamExt;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{DocumentTree, ResponseMetadata};
use crate::stream::decoder::decode_envelopes;
use crate::stream::events::Envelope;
use crate::stream::patch::{Patch, PatchError};
use crate::stream::source::DeltaSource;

// ============================================================================
// State
// ============================================================================

/// One consistent snapshot of the response being reconstructed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamState {
    pub content: DocumentTree,
    pub is_streaming: bool,
    pub is_complete: bool,
    pub error: Option<String>,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        self.is_complete || self.error.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub frames: usize,
    pub patches_applied: usize,
    pub patches_dropped: usize,
    pub metadata_frames: usize,
}

/// What happened to a submitted source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Processed,
    /// This reconciler has already consumed the source.
    AlreadyProcessed,
    /// Another consumer is reading (or has read) the source.
    Locked,
}

#[derive(Debug, Clone)]
pub enum ReconcilerEvent {
    State(Arc<StreamState>),
    Metadata(ResponseMetadata),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Box<dyn FnMut(Arc<StreamState>) + Send>;
type MetadataHook = Box<dyn FnMut(&ResponseMetadata) + Send>;

// ============================================================================
// Reconciler
// ============================================================================

/// Owns the document for one response and applies deltas to it in order.
///
/// Subscribers are called inline, after each mutation has been committed and
/// before the next frame is read.
pub struct StreamReconciler {
    wire: Arc<Value>,
    is_streaming: bool,
    is_complete: bool,
    error: Option<String>,
    cached: OnceLock<Arc<StreamState>>,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    metadata_hooks: Vec<MetadataHook>,
    next_subscription: u64,
    processed: HashSet<Uuid>,
    stats: ReconcileStats,
}

impl Default for StreamReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamReconciler {
    pub fn new() -> Self {
        Self {
            wire: Arc::new(Value::Array(Vec::new())),
            is_streaming: false,
            is_complete: false,
            error: None,
            cached: OnceLock::new(),
            subscribers: Vec::new(),
            metadata_hooks: Vec::new(),
            next_subscription: 0,
            processed: HashSet::new(),
            stats: ReconcileStats::default(),
        }
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(Arc<StreamState>) + Send + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    pub fn on_metadata<F>(&mut self, callback: F)
    where
        F: FnMut(&ResponseMetadata) + Send + 'static,
    {
        self.metadata_hooks.push(Box::new(callback));
    }

    /// Fan-out form of [`subscribe`](Self::subscribe) and
    /// [`on_metadata`](Self::on_metadata). The channel closes when the
    /// reconciler is dropped.
    pub fn event_channel(&mut self) -> mpsc::UnboundedReceiver<ReconcilerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let meta_tx = tx.clone();
        self.subscribe(move |state| {
            let _ = tx.send(ReconcilerEvent::State(state));
        });
        self.on_metadata(move |metadata| {
            let _ = meta_tx.send(ReconcilerEvent::Metadata(metadata.clone()));
        });
        rx
    }

    /// Current snapshot; built on first read after a mutation and cached.
    pub fn state(&self) -> Arc<StreamState> {
        self.cached
            .get_or_init(|| {
                Arc::new(StreamState {
                    content: DocumentTree::from_wire(&self.wire),
                    is_streaming: self.is_streaming,
                    is_complete: self.is_complete,
                    error: self.error.clone(),
                })
            })
            .clone()
    }

    pub fn stats(&self) -> ReconcileStats {
        self.stats
    }

    fn notify(&mut self) {
        self.cached = OnceLock::new();
        if self.subscribers.is_empty() {
            return;
        }
        let state = self.state();
        for (_, subscriber) in &mut self.subscribers {
            subscriber(state.clone());
        }
    }

    // ------------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------------

    /// Apply one patch on a copy of the document; on failure nothing changes.
    pub fn apply_patch(&mut self, patch: &Patch) -> std::result::Result<(), PatchError> {
        let mut next = Value::clone(&self.wire);
        patch.apply(&mut next)?;
        if !next.is_array() {
            log::debug!("Patched document is not an array, resetting to empty");
            next = Value::Array(Vec::new());
        }
        self.wire = Arc::new(next);
        self.is_streaming = true;
        self.stats.patches_applied += 1;
        self.notify();
        Ok(())
    }

    fn reset(&mut self) {
        self.wire = Arc::new(Value::Array(Vec::new()));
        self.is_complete = false;
        self.error = None;
        self.is_streaming = true;
        self.stats = ReconcileStats::default();
        self.notify();
    }

    fn complete(&mut self) {
        self.is_complete = true;
        self.is_streaming = false;
        self.notify();
    }

    fn fail(&mut self, message: String) {
        self.error = Some(message);
        self.is_streaming = false;
        self.notify();
    }

    fn handle(&mut self, envelope: Envelope) {
        self.stats.frames += 1;
        match envelope {
            Envelope::Connected => log::debug!("🔌 Delta stream connected"),
            Envelope::Metadata(metadata) => {
                self.stats.metadata_frames += 1;
                log::debug!("📊 Response metadata received: {:?}", metadata.id);
                for hook in &mut self.metadata_hooks {
                    hook(&metadata);
                }
            }
            Envelope::Patch(patch) => {
                if let Err(e) = self.apply_patch(&patch) {
                    self.stats.patches_dropped += 1;
                    log::warn!("⚠️  Dropping patch that failed to apply: {}", e);
                }
            }
            Envelope::Done => {}
        }
    }

    // ------------------------------------------------------------------------
    // Processing
    // ------------------------------------------------------------------------

    /// Read `source` to the end, applying every delta in arrival order.
    ///
    /// A source is consumed at most once: resubmitting one this reconciler has
    /// seen, or one another consumer already holds, is a no-op. A stream I/O
    /// error is published as the error state and then returned.
    pub async fn process(&mut self, source: &DeltaSource) -> Result<Submission> {
        if self.processed.contains(&source.id()) {
            log::debug!("Source {} already processed, ignoring", source.id());
            return Ok(Submission::AlreadyProcessed);
        }

        let Some(bytes) = source.lock() else {
            log::warn!("Stream is locked, cannot process");
            return Ok(Submission::Locked);
        };

        self.processed.insert(source.id());
        self.reset();

        let envelopes = decode_envelopes(bytes);
        futures::pin_mut!(envelopes);

        while let Some(item) = envelopes.next().await {
            match item {
                Ok(Envelope::Done) => {
                    self.stats.frames += 1;
                    break;
                }
                Ok(envelope) => self.handle(envelope),
                Err(e) => {
                    log::error!("❌ Delta stream failed: {}", e);
                    self.fail(e.message.clone());
                    return Err(e);
                }
            }
        }

        log::debug!("🏁 Delta stream complete: {:?}", self.stats);
        self.complete();
        Ok(Submission::Processed)
    }
}
