use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};

use crate::error::{RelayError, Result};
use crate::delivery::surface::LiveMessageSurface;
use crate::models::{ActionElement, DocumentTree, ResponseMetadata};
use crate::render::{render, render_open};
use crate::stream::{ReconcilerEvent, StreamState};
use crate::tasks::{extract, TaskState, TaskTrackers};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);
pub const ERROR_NOTICE: &str = "\n\n_Error: Failed to complete streaming response_";

// ============================================================================
// Live Message Lifecycle
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveMessage {
    NotStarted,
    Open { id: String },
    Closed { id: String },
}

impl LiveMessage {
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::NotStarted => None,
            Self::Open { id } | Self::Closed { id } => Some(id),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryTarget {
    pub channel: String,
    pub thread: Option<String>,
}

// ============================================================================
// Debounce Timer
// ============================================================================

/// The one flush timer of a batcher. Arming it again replaces the previous
/// deadline, so at most one flush is ever pending. The underlying `Sleep` is
/// created on first use, so a timer can be built outside a runtime.
pub struct DebounceTimer {
    sleep: Option<Pin<Box<Sleep>>>,
    delay: Duration,
    armed: bool,
}

impl DebounceTimer {
    pub fn new(delay: Duration) -> Self {
        Self {
            sleep: None,
            delay,
            armed: false,
        }
    }

    pub fn arm(&mut self) {
        let deadline = Instant::now() + self.delay;
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().reset(deadline),
            None => self.sleep = Some(Box::pin(tokio::time::sleep_until(deadline))),
        }
        self.armed = true;
    }

    pub fn cancel(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Resolves when the armed deadline passes; never resolves while disarmed.
    pub async fn fired(&mut self) {
        match self.sleep.as_mut() {
            Some(sleep) if self.armed => sleep.as_mut().await,
            _ => return std::future::pending().await,
        }
        self.armed = false;
    }
}

// ============================================================================
// Text Cursor
// ============================================================================

/// Tracks the rendered text already handed to the batch buffer.
///
/// Delivery is append-only: text leaves the cursor only when the new
/// rendering extends what was delivered.
#[derive(Debug, Default)]
pub struct TextCursor {
    delivered: String,
    diverged: bool,
}

impl TextCursor {
    /// Text of `rendered` past what was delivered, if `rendered` extends it.
    ///
    /// A rendering that rewrote delivered text is held back until a later one
    /// extends the delivered text again, or until [`finish`](Self::finish).
    pub fn advance(&mut self, rendered: &str) -> Option<String> {
        match rendered.strip_prefix(self.delivered.as_str()) {
            Some("") => None,
            Some(suffix) => {
                self.diverged = false;
                self.delivered.push_str(suffix);
                Some(suffix.to_string())
            }
            None => {
                if !self.diverged {
                    log::warn!(
                        "⚠️  Rendered text rewrote delivered text ({} delivered, {} rendered), holding back",
                        self.delivered.len(),
                        rendered.len()
                    );
                }
                self.diverged = true;
                None
            }
        }
    }

    /// Settle on the final rendering.
    ///
    /// When the final text still rewrites delivered text, everything after
    /// the common prefix is sent again: the surface can't retract text, so a
    /// repeated fragment is preferred over a lost one.
    pub fn finish(&mut self, rendered: &str) -> Option<String> {
        if let Some(rest) = self.advance(rendered) {
            return Some(rest);
        }
        if !self.diverged {
            return None;
        }

        let at = common_prefix_len(&self.delivered, rendered);
        log::warn!(
            "⚠️  Final text differs from delivered text after byte {}, resending the tail",
            at
        );
        self.diverged = false;
        self.delivered = rendered.to_string();
        Some(rendered[at..].to_string()).filter(|s| !s.is_empty())
    }

    pub fn delivered(&self) -> &str {
        &self.delivered
    }
}

/// Length in bytes of the longest common prefix, on a char boundary of both.
fn common_prefix_len(a: &str, b: &str) -> usize {
    a.char_indices()
        .zip(b.chars())
        .find(|((_, x), y)| x != y)
        .map(|((i, _), _)| i)
        .unwrap_or_else(|| a.len().min(b.len()))
}

// ============================================================================
// Batcher
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub updates: usize,
    pub batches: usize,
    pub failed_batches: usize,
    pub chars_sent: usize,
}

#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub live: LiveMessage,
    pub metadata: ResponseMetadata,
    pub stats: DeliveryStats,
    /// The live message was stopped after a successful completion.
    pub completed: bool,
}

/// Relays one response to a live message, coalescing updates on a debounce timer.
pub struct DeliveryBatcher {
    surface: Arc<dyn LiveMessageSurface>,
    target: DeliveryTarget,
    live: LiveMessage,
    buffer: String,
    timer: DebounceTimer,
    trackers: TaskTrackers,
    sent_transitions: HashSet<(String, TaskState)>,
    sent_diagnostics: HashSet<String>,
    thought_reported: bool,
    cursor: TextCursor,
    latest: Option<DocumentTree>,
    metadata: ResponseMetadata,
    stats: DeliveryStats,
    completed: bool,
}

impl DeliveryBatcher {
    pub fn new(surface: Arc<dyn LiveMessageSurface>, target: DeliveryTarget, debounce: Duration) -> Self {
        Self {
            surface,
            target,
            live: LiveMessage::NotStarted,
            buffer: String::new(),
            timer: DebounceTimer::new(debounce),
            trackers: TaskTrackers::new(),
            sent_transitions: HashSet::new(),
            sent_diagnostics: HashSet::new(),
            thought_reported: false,
            cursor: TextCursor::default(),
            latest: None,
            metadata: ResponseMetadata::default(),
            stats: DeliveryStats::default(),
            completed: false,
        }
    }

    pub fn live(&self) -> &LiveMessage {
        &self.live
    }

    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    pub fn stats(&self) -> DeliveryStats {
        self.stats
    }

    /// Open the live message. Must happen exactly once, before any update is flushed.
    pub async fn start(&mut self) -> Result<String> {
        if self.live != LiveMessage::NotStarted {
            debug_assert!(false, "live message started twice");
            return Err(RelayError::invalid_state("live message already started"));
        }

        log::debug!("🎬 Starting live message in {}", self.target.channel);
        let id = self
            .surface
            .start(&self.target.channel, self.target.thread.as_deref(), None)
            .await?;
        log::info!("✅ Live message started: {}", id);
        self.live = LiveMessage::Open { id: id.clone() };
        Ok(id)
    }

    pub fn on_metadata(&mut self, metadata: &ResponseMetadata) {
        self.metadata.merge(metadata);
    }

    /// Fold a new snapshot into the buffer: transition lines first, then new text.
    ///
    /// Text goes out through the open rendering, so a span still being written
    /// is never closed early. The closers follow when the response settles.
    pub fn on_update(&mut self, state: &StreamState) {
        self.stats.updates += 1;

        let info = extract(&state.content, &mut self.trackers);

        if let Some(thinking) = info.thinking {
            if !self.thought_reported {
                self.thought_reported = true;
                self.schedule(&thinking.status_line());
            }
        }

        for task in &info.tasks {
            if self.sent_transitions.insert((task.id.clone(), task.state)) {
                self.schedule(&task.status_line());
            }
        }

        for fact in &info.diagnostics {
            let line = fact.status_line();
            if self.sent_diagnostics.insert(line.clone()) {
                self.schedule(&line);
            }
        }

        if let Some(text) = self.cursor.advance(&render_open(&state.content)) {
            self.schedule(&text);
        }
        self.latest = Some(state.content.clone());
    }

    /// Buffer whatever the final rendering adds to the delivered text.
    fn settle(&mut self) {
        let Some(tree) = self.latest.take() else {
            return;
        };
        if let Some(text) = self.cursor.finish(&render(&tree)) {
            self.schedule(&text);
        }
    }

    fn schedule(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        log::debug!("📦 Scheduling batch with {} new chars", text.len());
        self.buffer.push_str(text);
        self.timer.arm();
    }

    /// Send the buffer as one append. The buffer is taken before sending, so a
    /// failed append loses that batch.
    pub async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let LiveMessage::Open { id } = &self.live else {
            debug_assert!(false, "flush while live message is {:?}", self.live);
            log::error!("❌ Cannot flush: live message is {:?}", self.live);
            return;
        };
        let id = id.clone();

        let batch = std::mem::take(&mut self.buffer);
        self.stats.batches += 1;
        log::debug!("📤 Flushing batch #{} ({} chars)", self.stats.batches, batch.len());

        match self.surface.append(&self.target.channel, &id, &batch).await {
            Ok(()) => self.stats.chars_sent += batch.len(),
            Err(e) => {
                self.stats.failed_batches += 1;
                log::error!("❌ Failed to append batch #{}: {}", self.stats.batches, e);
            }
        }
    }

    /// Flush what is left and stop the live message with its action links.
    pub async fn complete(&mut self) -> Result<()> {
        self.timer.cancel();
        let LiveMessage::Open { id } = self.live.clone() else {
            return Err(RelayError::invalid_state(format!(
                "cannot complete live message in state {:?}",
                self.live
            )));
        };

        self.settle();
        self.timer.cancel();
        self.flush().await;

        let actions = ActionElement::from_metadata(&self.metadata);
        log::debug!("🎯 Stopping live message with {} actions", actions.len());
        self.live = LiveMessage::Closed { id: id.clone() };
        self.surface
            .stop(&self.target.channel, &id, None, &actions)
            .await?;
        self.completed = true;
        log::info!("✅ Live message {} stopped", id);
        Ok(())
    }

    /// Best-effort close after a failure; problems here are only logged.
    pub async fn fail(&mut self, reason: &str) {
        self.timer.cancel();
        let LiveMessage::Open { id } = self.live.clone() else {
            log::debug!("No open live message to close after error: {}", reason);
            return;
        };

        log::warn!("🛑 Closing live message {} after error: {}", id, reason);
        self.settle();
        self.timer.cancel();
        self.flush().await;
        self.live = LiveMessage::Closed { id: id.clone() };
        if let Err(e) = self
            .surface
            .stop(&self.target.channel, &id, Some(ERROR_NOTICE), &[])
            .await
        {
            log::error!("❌ Failed to stop live message {}: {}", id, e);
        }
    }

    /// Consume reconciler events until the response completes or fails.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<ReconcilerEvent>) -> DeliveryReport {
        loop {
            tokio::select! {
                biased;

                event = events.recv() => match event {
                    Some(ReconcilerEvent::State(state)) => {
                        self.on_update(&state);
                        if let Some(error) = &state.error {
                            self.fail(error).await;
                            break;
                        }
                        if state.is_complete {
                            if let Err(e) = self.complete().await {
                                log::error!("❌ Failed to complete live message: {}", e);
                            }
                            break;
                        }
                    }
                    Some(ReconcilerEvent::Metadata(metadata)) => self.on_metadata(&metadata),
                    None => {
                        self.fail("delta stream ended before completion").await;
                        break;
                    }
                },
                _ = self.timer.fired(), if self.timer.is_armed() => self.flush().await,
            }
        }

        self.report()
    }

    pub fn report(&self) -> DeliveryReport {
        DeliveryReport {
            live: self.live.clone(),
            metadata: self.metadata.clone(),
            stats: self.stats,
            completed: self.completed,
        }
    }
}
