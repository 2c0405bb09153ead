//! Conversation Worker
//!
//! One long-lived task per active conversation. The worker drains an
//! unbounded inbound queue strictly in order, runs each message through the
//! generation pipeline, keeps the transcript inside its context budget, and
//! persists after every processed message.
//!
//! # State Machine
//!
//! ```text
//! WaitingForMessage → GeneratingResponse → (Summarising) → Saving ─┐
//!        ▲                                                         │
//!        └─────────────────────────────────────────────────────────┘
//!                          │ cancel / fault
//!                          ▼
//!                       Complete (terminal)
//! ```
//!
//! Concurrency happens across workers; within one conversation everything is
//! sequential, so replies can never interleave out of order.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pool::EndpointPool;
use crate::store::TranscriptStore;
use crate::tools::ToolExecutor;
use crate::transcript::{GenerateError, GenerationSettings, Transcript};

// ============================================================================
// Messages and Keys
// ============================================================================

/// Identifies one conversation (e.g. a chat room or direct-message peer)
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChannelKey(pub String);

impl ChannelKey {
    /// The key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An inbound message routed to a conversation worker
#[derive(Clone, Debug)]
pub struct InboundMessage {
    /// Who sent it
    pub sender: String,
    /// Message text
    pub text: String,
}

/// A generated reply, tagged with its conversation
#[derive(Clone, Debug)]
pub struct OutboundReply {
    /// Conversation the reply belongs to
    pub channel: ChannelKey,
    /// Reply text
    pub text: String,
}

// ============================================================================
// Worker State
// ============================================================================

/// Observable lifecycle state of a worker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    /// Parked on the inbound queue
    WaitingForMessage,
    /// Running the generation pipeline for one message
    GeneratingResponse,
    /// Compressing the transcript
    Summarising,
    /// Persisting the transcript
    Saving,
    /// Stopped; the worker will never process again
    Complete,
}

/// Knobs for the worker loop
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    /// Context window of the served model, in tokens
    pub context_window: u32,
    /// Usage fraction above which to summarise when the queue is idle
    pub summarise_idle_pct: f64,
    /// Usage fraction above which to summarise regardless of queue depth
    pub summarise_always_pct: f64,
    /// Usage fraction after summarising that means compression failed
    pub hard_clear_pct: f64,
    /// How many non-tool turns back tool scaffolding is kept
    pub buried_tool_depth: usize,
    /// Bound on tool-call generation rounds per message
    pub max_steps: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            context_window: 8192,
            summarise_idle_pct: 0.5,
            summarise_always_pct: 0.7,
            hard_clear_pct: 0.9,
            buried_tool_depth: 4,
            max_steps: 4,
        }
    }
}

/// Everything a worker needs besides its key; shared by all workers of one
/// registry
pub struct WorkerDeps {
    /// Backend admission control
    pub pool: Arc<EndpointPool>,
    /// Tool execution boundary
    pub tools: Arc<dyn ToolExecutor>,
    /// Transcript persistence
    pub store: Arc<dyn TranscriptStore>,
    /// Where generated replies go
    pub outbound: mpsc::UnboundedSender<OutboundReply>,
    /// Loop tuning
    pub settings: WorkerSettings,
    /// Backend/model parameters
    pub generation: GenerationSettings,
    /// Deployed system prompt for new transcripts
    pub system_prompt: String,
}

struct WorkerShared {
    state: Mutex<WorkerState>,
    last_updated: Mutex<Instant>,
}

impl WorkerShared {
    fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
    }

    fn touch(&self) {
        *self.last_updated.lock() = Instant::now();
    }
}

/// Handle to one running conversation worker
pub struct ConversationWorker {
    key: ChannelKey,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    cancel: CancellationToken,
    shared: Arc<WorkerShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConversationWorker {
    /// Spawn the worker task for `key`
    #[must_use]
    pub fn spawn(key: ChannelKey, deps: Arc<WorkerDeps>, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(WorkerShared {
            state: Mutex::new(WorkerState::WaitingForMessage),
            last_updated: Mutex::new(Instant::now()),
        });

        let task = tokio::spawn(run(
            key.clone(),
            deps,
            rx,
            cancel.clone(),
            shared.clone(),
        ));

        Self {
            key,
            inbound: tx,
            cancel,
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    /// This worker's conversation key
    #[must_use]
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.shared.state.lock()
    }

    /// Whether the worker has stopped for good
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state() == WorkerState::Complete
    }

    /// When the worker last started processing a message
    #[must_use]
    pub fn last_updated(&self) -> Instant {
        *self.shared.last_updated.lock()
    }

    /// Queue a message; returns false when the worker can no longer accept
    pub fn enqueue(&self, message: InboundMessage) -> bool {
        if self.is_complete() {
            return false;
        }
        self.inbound.send(message).is_ok()
    }

    /// Ask the worker to stop; it persists its transcript and goes `Complete`
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the worker task to finish
    pub async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl fmt::Debug for ConversationWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationWorker")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Worker Loop
// ============================================================================

enum StepOutcome {
    Continue,
    Cancelled,
    Fault,
}

async fn run(
    key: ChannelKey,
    deps: Arc<WorkerDeps>,
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    cancel: CancellationToken,
    shared: Arc<WorkerShared>,
) {
    let mut transcript = Transcript::new(
        deps.system_prompt.clone(),
        deps.generation.clone(),
        deps.pool.clone(),
        deps.tools.clone(),
    );

    match deps.store.get(key.as_str()).await {
        Ok(Some(blob)) => match transcript.load(&blob, false) {
            Ok(()) => tracing::debug!(%key, turns = transcript.len(), "restored transcript"),
            Err(e) => tracing::warn!(%key, error = %e, "saved transcript unreadable, starting fresh"),
        },
        Ok(None) => {}
        Err(e) => tracing::warn!(%key, error = %e, "transcript load failed, starting fresh"),
    }

    let exit_reason = loop {
        shared.set_state(WorkerState::WaitingForMessage);

        let message = tokio::select! {
            () = cancel.cancelled() => break "cancelled",
            msg = inbound.recv() => match msg {
                Some(msg) => msg,
                None => break "inbound channel closed",
            },
        };
        shared.touch();

        match process_message(&key, message, &mut transcript, &inbound, &deps, &cancel, &shared)
            .await
        {
            StepOutcome::Continue => {}
            StepOutcome::Cancelled => break "cancelled",
            StepOutcome::Fault => break "fault",
        }
    };

    // Best-effort persist so a restart resumes where we stopped.
    shared.set_state(WorkerState::Saving);
    match transcript.save() {
        Ok(blob) => {
            if let Err(e) = deps.store.put(key.as_str(), &blob).await {
                tracing::warn!(%key, error = %e, "final transcript persist failed");
            }
        }
        Err(e) => tracing::warn!(%key, error = %e, "final transcript serialize failed"),
    }

    shared.set_state(WorkerState::Complete);
    tracing::info!(%key, reason = exit_reason, "conversation worker stopped");
}

async fn process_message(
    key: &ChannelKey,
    message: InboundMessage,
    transcript: &mut Transcript,
    inbound: &mpsc::UnboundedReceiver<InboundMessage>,
    deps: &WorkerDeps,
    cancel: &CancellationToken,
    shared: &WorkerShared,
) -> StepOutcome {
    shared.set_state(WorkerState::GeneratingResponse);
    transcript.add_user_message(message.sender, message.text);

    let reply = match transcript
        .generate_multi_step(deps.settings.max_steps, cancel)
        .await
    {
        Ok(reply) => reply,
        Err(GenerateError::Cancelled) => return StepOutcome::Cancelled,
        Err(GenerateError::Backend(e)) => {
            // No reply is the failure mode the room sees; the worker lives on.
            tracing::warn!(%key, error = %e, "generation failed, staying silent");
            None
        }
    };

    if let Some(text) = reply {
        let sent = deps.outbound.send(OutboundReply {
            channel: key.clone(),
            text,
        });
        if sent.is_err() {
            tracing::debug!(%key, "outbound channel closed, dropping reply");
        }
    }

    transcript.clean_buried_tool_turns(deps.settings.buried_tool_depth);

    match compress_if_needed(key, transcript, inbound.is_empty(), deps, cancel, shared).await {
        StepOutcome::Continue => {}
        other => return other,
    }

    shared.set_state(WorkerState::Saving);
    match transcript.save() {
        Ok(blob) => {
            if let Err(e) = deps.store.put(key.as_str(), &blob).await {
                tracing::warn!(%key, error = %e, "transcript persist failed");
            }
            StepOutcome::Continue
        }
        Err(e) => {
            tracing::error!(%key, error = %e, "transcript serialize failed");
            StepOutcome::Fault
        }
    }
}

/// Keep the transcript inside the context budget
///
/// Order of escalation: sweep old tool turns, summarise, and as a last resort
/// clear back to the system prompt.
async fn compress_if_needed(
    key: &ChannelKey,
    transcript: &mut Transcript,
    queue_empty: bool,
    deps: &WorkerDeps,
    cancel: &CancellationToken,
    shared: &WorkerShared,
) -> StepOutcome {
    let settings = &deps.settings;
    let window = f64::from(settings.context_window);
    let usage = f64::from(transcript.estimate_tokens()) / window;

    if usage < settings.summarise_idle_pct {
        return StepOutcome::Continue;
    }

    // Tool scaffolding is the cheapest space to reclaim; try that before
    // paying a backend call for a summary.
    let budget = (window * settings.summarise_idle_pct) as u32;
    transcript.sweep_tool_turns(budget);

    let usage = f64::from(transcript.estimate_tokens()) / window;
    let should_summarise =
        usage >= settings.summarise_always_pct || (usage >= settings.summarise_idle_pct && queue_empty);
    if !should_summarise {
        return StepOutcome::Continue;
    }

    shared.set_state(WorkerState::Summarising);
    tracing::debug!(%key, usage = %format!("{:.0}%", usage * 100.0), "summarising transcript");

    match transcript.summarise(cancel).await {
        Ok(true) => {}
        Ok(false) => tracing::debug!(%key, "summarisation produced nothing, keeping transcript"),
        Err(GenerateError::Cancelled) => return StepOutcome::Cancelled,
        Err(GenerateError::Backend(e)) => {
            tracing::warn!(%key, error = %e, "summarisation failed");
        }
    }

    let after = f64::from(transcript.estimate_tokens()) / window;
    if after >= settings.hard_clear_pct {
        tracing::warn!(%key, usage = %format!("{:.0}%", after * 100.0),
            "context compression failed, clearing transcript");
        transcript.clear_to_system();
    }

    StepOutcome::Continue
}
