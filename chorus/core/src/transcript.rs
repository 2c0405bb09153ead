//! Conversation Transcript
//!
//! The ordered, mutable turn list for a single conversation, together with
//! everything needed to keep it inside a bounded context window: generation
//! against a leased backend, stale tool-turn pruning, oldest-first tool
//! sweeping, and whole-transcript summarisation.
//!
//! # Design Philosophy
//!
//! A transcript is owned by exactly one conversation worker and is never
//! shared, so it needs no internal locking. All context-budget mechanics live
//! here; the worker only decides *when* to invoke them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::ChatOutcome;
use crate::pool::EndpointPool;
use crate::tools::{ToolCall, ToolExecutor};

/// Summarisation instruction injected by [`Transcript::summarise`].
const SUMMARY_INSTRUCTION: &str = "Summarise the factual content of this conversation as a \
    bullet-point list. Discard anything obsolete, duplicated, or about the conversation \
    itself. Hard cap: 20 bullets.";

/// Persisted transcript format version.
const SAVE_VERSION: u32 = 1;

// ============================================================================
// Turns
// ============================================================================

/// Unique identifier for a turn
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(pub Uuid);

impl TurnId {
    /// Create a new unique turn ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

/// Who produced a turn
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    /// Deployment-owned system prompt (always turn 0 once initialized)
    System,
    /// A human participant
    User,
    /// The model
    Assistant,
    /// A tool result
    Tool,
}

/// One role-tagged unit in a conversation transcript
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Unique turn ID
    pub id: TurnId,
    /// Who produced this turn
    pub role: TurnRole,
    /// Originating identity (sender name for users, tool name for results)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Turn content
    pub content: String,
    /// Tool invocations requested by an assistant turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// When the turn was created (Unix timestamp ms)
    pub timestamp: i64,
}

impl Turn {
    fn make(role: TurnRole, name: Option<String>, content: impl Into<String>) -> Self {
        Self {
            id: TurnId::new(),
            role,
            name,
            content: content.into(),
            tool_calls: Vec::new(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Create a system turn
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::make(TurnRole::System, None, content)
    }

    /// Create a user turn tagged with the sender identity
    #[must_use]
    pub fn user(name: Option<String>, content: impl Into<String>) -> Self {
        Self::make(TurnRole::User, name, content)
    }

    /// Create a plain assistant turn
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::make(TurnRole::Assistant, None, content)
    }

    /// Create an assistant turn carrying tool-call requests
    #[must_use]
    pub fn assistant_with_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut turn = Self::make(TurnRole::Assistant, None, content);
        turn.tool_calls = tool_calls;
        turn
    }

    /// Create a tool-result turn
    #[must_use]
    pub fn tool(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::make(TurnRole::Tool, Some(name.into()), content)
    }

    /// Whether this turn is part of tool scaffolding (a tool result, or an
    /// assistant turn that requested tool calls)
    #[must_use]
    pub fn is_tool_related(&self) -> bool {
        self.role == TurnRole::Tool || !self.tool_calls.is_empty()
    }

    /// Whether this is a plain assistant reply (no pending tool calls)
    #[must_use]
    pub fn is_final_assistant(&self) -> bool {
        self.role == TurnRole::Assistant && self.tool_calls.is_empty()
    }

    /// Rough token estimate for this turn (~4 chars per token plus framing)
    #[must_use]
    pub fn estimate_tokens(&self) -> u32 {
        let name_len = self.name.as_deref().map_or(0, str::len);
        let calls_len: usize = self
            .tool_calls
            .iter()
            .map(|c| c.name.len() + c.arguments.to_string().len())
            .sum();
        ((self.content.len() + name_len + calls_len) / 4) as u32 + 4
    }
}

// ============================================================================
// Generation Results
// ============================================================================

/// Errors from a generation attempt
#[derive(Debug, Error)]
pub enum GenerateError {
    /// The caller's cancellation fired mid-generation
    #[error("generation cancelled")]
    Cancelled,

    /// The backend call itself failed
    #[error("backend call failed: {0}")]
    Backend(#[source] anyhow::Error),
}

/// Outcome of a single generation attempt
#[derive(Debug)]
pub enum GenerateOutcome {
    /// Turns were appended to the transcript
    Generated {
        /// Text of the final assistant turn, if one was produced
        assistant_text: Option<String>,
    },
    /// No healthy backend had a free slot before the lease timeout.
    /// The transcript was not mutated; the caller may retry.
    NoCapacity,
}

/// Parameters for talking to the backend
#[derive(Clone, Debug)]
pub struct GenerationSettings {
    /// Model name to lease capacity for
    pub model: String,
    /// How long to wait for a slot before giving up
    pub lease_timeout: Duration,
}

// ============================================================================
// Transcript
// ============================================================================

/// Persisted form of a transcript
#[derive(Serialize, Deserialize)]
struct SavedTranscript {
    version: u32,
    saved_at: DateTime<Utc>,
    turns: Vec<Turn>,
}

/// The ordered transcript of one conversation
///
/// Invariant: once initialized, `turns[0]` is the System turn and the list is
/// never empty.
pub struct Transcript {
    turns: Vec<Turn>,
    /// Backend-reported token total and the turn count it covered.
    /// `None` after any structural mutation (clear, sweep, load, prune).
    reported: Option<(u32, usize)>,
    settings: GenerationSettings,
    pool: Arc<EndpointPool>,
    tools: Arc<dyn ToolExecutor>,
}

impl Transcript {
    /// Create a new transcript with the given system prompt
    pub fn new(
        system_prompt: impl Into<String>,
        settings: GenerationSettings,
        pool: Arc<EndpointPool>,
        tools: Arc<dyn ToolExecutor>,
    ) -> Self {
        Self {
            turns: vec![Turn::system(system_prompt)],
            reported: None,
            settings,
            pool,
            tools,
        }
    }

    /// All turns, in order
    #[must_use]
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Number of turns
    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Whether the transcript holds no turns (only before initialization)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// The backend-reported token total, if still valid
    #[must_use]
    pub fn reported_tokens(&self) -> Option<u32> {
        self.reported.map(|(tokens, _)| tokens)
    }

    fn invalidate(&mut self) {
        self.reported = None;
    }

    /// Append a user turn tagged with the sender identity
    ///
    /// The tag keeps multi-participant context distinguishable to the model.
    pub fn add_user_message(&mut self, name: impl Into<String>, content: impl Into<String>) -> TurnId {
        let turn = Turn::user(Some(name.into()), content);
        let id = turn.id;
        self.turns.push(turn);
        id
    }

    /// Insert or replace the System turn at position 0
    pub fn replace_system_prompt(&mut self, prompt: impl Into<String>) {
        match self.turns.first_mut() {
            Some(turn) if turn.role == TurnRole::System => {
                turn.content = prompt.into();
            }
            _ => self.turns.insert(0, Turn::system(prompt)),
        }
    }

    /// Estimated token usage of the whole transcript
    ///
    /// Uses the backend-reported total where valid (plus estimates for turns
    /// added since), falling back to a per-turn heuristic.
    #[must_use]
    pub fn estimate_tokens(&self) -> u32 {
        match self.reported {
            Some((tokens, covered)) => {
                let added: u32 = self.turns[covered.min(self.turns.len())..]
                    .iter()
                    .map(Turn::estimate_tokens)
                    .sum();
                tokens + added
            }
            None => self.turns.iter().map(Turn::estimate_tokens).sum(),
        }
    }

    // ------------------------------------------------------------------
    // Generation
    // ------------------------------------------------------------------

    /// Run one generation against a leased backend
    ///
    /// On success, every returned turn (assistant content, tool-call requests,
    /// tool results) is appended in order and the reported token total is
    /// recorded. If no lease could be obtained the transcript is untouched and
    /// [`GenerateOutcome::NoCapacity`] is returned. The lease is released on
    /// every exit path.
    pub async fn generate(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<GenerateOutcome, GenerateError> {
        let Some(lease) = self
            .pool
            .lease(&self.settings.model, self.settings.lease_timeout, cancel)
            .await
        else {
            if cancel.is_cancelled() {
                return Err(GenerateError::Cancelled);
            }
            tracing::debug!(model = %self.settings.model, "no backend capacity for generation");
            return Ok(GenerateOutcome::NoCapacity);
        };

        let schemas = self.tools.schemas();
        let outcome = tokio::select! {
            () = cancel.cancelled() => return Err(GenerateError::Cancelled),
            result = lease.backend().chat(&self.turns, &schemas) => {
                result.map_err(GenerateError::Backend)?
            }
        };

        let ChatOutcome { turns, total_tokens } = outcome;
        let mut assistant_text = None;

        for turn in turns {
            let pending_calls = turn.tool_calls.clone();
            if turn.is_final_assistant() && !turn.content.is_empty() {
                assistant_text = Some(turn.content.clone());
            }
            self.turns.push(turn);

            for call in &pending_calls {
                let result = self.tools.execute(call).await;
                self.turns.push(result);
            }
        }

        if let Some(total) = total_tokens {
            self.reported = Some((total, self.turns.len()));
        }

        lease.release();
        Ok(GenerateOutcome::Generated { assistant_text })
    }

    /// Generate repeatedly until the most recent turn is a plain assistant
    /// turn or `max_steps` is exhausted
    ///
    /// Bounds an otherwise unbounded tool-call/response ping-pong. Returns the
    /// last assistant text produced, if any.
    pub async fn generate_multi_step(
        &mut self,
        max_steps: u32,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, GenerateError> {
        let mut reply = None;

        for step in 0..max_steps {
            match self.generate(cancel).await? {
                GenerateOutcome::NoCapacity => break,
                GenerateOutcome::Generated { assistant_text } => {
                    if assistant_text.is_some() {
                        reply = assistant_text;
                    }
                }
            }

            if self.turns.last().is_some_and(Turn::is_final_assistant) {
                break;
            }
            tracing::trace!(step = step + 1, "tool calls pending, continuing generation");
        }

        Ok(reply)
    }

    // ------------------------------------------------------------------
    // Compression
    // ------------------------------------------------------------------

    /// Delete tool scaffolding buried more than `depth` non-tool turns back
    /// from the end of the transcript
    ///
    /// Returns the number of turns removed.
    pub fn clean_buried_tool_turns(&mut self, depth: usize) -> usize {
        let mut non_tool_seen = 0usize;
        let mut stale = Vec::new();

        for (idx, turn) in self.turns.iter().enumerate().rev() {
            if turn.is_tool_related() {
                if non_tool_seen > depth {
                    stale.push(idx);
                }
            } else {
                non_tool_seen += 1;
            }
        }

        // Indices were collected in descending order, so removal is safe.
        for &idx in &stale {
            self.turns.remove(idx);
        }
        if !stale.is_empty() {
            self.invalidate();
        }
        stale.len()
    }

    /// Remove Tool turns oldest-first until the estimated token count fits
    /// `token_budget` or no Tool turns remain
    ///
    /// Returns whether the budget was met. Performs no mutation when the
    /// budget is already met.
    pub fn sweep_tool_turns(&mut self, token_budget: u32) -> bool {
        if self.estimate_tokens() <= token_budget {
            return true;
        }

        let mut removed = 0usize;
        while self.estimate_tokens() > token_budget {
            let Some(idx) = self.turns.iter().position(|t| t.role == TurnRole::Tool) else {
                break;
            };
            self.turns.remove(idx);
            self.invalidate();
            removed += 1;
        }

        if removed > 0 {
            tracing::debug!(removed, "swept tool turns to reclaim context budget");
        }
        self.estimate_tokens() <= token_budget
    }

    /// Replace the transcript with a synthesized digest
    ///
    /// Injects a fixed summary instruction, forces one generation, then clears
    /// the transcript back to the System turn with the summary reinserted as
    /// the first User turn. Returns `Ok(false)` (transcript unchanged) when no
    /// summary could be produced.
    pub async fn summarise(&mut self, cancel: &CancellationToken) -> Result<bool, GenerateError> {
        let marker = self.turns.len();
        self.turns.push(Turn::user(None, SUMMARY_INSTRUCTION));

        let outcome = match self.generate(cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.turns.truncate(marker);
                self.invalidate();
                return Err(e);
            }
        };

        let summary = match outcome {
            GenerateOutcome::Generated { assistant_text } => assistant_text,
            GenerateOutcome::NoCapacity => None,
        };

        let Some(summary) = summary else {
            self.turns.truncate(marker);
            self.invalidate();
            return Ok(false);
        };

        self.clear_to_system();
        self.turns.push(Turn::user(None, summary));
        self.invalidate();
        tracing::debug!(turns = self.turns.len(), "transcript summarised");
        Ok(true)
    }

    /// Discard everything except the System turn
    pub fn clear_to_system(&mut self) {
        self.turns
            .retain(|turn| turn.role == TurnRole::System);
        self.turns.truncate(1);
        self.invalidate();
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Serialize the full turn list to JSON
    pub fn save(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&SavedTranscript {
            version: SAVE_VERSION,
            saved_at: Utc::now(),
            turns: self.turns.clone(),
        })
    }

    /// Restore a previously saved turn list
    ///
    /// The current System turn is preserved unless `overwrite_system_prompt`
    /// is set, so a deployed prompt upgrade is not clobbered by old state.
    pub fn load(
        &mut self,
        json: &str,
        overwrite_system_prompt: bool,
    ) -> Result<(), serde_json::Error> {
        let saved: SavedTranscript = serde_json::from_str(json)?;
        let mut turns = saved.turns;

        if !overwrite_system_prompt {
            if let Some(current) = self
                .turns
                .first()
                .filter(|t| t.role == TurnRole::System)
                .cloned()
            {
                match turns.first_mut() {
                    // Carry the deployed prompt text but keep the saved
                    // turn's identity, so an unchanged prompt round-trips
                    // identically.
                    Some(t) if t.role == TurnRole::System => t.content = current.content,
                    _ => turns.insert(0, current),
                }
            }
        }

        self.turns = turns;
        self.invalidate();
        Ok(())
    }
}

impl std::fmt::Debug for Transcript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcript")
            .field("turns", &self.turns.len())
            .field("reported_tokens", &self.reported_tokens())
            .field("model", &self.settings.model)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::test_utils::{
        make_pool, outcome_with_calls, plain_outcome, FakeBackend, NoTools, RecordingTools,
    };

    fn transcript_with(pool: Arc<EndpointPool>) -> Transcript {
        Transcript::new(
            "You are a helpful assistant.",
            GenerationSettings {
                model: "test-model".to_string(),
                lease_timeout: Duration::from_millis(200),
            },
            pool,
            Arc::new(NoTools),
        )
    }

    #[test]
    fn system_turn_is_always_first() {
        let pool = make_pool(vec![]);
        let mut transcript = transcript_with(pool);

        assert_eq!(transcript.turns()[0].role, TurnRole::System);

        transcript.replace_system_prompt("new prompt");
        assert_eq!(transcript.turns()[0].content, "new prompt");
        assert_eq!(transcript.len(), 1);
    }

    #[test]
    fn user_turns_carry_sender_identity() {
        let pool = make_pool(vec![]);
        let mut transcript = transcript_with(pool);

        transcript.add_user_message("alice", "hello");
        transcript.add_user_message("bob", "hi there");

        assert_eq!(transcript.turns()[1].name.as_deref(), Some("alice"));
        assert_eq!(transcript.turns()[2].name.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn generate_appends_turns_and_records_tokens() {
        let backend = Arc::new(FakeBackend::healthy("fake"));
        backend.push_outcome(plain_outcome("hello back", 123));
        let pool = make_pool(vec![("fake", "test-model", 1, backend)]);
        let mut transcript = transcript_with(pool);
        transcript.add_user_message("alice", "hello");

        let cancel = CancellationToken::new();
        let outcome = transcript.generate(&cancel).await.unwrap();

        match outcome {
            GenerateOutcome::Generated { assistant_text } => {
                assert_eq!(assistant_text.as_deref(), Some("hello back"));
            }
            GenerateOutcome::NoCapacity => panic!("expected generation"),
        }
        assert_eq!(transcript.len(), 3);
        assert_eq!(transcript.reported_tokens(), Some(123));
    }

    #[tokio::test]
    async fn generate_without_capacity_leaves_transcript_untouched() {
        let backend = Arc::new(FakeBackend::unhealthy("down"));
        let pool = make_pool(vec![("down", "test-model", 1, backend)]);
        let mut transcript = transcript_with(pool);
        transcript.add_user_message("alice", "hello");
        let before = transcript.turns().to_vec();

        let cancel = CancellationToken::new();
        let outcome = transcript.generate(&cancel).await.unwrap();

        assert!(matches!(outcome, GenerateOutcome::NoCapacity));
        assert_eq!(transcript.turns(), &before[..]);
        assert_eq!(transcript.reported_tokens(), None);
    }

    #[tokio::test]
    async fn multi_step_resolves_tool_calls_then_stops() {
        let backend = Arc::new(FakeBackend::healthy("fake"));
        backend.push_outcome(outcome_with_calls(vec![ToolCall {
            id: "call-1".to_string(),
            name: "lookup".to_string(),
            arguments: json!({"q": "weather"}),
        }]));
        backend.push_outcome(plain_outcome("it is sunny", 80));
        let tools = Arc::new(RecordingTools::default());
        let pool = make_pool(vec![("fake", "test-model", 1, backend.clone())]);
        let mut transcript = Transcript::new(
            "sys",
            GenerationSettings {
                model: "test-model".to_string(),
                lease_timeout: Duration::from_millis(200),
            },
            pool,
            tools.clone(),
        );
        transcript.add_user_message("alice", "what's the weather?");

        let cancel = CancellationToken::new();
        let reply = transcript.generate_multi_step(4, &cancel).await.unwrap();

        assert_eq!(reply.as_deref(), Some("it is sunny"));
        assert_eq!(tools.executed(), vec!["lookup".to_string()]);
        // sys + user + assistant(call) + tool result + assistant(final)
        assert_eq!(transcript.len(), 5);
        assert_eq!(backend.calls(), 2);
        assert!(transcript.turns().last().unwrap().is_final_assistant());
    }

    #[tokio::test]
    async fn multi_step_is_bounded() {
        let backend = Arc::new(FakeBackend::healthy("fake"));
        // Every step requests another tool call; the loop must still stop.
        for i in 0..10 {
            backend.push_outcome(outcome_with_calls(vec![ToolCall {
                id: format!("call-{i}"),
                name: "loop".to_string(),
                arguments: json!({}),
            }]));
        }
        let pool = make_pool(vec![("fake", "test-model", 1, backend.clone())]);
        let mut transcript = transcript_with(pool);
        transcript.add_user_message("alice", "go");

        let cancel = CancellationToken::new();
        transcript.generate_multi_step(3, &cancel).await.unwrap();

        assert_eq!(backend.calls(), 3);
    }

    #[test]
    fn clean_buried_removes_only_deep_tool_scaffolding() {
        let pool = make_pool(vec![]);
        let mut transcript = transcript_with(pool);

        transcript.add_user_message("alice", "one");
        transcript.turns.push(Turn::assistant_with_calls(
            String::new(),
            vec![ToolCall {
                id: "c".to_string(),
                name: "lookup".to_string(),
                arguments: json!({}),
            }],
        ));
        transcript.turns.push(Turn::tool("lookup", "{}"));
        transcript.turns.push(Turn::assistant("answer one"));
        transcript.add_user_message("alice", "two");
        transcript.turns.push(Turn::assistant("answer two"));

        // Depth 4: nothing is buried deep enough yet.
        assert_eq!(transcript.clean_buried_tool_turns(4), 0);

        // Depth 2: the tool pair sits behind user+assistant+user+assistant.
        let removed = transcript.clean_buried_tool_turns(2);
        assert_eq!(removed, 2);
        assert!(transcript.turns().iter().all(|t| !t.is_tool_related()));
    }

    #[test]
    fn sweep_is_idempotent_once_budget_met() {
        let pool = make_pool(vec![]);
        let mut transcript = transcript_with(pool);
        for i in 0..6 {
            transcript
                .turns
                .push(Turn::tool("lookup", format!("result {i} {}", "x".repeat(200))));
        }
        transcript.turns.push(Turn::assistant("done"));

        let budget = 120;
        assert!(transcript.sweep_tool_turns(budget));
        let after_first = transcript.turns().to_vec();

        // Second call with the same budget must not mutate.
        assert!(transcript.sweep_tool_turns(budget));
        assert_eq!(transcript.turns(), &after_first[..]);
    }

    #[test]
    fn sweep_stops_when_no_tool_turns_remain() {
        let pool = make_pool(vec![]);
        let mut transcript = transcript_with(pool);
        transcript.add_user_message("alice", "x".repeat(4000));

        // Budget cannot be met, but there is nothing sweepable.
        assert!(!transcript.sweep_tool_turns(10));
        assert_eq!(transcript.len(), 2);
    }

    #[tokio::test]
    async fn summarise_collapses_to_system_plus_summary() {
        let backend = Arc::new(FakeBackend::healthy("fake"));
        backend.push_outcome(plain_outcome("reply", 50));
        backend.push_outcome(plain_outcome("- fact one\n- fact two", 30));
        let pool = make_pool(vec![("fake", "test-model", 2, backend)]);
        let mut transcript = transcript_with(pool);
        let cancel = CancellationToken::new();

        transcript.add_user_message("alice", "hello");
        transcript.generate(&cancel).await.unwrap();
        assert!(transcript.reported_tokens().is_some());

        assert!(transcript.summarise(&cancel).await.unwrap());

        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.turns()[0].role, TurnRole::System);
        assert_eq!(transcript.turns()[1].role, TurnRole::User);
        assert_eq!(transcript.turns()[1].content, "- fact one\n- fact two");
        // Reported total is unknown until the next generation.
        assert_eq!(transcript.reported_tokens(), None);
    }

    #[tokio::test]
    async fn failed_summarise_restores_transcript() {
        let backend = Arc::new(FakeBackend::unhealthy("down"));
        let pool = make_pool(vec![("down", "test-model", 1, backend)]);
        let mut transcript = transcript_with(pool);
        transcript.add_user_message("alice", "hello");
        let before = transcript.turns().to_vec();

        let cancel = CancellationToken::new();
        assert!(!transcript.summarise(&cancel).await.unwrap());
        assert_eq!(transcript.turns(), &before[..]);
    }

    #[test]
    fn save_load_round_trips() {
        let pool = make_pool(vec![]);
        let mut transcript = transcript_with(pool.clone());
        transcript.add_user_message("alice", "first");
        transcript.turns.push(Turn::assistant("reply"));
        let saved = transcript.save().unwrap();

        let mut restored = transcript_with(pool);
        restored.load(&saved, false).unwrap();

        assert_eq!(restored.turns(), transcript.turns());
    }

    #[test]
    fn load_preserves_current_system_prompt_by_default() {
        let pool = make_pool(vec![]);
        let mut old = transcript_with(pool.clone());
        old.replace_system_prompt("old deployed prompt");
        old.add_user_message("alice", "hello");
        let saved = old.save().unwrap();

        let mut fresh = transcript_with(pool);
        fresh.replace_system_prompt("upgraded prompt");
        fresh.load(&saved, false).unwrap();
        assert_eq!(fresh.turns()[0].content, "upgraded prompt");
        // Only the prompt text changes; the saved turn keeps its identity.
        assert_eq!(fresh.turns()[0].id, old.turns()[0].id);

        let pool2 = make_pool(vec![]);
        let mut overwritten = transcript_with(pool2);
        overwritten.replace_system_prompt("upgraded prompt");
        overwritten.load(&saved, true).unwrap();
        assert_eq!(overwritten.turns()[0].content, "old deployed prompt");
    }

    #[test]
    fn estimate_falls_back_after_structural_mutation() {
        let pool = make_pool(vec![]);
        let mut transcript = transcript_with(pool);
        transcript.add_user_message("alice", "hello world");
        transcript.reported = Some((500, transcript.len()));
        assert_eq!(transcript.estimate_tokens(), 500);

        // New turns are estimated on top of the reported total.
        transcript.add_user_message("bob", "more text");
        assert!(transcript.estimate_tokens() > 500);

        transcript.clear_to_system();
        assert!(transcript.estimate_tokens() < 500);
        assert_eq!(transcript.reported_tokens(), None);
    }
}
