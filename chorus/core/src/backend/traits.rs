//! Chat Backend Trait
//!
//! The abstraction every LLM backend implements. The pool and transcripts
//! only ever see this trait, so swapping or faking a backend touches nothing
//! else.

use async_trait::async_trait;

use crate::tools::ToolSchema;
use crate::transcript::Turn;

/// Result of one chat completion call
#[derive(Debug)]
pub struct ChatOutcome {
    /// Turns produced by the model, in order (assistant content and any
    /// tool-call requests; tool results are appended by the caller)
    pub turns: Vec<Turn>,
    /// Backend-reported total token count for the whole context, if given
    pub total_tokens: Option<u32>,
}

/// Abstract LLM chat backend
///
/// Implementations must be `Send + Sync` for sharing across conversation
/// workers.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &str;

    /// Cheap liveness probe; the caller applies its own timeout
    async fn health_check(&self) -> bool;

    /// Run one chat completion over the full turn list
    async fn chat(&self, turns: &[Turn], tools: &[ToolSchema]) -> anyhow::Result<ChatOutcome>;
}
