//! Tool Execution Boundary
//!
//! The model can request tool invocations as part of an assistant turn; this
//! module defines the seam those requests cross. The concurrency core never
//! interprets tool semantics itself — it hands each pending call to a
//! [`ToolExecutor`] and appends whatever result turn comes back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::transcript::Turn;

/// Fixed result payload used when no tool engine is wired in
pub const TOOLS_UNAVAILABLE_PAYLOAD: &str = r#"{"error":"tools unavailable"}"#;

/// A single tool invocation requested by the model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Backend-assigned call ID
    pub id: String,
    /// Tool name
    pub name: String,
    /// Arguments as structured JSON
    pub arguments: serde_json::Value,
}

/// Schema advertised to the backend for one callable tool
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Tool name
    pub name: String,
    /// Human-readable purpose, shown to the model
    pub description: String,
    /// JSON Schema of the accepted arguments
    pub parameters: serde_json::Value,
}

/// Executes tool calls on behalf of a conversation
///
/// Implementations must not panic; a failed invocation is reported as an
/// error payload in the returned turn so the model can see it.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Schemas for every tool this executor can run
    fn schemas(&self) -> Vec<ToolSchema>;

    /// Run one call and produce its result turn
    async fn execute(&self, call: &ToolCall) -> Turn;
}

/// Executor used when the deployment has no tool engine
///
/// Advertises no schemas and resolves any call the model invents anyway to a
/// fixed error payload, so generation keeps moving instead of blocking.
pub struct UnavailableTools;

#[async_trait]
impl ToolExecutor for UnavailableTools {
    fn schemas(&self) -> Vec<ToolSchema> {
        Vec::new()
    }

    async fn execute(&self, call: &ToolCall) -> Turn {
        tracing::warn!(tool = %call.name, "tool call received but no tool engine is available");
        Turn::tool(call.name.clone(), TOOLS_UNAVAILABLE_PAYLOAD)
    }
}
