//! OpenAI-Compatible Backend
//!
//! [`ChatBackend`] implementation for any server speaking the
//! `/v1/chat/completions` protocol (llama.cpp server, vLLM, Ollama's
//! OpenAI-compatible endpoint, or the hosted API itself).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::traits::{ChatBackend, ChatOutcome};
use crate::config::BackendSettings;
use crate::tools::{ToolCall, ToolSchema};
use crate::transcript::{Turn, TurnRole};

/// Chat backend over an OpenAI-compatible HTTP server
pub struct OpenAiBackend {
    id: String,
    base_url: String,
    model: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl OpenAiBackend {
    /// Create a backend client
    ///
    /// # Panics
    /// Panics if the TLS backend cannot be initialized.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("Failed to create HTTP client"),
        }
    }

    /// Create from resolved configuration
    #[must_use]
    pub fn from_settings(settings: &BackendSettings) -> Self {
        Self::new(
            settings.id.clone(),
            settings.base_url.clone(),
            settings.model.clone(),
            settings.api_key.clone(),
        )
    }

    fn chat_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn models_url(&self) -> String {
        format!("{}/v1/models", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    fn name(&self) -> &str {
        &self.id
    }

    async fn health_check(&self) -> bool {
        let mut request = self
            .http
            .get(self.models_url())
            .timeout(Duration::from_secs(5));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        request
            .send()
            .await
            .map(|response| response.status().is_success())
            .unwrap_or(false)
    }

    async fn chat(&self, turns: &[Turn], tools: &[ToolSchema]) -> anyhow::Result<ChatOutcome> {
        let request = WireRequest {
            model: &self.model,
            messages: wire_messages(turns),
            tools: tools.iter().map(WireTool::function).collect(),
        };

        let mut http_request = self.http.post(self.chat_url()).json(&request);
        if let Some(key) = &self.api_key {
            http_request = http_request.bearer_auth(key);
        }

        let response = http_request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} returned {status}: {body}", self.id);
        }

        let data: WireResponse = response.json().await?;
        outcome_from_response(data)
    }
}

// ============================================================================
// Wire Format
// ============================================================================

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: &'a ToolSchema,
}

impl<'a> WireTool<'a> {
    fn function(schema: &'a ToolSchema) -> Self {
        Self {
            kind: "function",
            function: schema,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireFunction,
}

#[derive(Serialize, Deserialize)]
struct WireFunction {
    name: String,
    /// JSON-encoded argument object, as a string per the protocol
    arguments: String,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireUsage {
    total_tokens: u32,
}

/// Map transcript turns onto the wire message shape
///
/// Sender identity is folded into the content (`name: text`) so the model can
/// tell room participants apart without relying on the optional `name` field.
fn wire_messages(turns: &[Turn]) -> Vec<WireMessage> {
    turns
        .iter()
        .map(|turn| match turn.role {
            TurnRole::System => WireMessage {
                role: "system",
                content: turn.content.clone(),
                name: None,
                tool_calls: None,
            },
            TurnRole::User => WireMessage {
                role: "user",
                content: match &turn.name {
                    Some(name) => format!("{name}: {}", turn.content),
                    None => turn.content.clone(),
                },
                name: None,
                tool_calls: None,
            },
            TurnRole::Assistant => WireMessage {
                role: "assistant",
                content: turn.content.clone(),
                name: None,
                tool_calls: (!turn.tool_calls.is_empty()).then(|| {
                    turn.tool_calls
                        .iter()
                        .map(|call| WireToolCall {
                            id: call.id.clone(),
                            kind: "function".to_string(),
                            function: WireFunction {
                                name: call.name.clone(),
                                arguments: call.arguments.to_string(),
                            },
                        })
                        .collect()
                }),
            },
            TurnRole::Tool => WireMessage {
                role: "tool",
                content: turn.content.clone(),
                name: turn.name.clone(),
                tool_calls: None,
            },
        })
        .collect()
}

fn outcome_from_response(data: WireResponse) -> anyhow::Result<ChatOutcome> {
    let choice = data
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("chat response contained no choices"))?;

    let tool_calls: Vec<ToolCall> = choice
        .message
        .tool_calls
        .into_iter()
        .map(|call| {
            // Malformed argument strings are preserved raw so the tool layer
            // can still report them.
            let arguments = serde_json::from_str(&call.function.arguments)
                .unwrap_or(serde_json::Value::String(call.function.arguments));
            ToolCall {
                id: call.id,
                name: call.function.name,
                arguments,
            }
        })
        .collect();

    let content = choice.message.content.unwrap_or_default();
    let turn = if tool_calls.is_empty() {
        Turn::assistant(content)
    } else {
        Turn::assistant_with_calls(content, tool_calls)
    };

    Ok(ChatOutcome {
        turns: vec![turn],
        total_tokens: data.usage.map(|u| u.total_tokens),
    })
}
