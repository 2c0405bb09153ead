//! Shared test fixtures: scripted fake backends, recording tool executors,
//! and pool construction helpers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use crate::backend::{ChatBackend, ChatOutcome};
use crate::pool::{BackendDescriptor, EndpointPool};
use crate::tools::{ToolCall, ToolExecutor, ToolSchema};
use crate::transcript::Turn;

/// Scripted in-memory backend
///
/// Outcomes pushed with [`push_outcome`](Self::push_outcome) are returned in
/// order; once the script runs dry every call yields a plain "ok" reply.
pub(crate) struct FakeBackend {
    name: String,
    healthy: AtomicBool,
    delay: Mutex<Duration>,
    script: Mutex<VecDeque<anyhow::Result<ChatOutcome>>>,
    calls: AtomicUsize,
}

impl FakeBackend {
    pub(crate) fn healthy(name: &str) -> Self {
        Self {
            name: name.to_string(),
            healthy: AtomicBool::new(true),
            delay: Mutex::new(Duration::ZERO),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn unhealthy(name: &str) -> Self {
        let backend = Self::healthy(name);
        backend.healthy.store(false, Ordering::SeqCst);
        backend
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Make every chat call take `delay` before answering, so callers can
    /// race queueing against an in-flight generation
    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub(crate) fn push_outcome(&self, outcome: ChatOutcome) {
        self.script.lock().push_back(Ok(outcome));
    }

    pub(crate) fn push_error(&self, message: &str) {
        self.script
            .lock()
            .push_back(Err(anyhow::anyhow!("{message}")));
    }

    /// Number of chat calls served so far
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn chat(&self, _turns: &[Turn], _tools: &[ToolSchema]) -> anyhow::Result<ChatOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match self.script.lock().pop_front() {
            Some(scripted) => scripted,
            None => Ok(plain_outcome("ok", 42)),
        }
    }
}

/// A plain assistant reply with a reported token total
pub(crate) fn plain_outcome(text: &str, total_tokens: u32) -> ChatOutcome {
    ChatOutcome {
        turns: vec![Turn::assistant(text)],
        total_tokens: Some(total_tokens),
    }
}

/// An assistant turn that requests the given tool calls
pub(crate) fn outcome_with_calls(calls: Vec<ToolCall>) -> ChatOutcome {
    ChatOutcome {
        turns: vec![Turn::assistant_with_calls(String::new(), calls)],
        total_tokens: Some(42),
    }
}

/// Tool executor with nothing registered
pub(crate) struct NoTools;

#[async_trait]
impl ToolExecutor for NoTools {
    fn schemas(&self) -> Vec<ToolSchema> {
        Vec::new()
    }

    async fn execute(&self, call: &ToolCall) -> Turn {
        Turn::tool(call.name.clone(), crate::tools::TOOLS_UNAVAILABLE_PAYLOAD)
    }
}

/// Tool executor that records every call it serves
#[derive(Default)]
pub(crate) struct RecordingTools {
    executed: Mutex<Vec<String>>,
}

impl RecordingTools {
    pub(crate) fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl ToolExecutor for RecordingTools {
    fn schemas(&self) -> Vec<ToolSchema> {
        vec![ToolSchema {
            name: "lookup".to_string(),
            description: "test lookup".to_string(),
            parameters: json!({"type": "object"}),
        }]
    }

    async fn execute(&self, call: &ToolCall) -> Turn {
        self.executed.lock().push(call.name.clone());
        Turn::tool(call.name.clone(), json!({"result": "done"}).to_string())
    }
}

/// Build a pool from `(id, model, slots, backend)` tuples, registered in order
pub(crate) fn make_pool(
    backends: Vec<(&str, &str, usize, Arc<FakeBackend>)>,
) -> Arc<EndpointPool> {
    let mut pool = EndpointPool::new(Duration::from_millis(10));
    for (id, model, slots, backend) in backends {
        pool.register(
            BackendDescriptor {
                id: id.to_string(),
                model: model.to_string(),
                total_slots: slots,
            },
            backend as Arc<dyn ChatBackend>,
        );
    }
    Arc::new(pool)
}
