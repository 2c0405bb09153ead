//! chorus-core — Conversation Concurrency Core
//!
//! A small fleet of LLM backends serves many simultaneous chat-room
//! conversations. This crate provides the two layers that make that safe:
//! slot-based admission control over the backends, and strictly ordered
//! per-conversation processing loops that keep each transcript inside its
//! context window.
//!
//! # Architecture
//!
//! ```text
//!  inbound messages                        outbound replies
//!        │                                        ▲
//!        ▼                                        │
//!  ┌──────────────────┐   one task per key  ┌────┴───────────────┐
//!  │ ConversationRegistry ├────────────────▶│ ConversationWorker │
//!  └──────────────────┘                     │  (Transcript)      │
//!                                           └────┬───────────────┘
//!                                                │ lease / release
//!                                                ▼
//!                                        ┌──────────────┐
//!                                        │ EndpointPool │──▶ ChatBackend(s)
//!                                        └──────────────┘
//! ```
//!
//! Concurrency exists *across* conversations; within one conversation every
//! message is processed to completion before the next, so replies never
//! interleave out of order. Backend saturation surfaces as waiting (and
//! ultimately silence), never as an error.

pub mod backend;
pub mod config;
pub mod pool;
pub mod registry;
pub mod responders;
pub mod store;
pub mod tools;
pub mod transcript;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_utils;

pub use backend::{ChatBackend, ChatOutcome, OpenAiBackend};
pub use config::{BackendSettings, ChorusConfig, ConfigError};
pub use pool::{BackendDescriptor, EndpointPool, Lease, SlotSnapshot};
pub use registry::{ConversationRegistry, RegistrySettings};
pub use responders::{ResponderAction, ResponderTable};
pub use store::{FileStore, MemoryStore, StoreError, TranscriptStore};
pub use tools::{ToolCall, ToolExecutor, ToolSchema, UnavailableTools};
pub use transcript::{
    GenerateError, GenerateOutcome, GenerationSettings, Transcript, Turn, TurnId, TurnRole,
};
pub use worker::{
    ChannelKey, ConversationWorker, InboundMessage, OutboundReply, WorkerDeps, WorkerSettings,
    WorkerState,
};
