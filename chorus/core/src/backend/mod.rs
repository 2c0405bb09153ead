//! LLM Backend Abstraction
//!
//! Trait-based backends so the concurrency core stays transport-agnostic.

mod openai;
mod traits;

pub use openai::OpenAiBackend;
pub use traits::{ChatBackend, ChatOutcome};
