//! Wire adapters for completion providers.
//!
//! Each adapter implements `steward_core::CompletionModel` over HTTP and maps
//! transport and status failures onto the engine's error taxonomy, so the
//! router's retry and fallback policy applies uniformly regardless of which
//! provider served the request.

pub mod anthropic;
pub mod catalog;
mod http;
pub mod openai;

pub use anthropic::{AnthropicModel, DEFAULT_ANTHROPIC_BASE_URL};
pub use catalog::{build_model, registry_from_config};
pub use openai::{OpenAiModel, DEFAULT_OLLAMA_BASE_URL, DEFAULT_OPENAI_BASE_URL};
