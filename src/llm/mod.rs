// LLM Provider Orchestrator
// Uniform façade over the remote backends plus the tool-calling loop engine

pub mod engine;
pub mod helpers;
pub mod provider;
pub mod registry;
pub mod stream;
pub mod telemetry;

#[cfg(feature = "openai")]
pub mod openai;

#[cfg(feature = "anthropic")]
pub mod anthropic;

#[cfg(feature = "gemini")]
pub mod gemini;

#[cfg(test)]
mod tests;

// Re-export main types
pub use engine::{LoopEngine, Orchestrator, MAX_ITERATIONS};
pub use provider::*;
pub use registry::ProviderRegistry;
