//! Boundary to the external text-generation engine.

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Failures the engine may report. Both are treated as a failure of the single
/// advisor that made the call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("text engine unavailable: {0}")]
    Unavailable(String),
    #[error("text engine timed out")]
    Timeout,
}

#[async_trait]
pub trait TextEngine: Send + Sync {
    async fn generate(&self, prompt: &str, context: &str) -> Result<String, EngineError>;
}

/// Deterministic engine used by the CLI and tests when no real model is wired in.
///
/// Output is the first context line (the advisor's framing) followed by the
/// prompt, so proposals differ per advisor while staying reproducible.
#[derive(Debug, Default, Clone)]
pub struct EchoEngine;

impl EchoEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TextEngine for EchoEngine {
    async fn generate(&self, prompt: &str, context: &str) -> Result<String, EngineError> {
        let heading = context.lines().next().unwrap_or("").trim();
        debug!(prompt_len = prompt.len(), "echo engine generating");
        if heading.is_empty() {
            Ok(format!("Echo: {}", prompt))
        } else {
            Ok(format!("{}\nEcho: {}", heading, prompt))
        }
    }
}
