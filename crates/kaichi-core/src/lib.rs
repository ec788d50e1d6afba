//! Core types shared across the Kaichi agent crates.
//!
//! This crate provides the foundational pieces every other Kaichi crate
//! builds on: the unified error enum, the markdown-tolerant JSON parsing
//! utilities, the usage-counted cache used by the agents, the prompt
//! template library, and the [`SkillRetriever`] capability trait that the
//! orchestrator hands to the action agent.
//!
//! # Main types
//!
//! - [`KaichiError`] — Unified error enum for all Kaichi subsystems.
//! - [`KaichiResult`] — Convenience alias for `Result<T, KaichiError>`.
//! - [`UsageCache`] — Bounded map evicting the least-used entry.
//! - [`PromptLibrary`] — Loads `<name>/<role>.txt` templates with
//!   `{{placeholder}}` substitution.
//! - [`SkillRetriever`] — Capability interface for skill lookup.

/// Usage-counted bounded caches.
pub mod cache;
/// Markdown-tolerant JSON extraction and repair.
pub mod json;
/// Prompt template loading and rendering.
pub mod prompts;
/// The skill-retrieval capability seam.
pub mod retriever;

pub use cache::UsageCache;
pub use prompts::PromptLibrary;
pub use retriever::{SkillEntry, SkillRetriever};

/// Top-level error type for the Kaichi agent system.
///
/// Each variant corresponds to a subsystem that can produce errors.
/// Sandbox timeouts and non-zero exits are deliberately *not* represented
/// here; they are data carried in the execution state.
#[derive(Debug, thiserror::Error)]
pub enum KaichiError {
    /// Malformed configuration detected at construction. Fatal.
    #[error("Config error: {0}")]
    Config(String),

    /// The remote model returned an error field or a non-200 response.
    #[error("LLM error: {0}")]
    Llm(String),

    /// An LLM response could not be coerced into the expected structured
    /// form (missing async entry, invalid JSON, missing key).
    #[error("Parse error: {0}")]
    Parse(String),

    /// An error from an outbound HTTP request.
    #[error("HTTP error: {0}")]
    Http(String),

    /// An error raised while persisting or retrieving skills.
    #[error("Skill error: {0}")]
    Skill(String),

    /// An error from the sandboxed runner's own plumbing.
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// An error from the curriculum agent.
    #[error("Curriculum error: {0}")]
    Curriculum(String),

    /// An error from the orchestration loop.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A post-condition check failed (e.g. dataset/local skill mismatch).
    /// Aborts the current rollout.
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`KaichiError`].
pub type KaichiResult<T> = Result<T, KaichiError>;
