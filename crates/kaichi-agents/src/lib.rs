//! The three Kaichi agents: curriculum (what to learn next), action
//! (turn a task into an executable program), and critic (did it work).
//!
//! Agents never depend on one another; everything they need from the
//! outside — the LLM, the project snapshot, the skill library — is
//! injected by the orchestrator at construction.

/// Program synthesis and entry-point rewriting.
pub mod action;
/// Python syntax utilities for generated programs.
pub mod ast;
/// Verdicts on executed code.
pub mod critic;
/// Task proposal and context assembly.
pub mod curriculum;

pub use action::{ActionAgent, ActionConfig, BaseSkill, BaseSkills, GeneratedProgram, SynthesisRequest};
pub use critic::{CriticAgent, CriticConfig, Critique};
pub use curriculum::{CurriculumAgent, CurriculumConfig, QaPair, TaskProgress};

use kaichi_core::KaichiError;
use serde::{Deserialize, Serialize};

/// Whether an agent consults the model or a human.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    #[default]
    Auto,
    Manual,
}

impl std::str::FromStr for AgentMode {
    type Err = KaichiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "manual" => Ok(Self::Manual),
            other => Err(KaichiError::Config(format!("Unknown mode: {other}"))),
        }
    }
}
