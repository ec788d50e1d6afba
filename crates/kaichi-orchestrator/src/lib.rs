//! The Kaichi orchestration loop.
//!
//! One orchestrator instance owns the curriculum, action, and critic
//! agents, the sandbox, and the skill manager, and drives the closed loop:
//! propose a task, synthesize code, execute it, judge the outcome, and on
//! success distill the program into the skill library before the next
//! rollout begins.

mod engine;
mod metrics;
mod step_log;

pub use engine::{Orchestrator, OrchestratorConfig, RolloutOutcome, StepOutcome};
pub use metrics::{AgentMetrics, LearnReport};
pub use step_log::{write_step_artifacts, StepRecord};
