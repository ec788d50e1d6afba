use crate::metrics::{AgentMetrics, LearnReport};
use crate::step_log::{write_step_artifacts, StepRecord};
use chrono::Utc;
use kaichi_agents::{ActionAgent, CriticAgent, CurriculumAgent, GeneratedProgram, SynthesisRequest};
use kaichi_core::{KaichiError, KaichiResult};
use kaichi_sandbox::{ExecutionState, SandboxRunner};
use kaichi_skills::SkillManager;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Settings for the orchestration loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub ckpt_dir: PathBuf,
    /// Iteration cap per rollout.
    #[serde(default = "default_max_retries")]
    pub max_retries: u64,
    /// Pause after a failed loop iteration, in seconds.
    #[serde(default = "default_backoff")]
    pub backoff_secs: u64,
}

fn default_max_retries() -> u64 {
    5
}

fn default_backoff() -> u64 {
    3
}

impl OrchestratorConfig {
    pub fn validate(&self) -> KaichiResult<()> {
        if self.max_retries == 0 {
            return Err(KaichiError::Config("Invalid max retries: 0".to_string()));
        }
        Ok(())
    }
}

/// The outcome of one step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub success: bool,
    pub done: bool,
    pub program: GeneratedProgram,
    pub state: ExecutionState,
    pub critique: String,
}

/// The outcome of one rollout.
#[derive(Debug, Clone)]
pub struct RolloutOutcome {
    pub success: bool,
    pub iterations: u64,
    pub program: Option<GeneratedProgram>,
}

struct RolloutState {
    task: String,
    context: String,
    skills: Vec<String>,
    previous_code: String,
    critique: String,
    exec_state: Option<ExecutionState>,
    iteration: u64,
    artifact_dir: PathBuf,
}

/// Drives the reset → step* loop end-to-end: synthesis, sandboxed
/// execution, critique, artifact logging, and skill promotion.
///
/// The orchestrator owns every agent by construction; between rollouts the
/// skill library is updated strictly before the next rollout begins, so
/// later retrievals always see prior successes.
pub struct Orchestrator {
    config: OrchestratorConfig,
    curriculum: CurriculumAgent,
    action: ActionAgent,
    critic: CriticAgent,
    skills: Arc<SkillManager>,
    sandbox: SandboxRunner,
    metrics: AgentMetrics,
    rollout_state: Option<RolloutState>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        curriculum: CurriculumAgent,
        action: ActionAgent,
        critic: CriticAgent,
        skills: Arc<SkillManager>,
        sandbox: SandboxRunner,
    ) -> KaichiResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            curriculum,
            action,
            critic,
            skills,
            sandbox,
            metrics: AgentMetrics::new(),
            rollout_state: None,
        })
    }

    /// Begin a rollout: zero the per-task metrics, reset the sandbox,
    /// allocate the artifact directory, and retrieve relevant skills.
    pub async fn reset(&mut self, task: &str, context: &str) -> KaichiResult<()> {
        info!(task = %task, "Resetting for task");
        self.metrics.reset();
        self.sandbox.reset()?;

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let artifact_dir = self.config.ckpt_dir.join("step_logs").join(stamp.to_string());
        std::fs::create_dir_all(&artifact_dir)?;

        let skills = match self.skills.retrieve_skills(task).await {
            Ok(skills) => skills,
            Err(e) => {
                warn!(error = %e, "Skill retrieval failed; continuing without skills");
                Vec::new()
            }
        };

        self.rollout_state = Some(RolloutState {
            task: task.to_string(),
            context: context.to_string(),
            skills,
            previous_code: String::new(),
            critique: String::new(),
            exec_state: None,
            iteration: 0,
            artifact_dir,
        });
        Ok(())
    }

    /// One iteration: generate → execute → validate → log → update.
    pub async fn step(&mut self) -> KaichiResult<StepOutcome> {
        let started = Instant::now();

        let request = {
            let state = self.require_state()?;
            SynthesisRequest {
                task: state.task.clone(),
                context: state.context.clone(),
                skills: state.skills.clone(),
                previous_code: state.previous_code.clone(),
                critique: state.critique.clone(),
                state: state.exec_state.clone(),
            }
        };

        let program = self.action.synthesize(&request).await?;
        let script = executable_script(&program);

        let (exec_state, _reward) = self.sandbox.step(&script).await;

        let (success, critique) = self
            .critic
            .check_task_success(
                &request.task,
                &request.context,
                &program.program_code,
                &exec_state,
                None,
            )
            .await?;

        if success {
            self.action.record_success(&request, &program);
        }

        let response_time = started.elapsed().as_secs_f64();
        self.metrics
            .update(success, response_time, program.program_code.len() as u64);

        let (done, iteration) = {
            let state = self.require_state_mut()?;
            state.iteration += 1;
            let iteration = state.iteration;

            let record = StepRecord {
                task: &state.task,
                program_name: &program.program_name,
                exec_code: &program.exec_code,
                state: &exec_state,
                success,
                critique: &critique,
            };
            if let Err(e) = write_step_artifacts(&state.artifact_dir, iteration, &script, &record)
            {
                warn!(error = %e, "Failed to write step artifacts");
            }

            state.previous_code = program.program_code.clone();
            state.critique = critique.clone();
            state.exec_state = Some(exec_state.clone());

            (success || iteration >= self.config.max_retries, iteration)
        };

        info!(iteration, success, done, "Step finished");
        Ok(StepOutcome {
            success,
            done,
            program,
            state: exec_state,
            critique,
        })
    }

    /// Reset, then step until success or the iteration cap.
    pub async fn rollout(&mut self, task: &str, context: &str) -> KaichiResult<RolloutOutcome> {
        info!(task = %task, "Starting rollout");
        self.reset(task, context).await?;

        loop {
            let outcome = self.step().await?;
            if outcome.done {
                let iterations = self.require_state()?.iteration;
                info!(task = %task, success = outcome.success, iterations, "Rollout finished");
                return Ok(RolloutOutcome {
                    success: outcome.success,
                    iterations,
                    program: Some(outcome.program),
                });
            }
        }
    }

    /// The learning loop: obtain a task, run a rollout, promote successes
    /// into the skill library, record progress. Failures of any agent are
    /// logged and the loop continues after a short back-off.
    pub async fn learn(
        &mut self,
        fixed_task: Option<String>,
        maxloop: usize,
    ) -> KaichiResult<LearnReport> {
        let mut loops = 0u64;
        let mut successes = 0u64;
        let mut total_steps = 0u64;
        let mut response_time_sum = 0.0f64;

        for loop_index in 1..=maxloop {
            let result = self.learn_once(fixed_task.as_deref(), loop_index, maxloop).await;
            loops += 1;

            match result {
                Ok(outcome) => {
                    if outcome.success {
                        successes += 1;
                    }
                    total_steps += self.metrics.steps;
                    response_time_sum += self.metrics.avg_response_time * self.metrics.steps as f64;
                }
                Err(e) => {
                    error!(error = %e, "Error in learn loop");
                    tokio::time::sleep(Duration::from_secs(self.config.backoff_secs)).await;
                }
            }
        }

        info!(loops, successes, "Learn loop completed");
        Ok(LearnReport {
            success_rate: if loops == 0 {
                0.0
            } else {
                successes as f64 / loops as f64
            },
            total_steps,
            avg_response_time: if total_steps == 0 {
                0.0
            } else {
                response_time_sum / total_steps as f64
            },
        })
    }

    async fn learn_once(
        &mut self,
        fixed_task: Option<&str>,
        loop_index: usize,
        maxloop: usize,
    ) -> KaichiResult<RolloutOutcome> {
        let (task, context) = match fixed_task {
            Some(task) => {
                let context = self.curriculum.get_task_context(task).await?;
                (task.to_string(), context)
            }
            None => self.curriculum.propose_next_task().await?,
        };

        info!(task = %task, loop_index, maxloop, "Executing task");
        let outcome = self.rollout(&task, &context).await?;

        if outcome.success {
            if let Some(program) = &outcome.program {
                self.skills
                    .add_new_skill(&program.program_name, &program.program_code)
                    .await?;
            }
        }
        self.curriculum
            .update_exploration_progress(&task, outcome.success)?;

        Ok(outcome)
    }

    /// Tear down the sandbox working directory.
    pub fn close(&mut self) {
        self.sandbox.close();
    }

    /// Per-task metrics of the rollout in flight (or the last one).
    pub fn metrics(&self) -> &AgentMetrics {
        &self.metrics
    }

    fn require_state(&self) -> KaichiResult<&RolloutState> {
        self.rollout_state
            .as_ref()
            .ok_or_else(|| KaichiError::Orchestrator("No rollout in flight".to_string()))
    }

    fn require_state_mut(&mut self) -> KaichiResult<&mut RolloutState> {
        self.rollout_state
            .as_mut()
            .ok_or_else(|| KaichiError::Orchestrator("No rollout in flight".to_string()))
    }
}

/// Turn a generated program into a runnable script: the program text plus
/// a trailer that drives its async entry.
fn executable_script(program: &GeneratedProgram) -> String {
    format!(
        "{}\n\nimport asyncio\nasyncio.run({}())\n",
        program.program_code, program.program_name
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executable_script_drives_entry() {
        let program = GeneratedProgram {
            program_code: "async def fetch_value():\n    return 1".to_string(),
            program_name: "fetch_value".to_string(),
            exec_code: "await fetch_value()".to_string(),
        };
        let script = executable_script(&program);
        assert!(script.starts_with("async def fetch_value"));
        assert!(script.ends_with("asyncio.run(fetch_value())\n"));
    }
}
