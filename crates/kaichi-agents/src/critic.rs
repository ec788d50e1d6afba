use chrono::{DateTime, Utc};
use kaichi_core::json::fix_and_parse_json;
use kaichi_core::{KaichiError, KaichiResult, PromptLibrary, UsageCache};
use kaichi_llm::{CompletionRequest, TextCompletion};
use kaichi_sandbox::ExecutionState;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use crate::AgentMode;

/// Settings for the critic agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticConfig {
    pub ckpt_dir: PathBuf,
    #[serde(default)]
    pub mode: AgentMode,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default)]
    pub resume: bool,
}

fn default_max_retries() -> usize {
    5
}

fn default_cache_size() -> usize {
    100
}

impl CriticConfig {
    pub fn validate(&self) -> KaichiResult<()> {
        if self.max_retries == 0 {
            return Err(KaichiError::Config("Invalid max retries: 0".to_string()));
        }
        if self.cache_size == 0 {
            return Err(KaichiError::Config("Invalid cache size: 0".to_string()));
        }
        Ok(())
    }
}

/// A cached verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Critique {
    pub success: bool,
    pub critique: String,
    pub timestamp: DateTime<Utc>,
}

/// Decides whether executed code satisfied its task.
///
/// Verdicts are cached by `(task, code)` — the execution state does not
/// participate in the key — and the cache is persisted under
/// `<ckpt>/critic/cache/critic_cache.json`.
pub struct CriticAgent {
    config: CriticConfig,
    llm: Arc<dyn TextCompletion>,
    prompts: PromptLibrary,
    cache: Mutex<UsageCache<Critique>>,
}

impl CriticAgent {
    pub fn new(
        config: CriticConfig,
        llm: Arc<dyn TextCompletion>,
        prompts: PromptLibrary,
    ) -> KaichiResult<Self> {
        config.validate()?;
        fs::create_dir_all(config.ckpt_dir.join("critic/cache"))?;

        let mut cache = UsageCache::new(config.cache_size);
        if config.resume {
            match Self::load_cache(&config) {
                Ok(entries) => {
                    info!(count = entries.len(), "Loaded critic cache");
                    for (key, critique) in entries {
                        cache.add(key, critique);
                    }
                }
                Err(e) => warn!(error = %e, "Failed to load critic cache"),
            }
        }

        Ok(Self {
            config,
            llm,
            prompts,
            cache: Mutex::new(cache),
        })
    }

    /// Judge `(task, code, state)`. Returns `(success, critique)`.
    ///
    /// LLM and parse failures are retried; once the budget is exhausted
    /// the failure is reported as an unsuccessful verdict rather than an
    /// error, so a flaky judge never aborts a rollout.
    pub async fn check_task_success(
        &self,
        task: &str,
        context: &str,
        code: &str,
        state: &ExecutionState,
        max_retries: Option<usize>,
    ) -> KaichiResult<(bool, String)> {
        let key = cache_key(task, code);
        if let Some(hit) = self.lock_cache().get(&key) {
            info!(task = %task, "Using cached critic verdict");
            return Ok((hit.success, hit.critique.clone()));
        }

        if self.config.mode == AgentMode::Manual {
            return self.human_check(task, context, code);
        }

        let system = self.prompts.load("critic/system")?;
        let human = self.render_human_message(task, context, code, state);

        let retries = max_retries.unwrap_or(self.config.max_retries);
        let mut last_error = String::new();
        for attempt in 1..=retries {
            let verdict = async {
                let reply = self
                    .llm
                    .complete(
                        CompletionRequest::new(human.clone(), "CriticAgent")
                            .with_system(system.clone()),
                    )
                    .await?;
                let value = fix_and_parse_json(&reply.answer)?;
                let success = value
                    .get("success")
                    .and_then(serde_json::Value::as_bool)
                    .ok_or_else(|| {
                        KaichiError::Parse("Critic answer lacks a success flag".to_string())
                    })?;
                let critique = value
                    .get("critique")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok::<_, KaichiError>((success, critique))
            }
            .await;

            match verdict {
                Ok((success, critique)) => {
                    let entry = Critique {
                        success,
                        critique: critique.clone(),
                        timestamp: Utc::now(),
                    };
                    {
                        let mut cache = self.lock_cache();
                        cache.add(key.clone(), entry);
                        if let Err(e) = self.persist_cache(&cache) {
                            warn!(error = %e, "Failed to persist critic cache");
                        }
                    }
                    return Ok((success, critique));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Critic attempt failed");
                    last_error = e.to_string();
                }
            }
        }

        Ok((false, last_error))
    }

    /// Auxiliary quality analysis, independent of execution.
    pub async fn check_code_quality(
        &self,
        code: &str,
        requirements: Option<&str>,
    ) -> KaichiResult<serde_json::Value> {
        let system = self.prompts.render(
            "critic/code",
            &[("code", code), ("requirements", requirements.unwrap_or(""))],
        )?;
        let reply = self
            .llm
            .complete(CompletionRequest::new("Evaluate code quality", "CriticAgent").with_system(system))
            .await?;
        let mut value = fix_and_parse_json(&reply.answer)?;
        if let Some(object) = value.as_object_mut() {
            object.insert(
                "timestamp".to_string(),
                serde_json::json!(Utc::now().to_rfc3339()),
            );
        }
        Ok(value)
    }

    fn render_human_message(
        &self,
        task: &str,
        context: &str,
        code: &str,
        state: &ExecutionState,
    ) -> String {
        format!(
            "Task: {task}\n\nContext: {context}\n\nCode:\n{code}\n\n\
             Execution output:\n{}\n\nExecution error:\n{}\n\nReturn code: {}",
            state.output, state.error, state.return_code
        )
    }

    fn human_check(&self, task: &str, context: &str, code: &str) -> KaichiResult<(bool, String)> {
        let mut stdout = std::io::stdout();
        writeln!(stdout, "\nTask Review:")?;
        writeln!(stdout, "Task: {task}")?;
        writeln!(stdout, "Context: {context}")?;
        writeln!(stdout, "Code:\n{code}")?;
        write!(stdout, "\nIs the implementation successful? (y/n): ")?;
        stdout.flush()?;

        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        let success = answer.trim().eq_ignore_ascii_case("y");

        write!(stdout, "Enter critique (leave empty if none): ")?;
        stdout.flush()?;
        let mut critique = String::new();
        std::io::stdin().read_line(&mut critique)?;

        Ok((success, critique.trim().to_string()))
    }

    fn lock_cache(&self) -> MutexGuard<'_, UsageCache<Critique>> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn cache_path(config: &CriticConfig) -> PathBuf {
        config.ckpt_dir.join("critic/cache/critic_cache.json")
    }

    fn load_cache(config: &CriticConfig) -> KaichiResult<BTreeMap<String, Critique>> {
        let path = Self::cache_path(config);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    fn persist_cache(&self, cache: &UsageCache<Critique>) -> KaichiResult<()> {
        let entries: BTreeMap<&String, &Critique> = cache.iter().collect();
        let path = Self::cache_path(&self.config);
        fs::write(path, serde_json::to_string_pretty(&entries)?)?;
        Ok(())
    }
}

fn cache_key(task: &str, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task.as_bytes());
    hasher.update([0]);
    hasher.update(code.as_bytes());
    format!("{:x}", hasher.finalize())
}
