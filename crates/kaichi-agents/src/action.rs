use crate::ast;
use kaichi_core::{
    KaichiError, KaichiResult, PromptLibrary, SkillEntry, SkillRetriever, UsageCache,
};
use kaichi_llm::{CompletionRequest, TextCompletion};
use kaichi_sandbox::ExecutionState;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

static RENAME_ANSWER: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"new_function_name:\s*([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});

/// Settings for the action agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// Model override for the tightly-scoped rename call.
    #[serde(default)]
    pub rewrite_model: Option<String>,
}

fn default_max_retries() -> usize {
    5
}

fn default_cache_size() -> usize {
    100
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            cache_size: default_cache_size(),
            rewrite_model: None,
        }
    }
}

impl ActionConfig {
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

/// Helper snippets the model may call without them appearing in the skill
/// library. Injectable so tests can substitute a virtual filesystem.
#[derive(Debug, Clone)]
pub struct BaseSkills {
    pub snippets: Vec<BaseSkill>,
}

#[derive(Debug, Clone)]
pub struct BaseSkill {
    pub name: String,
    pub code: String,
}

impl Default for BaseSkills {
    fn default() -> Self {
        Self {
            snippets: vec![
                BaseSkill {
                    name: "read_file".to_string(),
                    code: "def read_file(path):\n    with open(path, \"r\", encoding=\"utf-8\") as f:\n        return f.read()\n".to_string(),
                },
                BaseSkill {
                    name: "write_file".to_string(),
                    code: "def write_file(path, content):\n    with open(path, \"w\", encoding=\"utf-8\") as f:\n        f.write(content)\n".to_string(),
                },
            ],
        }
    }
}

/// An executable program produced from an LLM answer. `program_name` is
/// the async entry defined in `program_code`; `exec_code` awaits it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedProgram {
    pub program_code: String,
    pub program_name: String,
    pub exec_code: String,
}

/// Everything the action agent conditions one synthesis attempt on.
#[derive(Debug, Clone, Default)]
pub struct SynthesisRequest {
    pub task: String,
    pub context: String,
    pub skills: Vec<String>,
    pub previous_code: String,
    pub critique: String,
    pub state: Option<ExecutionState>,
}

/// Turns (skills, task, context, previous code, critique) into an
/// executable program via the LLM, rewriting the entry point to a
/// descriptive name before execution.
pub struct ActionAgent {
    config: ActionConfig,
    llm: Arc<dyn TextCompletion>,
    retriever: Arc<dyn SkillRetriever>,
    prompts: PromptLibrary,
    base_skills: BaseSkills,
    cache: Mutex<UsageCache<GeneratedProgram>>,
}

impl ActionAgent {
    pub fn new(
        config: ActionConfig,
        llm: Arc<dyn TextCompletion>,
        retriever: Arc<dyn SkillRetriever>,
        prompts: PromptLibrary,
    ) -> KaichiResult<Self> {
        config.validate()?;
        let cache = Mutex::new(UsageCache::new(config.cache_size));
        Ok(Self {
            config,
            llm,
            retriever,
            prompts,
            base_skills: BaseSkills::default(),
            cache,
        })
    }

    /// Substitute the base skill snippets (tests inject a virtual
    /// filesystem here).
    pub fn with_base_skills(mut self, base_skills: BaseSkills) -> Self {
        self.base_skills = base_skills;
        self
    }

    /// Render the system prompt. The base skill helpers always prefix the
    /// template; retrieved skills fill the `{{skills}}` placeholder.
    pub fn render_system_message(&self, skills: &[String]) -> KaichiResult<String> {
        let base = self
            .base_skills
            .snippets
            .iter()
            .map(|s| s.code.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let rendered = self
            .prompts
            .render("action/system", &[("skills", &skills.join("\n\n"))])?;
        Ok(format!("{base}\n\n{rendered}"))
    }

    /// Render the human message for one attempt.
    pub fn render_human_message(&self, request: &SynthesisRequest) -> String {
        let mut sections = vec![
            format!("Task: {}", request.task),
            format!("Context: {}", request.context),
        ];
        if !request.previous_code.is_empty() {
            sections.push(format!("Previous code:\n{}", request.previous_code));
        }
        if !request.critique.is_empty() {
            sections.push(format!("Critique: {}", request.critique));
        }
        if let Some(state) = &request.state {
            sections.push(format!(
                "Execution output:\n{}\nExecution error:\n{}\nReturn code: {}",
                state.output, state.error, state.return_code
            ));
        }
        sections.join("\n\n")
    }

    /// One full synthesis: prompt assembly, LLM call, parse, entry
    /// rewrite. Retries internally up to `max_retries` and raises the last
    /// error once exhausted.
    pub async fn synthesize(&self, request: &SynthesisRequest) -> KaichiResult<GeneratedProgram> {
        let key = cache_key(request);
        if request.previous_code.is_empty() {
            if let Some(hit) = lock(&self.cache).get(&key) {
                info!(task = %request.task, "Reusing cached program");
                return Ok(hit.clone());
            }
        }

        let system = self.render_system_message(&request.skills)?;
        let human = self.render_human_message(request);

        let mut last_error = KaichiError::Llm("No synthesis attempt made".to_string());
        for attempt in 1..=self.config.max_retries {
            debug!(attempt, task = %request.task, "Synthesizing program");
            let result = async {
                let reply = self
                    .llm
                    .complete(
                        CompletionRequest::new(human.clone(), "ActionAgent")
                            .with_system(system.clone()),
                    )
                    .await?;
                self.process_ai_message(&reply.answer).await
            }
            .await;

            match result {
                Ok(program) => return Ok(program),
                Err(e @ (KaichiError::Llm(_) | KaichiError::Parse(_) | KaichiError::Http(_))) => {
                    warn!(attempt, error = %e, "Synthesis attempt failed");
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    /// Parse an LLM answer into an executable program: join the fenced
    /// blocks, find the last async function, have the model rename it,
    /// and rewrite every occurrence.
    pub async fn process_ai_message(&self, message: &str) -> KaichiResult<GeneratedProgram> {
        let blocks = ast::extract_code_blocks(message);
        if blocks.is_empty() {
            return Err(KaichiError::Parse(
                "Model answer contains no fenced code block".to_string(),
            ));
        }
        let code = blocks.join("\n\n");

        let functions = ast::parse_functions(&code)?;
        let entry = ast::last_async_function(&functions).ok_or_else(|| {
            KaichiError::Parse("Generated program has no async function".to_string())
        })?;
        let old_name = entry.name.clone();

        let new_name = self.request_entry_name(&code, &old_name).await?;
        let program_code = if new_name == old_name {
            code
        } else {
            ast::rename_identifier(&code, &old_name, &new_name)?
        };

        Ok(GeneratedProgram {
            program_code,
            program_name: new_name.clone(),
            exec_code: format!("await {new_name}()"),
        })
    }

    /// Record a program that passed the critic so identical requests can
    /// skip the model.
    pub fn record_success(&self, request: &SynthesisRequest, program: &GeneratedProgram) {
        lock(&self.cache).add(cache_key(request), program.clone());
    }

    async fn request_entry_name(&self, code: &str, old_name: &str) -> KaichiResult<String> {
        let system = self
            .prompts
            .render("action/code", &[("code", code), ("function_name", old_name)])?;
        let mut request =
            CompletionRequest::new("Propose a descriptive name for the entry function.", "ActionAgent")
                .with_system(system);
        if let Some(model) = &self.config.rewrite_model {
            request = request.with_model(model.clone());
        }
        let reply = self.llm.complete(request).await?;

        RENAME_ANSWER
            .captures(&reply.answer)
            .map(|caps| caps[1].to_string())
            .ok_or_else(|| {
                KaichiError::Parse(format!(
                    "No new_function_name in rename answer: {}",
                    reply.answer
                ))
            })
    }

    // --- Skill catalogue, delegated to the injected retriever ---

    pub async fn search_skills(&self, query: &str) -> KaichiResult<Vec<String>> {
        self.retriever.retrieve(query).await
    }

    pub async fn get_skill(&self, name: &str) -> KaichiResult<Option<SkillEntry>> {
        self.retriever.get(name).await
    }

    pub async fn list_skills(&self) -> KaichiResult<Vec<String>> {
        self.retriever.list().await
    }
}

fn cache_key(request: &SynthesisRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.task.as_bytes());
    hasher.update([0]);
    hasher.update(request.context.as_bytes());
    for skill in &request.skills {
        hasher.update([0]);
        hasher.update(skill.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
