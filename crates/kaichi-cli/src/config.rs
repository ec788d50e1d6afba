use kaichi_agents::AgentMode;
use kaichi_core::{KaichiError, KaichiResult};
use kaichi_llm::{LlmConfig, LlmProvider};
use kaichi_sandbox::SandboxConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration, read from `kaichi.toml` and overridden by
/// environment variables.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct KaichiConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub curriculum: CurriculumSection,
    #[serde(default)]
    pub skills: SkillsSection,
    #[serde(default)]
    pub resume: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_ckpt_dir")]
    pub ckpt_dir: PathBuf,
    #[serde(default = "default_observation_dir")]
    pub observation_dir: PathBuf,
    #[serde(default = "default_prompt_dir")]
    pub prompt_dir: PathBuf,
}

fn default_ckpt_dir() -> PathBuf {
    PathBuf::from("work_dir/ckpt")
}

fn default_observation_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_prompt_dir() -> PathBuf {
    PathBuf::from("prompts")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            ckpt_dir: default_ckpt_dir(),
            observation_dir: default_observation_dir(),
            prompt_dir: default_prompt_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmSection {
    pub provider: Option<String>,
    pub api_base: Option<String>,
    pub api_key: Option<String>,
    pub info_model: Option<String>,
    pub rewrite_model: Option<String>,
    pub temperature: Option<f32>,
    pub request_timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CurriculumSection {
    #[serde(default)]
    pub mode: AgentMode,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default)]
    pub source_content: String,
}

fn default_max_retries() -> usize {
    5
}

fn default_cache_size() -> usize {
    100
}

impl Default for CurriculumSection {
    fn default() -> Self {
        Self {
            mode: AgentMode::Auto,
            max_retries: default_max_retries(),
            cache_size: default_cache_size(),
            source_content: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SkillsSection {
    #[serde(default = "default_retrieval_top_k")]
    pub retrieval_top_k: usize,
    #[serde(default = "default_dataset_name")]
    pub dataset_name: String,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

fn default_retrieval_top_k() -> usize {
    5
}

fn default_dataset_name() -> String {
    "skill_dataset".to_string()
}

impl Default for SkillsSection {
    fn default() -> Self {
        Self {
            retrieval_top_k: default_retrieval_top_k(),
            dataset_name: default_dataset_name(),
            cache_size: default_cache_size(),
        }
    }
}

impl KaichiConfig {
    /// Read the TOML file when present; a missing file means defaults.
    pub fn load(path: &Path) -> KaichiResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| KaichiError::Config(format!("Invalid config '{}': {e}", path.display())))
    }

    /// Fold in the environment variables the deployment contract names.
    pub fn apply_env(&mut self) {
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            self.llm.provider = Some(provider);
        }
        if let Ok(base) = std::env::var("DIFY_API_BASE") {
            self.llm.api_base = Some(base);
        }
        if let Ok(key) = std::env::var("DIFY_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Ok(model) = std::env::var("GET_INFO_MODEL") {
            self.llm.info_model = Some(model);
        }
        if let Ok(model) = std::env::var("REWRITE_MODEL") {
            self.llm.rewrite_model = Some(model);
        }
        if let Ok(dir) = std::env::var("PROJECT_DIR") {
            self.paths.observation_dir = PathBuf::from(dir);
        }
    }

    /// Materialize the validated LLM configuration.
    pub fn llm_config(&self) -> KaichiResult<LlmConfig> {
        let provider: LlmProvider = self
            .llm
            .provider
            .as_deref()
            .unwrap_or("dify")
            .parse()?;

        let config = LlmConfig {
            provider,
            api_base: self.llm.api_base.clone(),
            api_key: self.llm.api_key.clone().unwrap_or_default(),
            info_model: self
                .llm
                .info_model
                .clone()
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            rewrite_model: self
                .llm
                .rewrite_model
                .clone()
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            temperature: self.llm.temperature.unwrap_or(0.8),
            request_timeout: self.llm.request_timeout.unwrap_or(120),
        };
        config.validate()?;
        Ok(config)
    }
}
