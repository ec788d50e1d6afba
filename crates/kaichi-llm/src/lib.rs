//! The LLM boundary: a single async text-completion contract and the two
//! backends that implement it (Dify chat-messages and OpenAI chat
//! completions).
//!
//! The rest of the system depends only on [`TextCompletion`]; nothing
//! outside this crate inspects a provider response beyond its answer or
//! error.

mod client;
mod dify;
mod openai;

pub use client::{CompletionRequest, LlmReply, TextCompletion};
pub use dify::DifyClient;
pub use openai::OpenAiClient;

use kaichi_core::{KaichiError, KaichiResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which remote completion API to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Dify,
    OpenAi,
}

impl std::str::FromStr for LlmProvider {
    type Err = KaichiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dify" => Ok(Self::Dify),
            "openai" => Ok(Self::OpenAi),
            other => Err(KaichiError::Config(format!("Unknown LLM provider: {other}"))),
        }
    }
}

/// Connection and sampling settings for the completion backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    /// Base URL; required for Dify, defaulted for OpenAI.
    pub api_base: Option<String>,
    pub api_key: String,
    /// Model used for ordinary generation calls.
    #[serde(default = "default_info_model")]
    pub info_model: String,
    /// Model used for the tightly-scoped rewrite calls.
    #[serde(default = "default_rewrite_model")]
    pub rewrite_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Per-request wall clock bound in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

fn default_info_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_rewrite_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.8
}

fn default_request_timeout() -> u64 {
    120
}

impl LlmConfig {
    /// Validate the configuration. Called by every backend constructor.
    pub fn validate(&self) -> KaichiResult<()> {
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(KaichiError::Config(format!(
                "Invalid temperature: {}",
                self.temperature
            )));
        }
        if self.request_timeout == 0 {
            return Err(KaichiError::Config(
                "Invalid request timeout: 0".to_string(),
            ));
        }
        if self.provider == LlmProvider::Dify && self.api_base.is_none() {
            return Err(KaichiError::Config(
                "Dify provider requires an api_base".to_string(),
            ));
        }
        Ok(())
    }

    pub fn base_url(&self) -> &str {
        match &self.api_base {
            Some(url) => url,
            None => match self.provider {
                LlmProvider::Dify => "",
                LlmProvider::OpenAi => "https://api.openai.com",
            },
        }
    }
}

/// Construct the backend selected by the config.
pub fn build_client(config: LlmConfig) -> KaichiResult<Arc<dyn TextCompletion>> {
    match config.provider {
        LlmProvider::Dify => Ok(Arc::new(DifyClient::new(config)?)),
        LlmProvider::OpenAi => Ok(Arc::new(OpenAiClient::new(config)?)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config() -> LlmConfig {
        LlmConfig {
            provider: LlmProvider::OpenAi,
            api_base: None,
            api_key: "k".to_string(),
            info_model: default_info_model(),
            rewrite_model: default_rewrite_model(),
            temperature: 0.8,
            request_timeout: 120,
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_invalid_temperature_rejected() {
        let mut cfg = config();
        cfg.temperature = 1.5;
        assert!(matches!(cfg.validate(), Err(KaichiError::Config(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut cfg = config();
        cfg.request_timeout = 0;
        assert!(matches!(cfg.validate(), Err(KaichiError::Config(_))));
    }

    #[test]
    fn test_dify_requires_base_url() {
        let mut cfg = config();
        cfg.provider = LlmProvider::Dify;
        assert!(matches!(cfg.validate(), Err(KaichiError::Config(_))));
    }

    #[test]
    fn test_provider_from_str() {
        assert_eq!("dify".parse::<LlmProvider>().unwrap(), LlmProvider::Dify);
        assert_eq!("OpenAI".parse::<LlmProvider>().unwrap(), LlmProvider::OpenAi);
        assert!("cohere".parse::<LlmProvider>().is_err());
    }
}
