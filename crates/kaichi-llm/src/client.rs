use async_trait::async_trait;
use kaichi_core::KaichiResult;

/// A single completion call: the user query, a caller identity for the
/// provider's accounting, an optional system prompt, and an optional model
/// override (used by the rewrite calls).
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub query: String,
    pub user: String,
    pub system: Option<String>,
    pub model: Option<String>,
}

impl CompletionRequest {
    pub fn new(query: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            user: user.into(),
            system: None,
            model: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// A provider answer. Only `answer` is ever inspected by the agents;
/// the rest is carried for logging.
#[derive(Debug, Clone)]
pub struct LlmReply {
    pub answer: String,
    pub conversation_id: Option<String>,
    pub metadata: serde_json::Value,
}

impl LlmReply {
    pub fn new(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            conversation_id: None,
            metadata: serde_json::Value::Null,
        }
    }
}

/// The async text-completion contract every backend implements.
///
/// Errors surface as [`kaichi_core::KaichiError::Llm`] (provider-reported)
/// or [`kaichi_core::KaichiError::Http`] (transport); callers retry up to
/// their configured budget.
#[async_trait]
pub trait TextCompletion: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> KaichiResult<LlmReply>;
}
