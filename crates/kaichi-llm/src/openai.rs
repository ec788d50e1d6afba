use crate::client::{CompletionRequest, LlmReply, TextCompletion};
use crate::LlmConfig;
use async_trait::async_trait;
use kaichi_core::{KaichiError, KaichiResult};
use std::time::Duration;
use tracing::debug;

/// Client for the OpenAI chat completions API.
pub struct OpenAiClient {
    config: LlmConfig,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(config: LlmConfig) -> KaichiResult<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout))
            .build()
            .map_err(|e| KaichiError::Http(e.to_string()))?;
        Ok(Self { config, http })
    }
}

#[async_trait]
impl TextCompletion for OpenAiClient {
    async fn complete(&self, request: CompletionRequest) -> KaichiResult<LlmReply> {
        let url = format!("{}/v1/chat/completions", self.config.base_url());

        let mut messages: Vec<serde_json::Value> = Vec::new();
        if let Some(system) = &request.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": request.query}));

        let model = request
            .model
            .as_deref()
            .unwrap_or(self.config.info_model.as_str());

        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": self.config.temperature,
            "user": request.user,
        });

        debug!(model = %model, user = %request.user, "Sending chat completion");

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| KaichiError::Http(e.to_string()))?;

        let status = resp.status();
        let resp_body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| KaichiError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(KaichiError::Http(format!(
                "OpenAI API error {status}: {resp_body}"
            )));
        }

        if let Some(error) = resp_body.get("error") {
            return Err(KaichiError::Llm(error.to_string()));
        }

        let answer = resp_body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| KaichiError::Llm("No answer returned from the API".to_string()))?;

        Ok(LlmReply {
            answer: answer.to_string(),
            conversation_id: None,
            metadata: resp_body.get("usage").cloned().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::LlmProvider;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base: &str) -> LlmConfig {
        LlmConfig {
            provider: LlmProvider::OpenAi,
            api_base: Some(base.to_string()),
            api_key: "secret".to_string(),
            info_model: "gpt-4o-mini".to_string(),
            rewrite_model: "gpt-4o".to_string(),
            temperature: 0.5,
            request_timeout: 10,
        }
    }

    #[tokio::test]
    async fn test_complete_uses_info_model_by_default() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(serde_json::json!({"model": "gpt-4o-mini"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "answer text"}}],
                "usage": {"total_tokens": 12},
            })))
            .mount(&server)
            .await;

        let client = OpenAiClient::new(config(&server.uri())).unwrap();
        let reply = client
            .complete(CompletionRequest::new("q", "u").with_system("s"))
            .await
            .unwrap();
        assert_eq!(reply.answer, "answer text");
    }

    #[tokio::test]
    async fn test_model_override_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(serde_json::json!({"model": "gpt-4o"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "renamed"}}],
            })))
            .mount(&server)
            .await;

        let client = OpenAiClient::new(config(&server.uri())).unwrap();
        let reply = client
            .complete(CompletionRequest::new("q", "u").with_model("gpt-4o"))
            .await
            .unwrap();
        assert_eq!(reply.answer, "renamed");
    }

    #[tokio::test]
    async fn test_error_object_is_llm_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": {"message": "bad request"},
            })))
            .mount(&server)
            .await;

        let client = OpenAiClient::new(config(&server.uri())).unwrap();
        let err = client
            .complete(CompletionRequest::new("q", "u"))
            .await
            .unwrap_err();
        assert!(matches!(err, KaichiError::Llm(_)));
    }
}
