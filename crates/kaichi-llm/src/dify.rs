use crate::client::{CompletionRequest, LlmReply, TextCompletion};
use crate::LlmConfig;
use async_trait::async_trait;
use kaichi_core::{KaichiError, KaichiResult};
use std::time::Duration;
use tracing::debug;

/// Client for the Dify `chat-messages` API in blocking mode.
///
/// Dify applications carry their own model binding, so the request's model
/// override is ignored here; variables (the system prompt) travel in the
/// `inputs` map.
pub struct DifyClient {
    config: LlmConfig,
    http: reqwest::Client,
}

impl DifyClient {
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
impl TextCompletion for DifyClient {
    async fn complete(&self, request: CompletionRequest) -> KaichiResult<LlmReply> {
        let url = format!("{}/chat-messages", self.config.base_url());

        let mut inputs = serde_json::Map::new();
        if let Some(system) = &request.system {
            inputs.insert("system".to_string(), serde_json::json!(system));
        }

        let body = serde_json::json!({
            "query": request.query,
            "user": request.user,
            "response_mode": "blocking",
            "inputs": inputs,
        });

        debug!(user = %request.user, "Sending Dify chat message");

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
                "Dify API error {status}: {resp_body}"
            )));
        }

        if let Some(error) = resp_body.get("error").and_then(|e| e.as_str()) {
            return Err(KaichiError::Llm(error.to_string()));
        }

        let answer = resp_body["answer"].as_str().ok_or_else(|| {
            KaichiError::Llm("No answer returned from the API".to_string())
        })?;

        Ok(LlmReply {
            answer: answer.to_string(),
            conversation_id: resp_body["conversation_id"].as_str().map(String::from),
            metadata: resp_body.get("metadata").cloned().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::LlmProvider;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base: &str) -> LlmConfig {
        LlmConfig {
            provider: LlmProvider::Dify,
            api_base: Some(base.to_string()),
            api_key: "secret".to_string(),
            info_model: "m".to_string(),
            rewrite_model: "m".to_string(),
            temperature: 0.8,
            request_timeout: 10,
        }
    }

    #[tokio::test]
    async fn test_complete_returns_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat-messages"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({
                "query": "hello",
                "user": "ActionAgent",
                "response_mode": "blocking",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "answer": "hi there",
                "conversation_id": "c1",
                "metadata": {"usage": {"total_tokens": 7}},
            })))
            .mount(&server)
            .await;

        let client = DifyClient::new(config(&server.uri())).unwrap();
        let reply = client
            .complete(CompletionRequest::new("hello", "ActionAgent").with_system("sys"))
            .await
            .unwrap();

        assert_eq!(reply.answer, "hi there");
        assert_eq!(reply.conversation_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_error_field_is_llm_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat-messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": "quota exceeded",
            })))
            .mount(&server)
            .await;

        let client = DifyClient::new(config(&server.uri())).unwrap();
        let err = client
            .complete(CompletionRequest::new("q", "u"))
            .await
            .unwrap_err();
        assert!(matches!(err, KaichiError::Llm(_)));
    }

    #[tokio::test]
    async fn test_non_200_is_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat-messages"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let client = DifyClient::new(config(&server.uri())).unwrap();
        let err = client
            .complete(CompletionRequest::new("q", "u"))
            .await
            .unwrap_err();
        assert!(matches!(err, KaichiError::Http(_)));
    }

    #[tokio::test]
    async fn test_missing_answer_is_llm_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat-messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "metadata": {},
            })))
            .mount(&server)
            .await;

        let client = DifyClient::new(config(&server.uri())).unwrap();
        let err = client
            .complete(CompletionRequest::new("q", "u"))
            .await
            .unwrap_err();
        assert!(matches!(err, KaichiError::Llm(_)));
    }
}
