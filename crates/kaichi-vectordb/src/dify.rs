use crate::{DatasetDocument, DatasetStore, DatasetSummary};
use async_trait::async_trait;
use kaichi_core::{KaichiError, KaichiResult};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// Connection settings for the Dify datasets API.
#[derive(Debug, Clone, Deserialize)]
pub struct DifyDatasetsConfig {
    pub api_base: String,
    pub api_key: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

fn default_request_timeout() -> u64 {
    60
}

/// HTTP client for the Dify datasets (knowledge) API.
pub struct DifyDatasets {
    config: DifyDatasetsConfig,
    http: reqwest::Client,
}

impl DifyDatasets {
    pub fn new(config: DifyDatasetsConfig) -> KaichiResult<Self> {
        if config.api_base.is_empty() {
            return Err(KaichiError::Config(
                "Dify datasets api_base must not be empty".to_string(),
            ));
        }
        if config.request_timeout == 0 {
            return Err(KaichiError::Config(
                "Invalid request timeout: 0".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout))
            .build()
            .map_err(|e| KaichiError::Http(e.to_string()))?;
        Ok(Self { config, http })
    }

    /// Resolve a dataset id: use the configured/advertised one, otherwise
    /// look the dataset up by name, otherwise create it.
    pub async fn resolve_dataset_id(
        &self,
        configured: Option<&str>,
        dataset_name: &str,
    ) -> KaichiResult<String> {
        if let Some(id) = configured {
            if !id.is_empty() {
                return Ok(id.to_string());
            }
        }
        for dataset in self.list_datasets().await? {
            if dataset.name == dataset_name {
                info!(dataset_id = %dataset.id, "Found existing skill dataset");
                return Ok(dataset.id);
            }
        }
        let id = self.create_dataset(dataset_name).await?;
        info!(dataset_id = %id, "Created skill dataset");
        Ok(id)
    }

    async fn parse_response(resp: reqwest::Response) -> KaichiResult<serde_json::Value> {
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| KaichiError::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(KaichiError::Http(format!(
                "Dify datasets API error {status}: {body}"
            )));
        }
        if let Some(error) = body.get("error").and_then(|e| e.as_str()) {
            return Err(KaichiError::Http(error.to_string()));
        }
        Ok(body)
    }
}

#[async_trait]
impl DatasetStore for DifyDatasets {
    async fn create_dataset(&self, name: &str) -> KaichiResult<String> {
        let url = format!("{}/datasets", self.config.api_base);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&serde_json::json!({"name": name}))
            .send()
            .await
            .map_err(|e| KaichiError::Http(e.to_string()))?;
        let body = Self::parse_response(resp).await?;
        body["id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| KaichiError::Http("Dataset creation returned no id".to_string()))
    }

    async fn list_datasets(&self) -> KaichiResult<Vec<DatasetSummary>> {
        let url = format!("{}/datasets?page=1&limit=100", self.config.api_base);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| KaichiError::Http(e.to_string()))?;
        let body = Self::parse_response(resp).await?;
        let data = body["data"].as_array().cloned().unwrap_or_default();
        Ok(data
            .iter()
            .filter_map(|d| {
                Some(DatasetSummary {
                    id: d["id"].as_str()?.to_string(),
                    name: d["name"].as_str()?.to_string(),
                })
            })
            .collect())
    }

    async fn create_document_by_text(
        &self,
        dataset_id: &str,
        name: &str,
        text: &str,
    ) -> KaichiResult<String> {
        let url = format!(
            "{}/datasets/{dataset_id}/document/create_by_text",
            self.config.api_base
        );
        let body = serde_json::json!({
            "name": name,
            "text": text,
            "indexing_technique": "high_quality",
            "process_rule": {"mode": "automatic"},
        });

        debug!(document = %name, "Creating dataset document");

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| KaichiError::Http(e.to_string()))?;
        let body = Self::parse_response(resp).await?;

        body["document"]["id"]
            .as_str()
            .or_else(|| body["id"].as_str())
            .map(String::from)
            .ok_or_else(|| KaichiError::Http("Document creation returned no id".to_string()))
    }

    async fn list_documents(
        &self,
        dataset_id: &str,
        keyword: Option<&str>,
        page: u32,
        limit: u32,
    ) -> KaichiResult<Vec<DatasetDocument>> {
        let mut url = format!(
            "{}/datasets/{dataset_id}/documents?page={page}&limit={limit}",
            self.config.api_base
        );
        if let Some(keyword) = keyword {
            url.push_str(&format!("&keyword={keyword}"));
        }
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| KaichiError::Http(e.to_string()))?;
        let body = Self::parse_response(resp).await?;
        let data = body["data"].as_array().cloned().unwrap_or_default();
        Ok(data
            .iter()
            .filter_map(|d| {
                Some(DatasetDocument {
                    id: d["id"].as_str()?.to_string(),
                    name: d["name"].as_str()?.to_string(),
                })
            })
            .collect())
    }

    async fn delete_document(&self, dataset_id: &str, document_id: &str) -> KaichiResult<()> {
        let url = format!(
            "{}/datasets/{dataset_id}/documents/{document_id}",
            self.config.api_base
        );
        let resp = self
            .http
            .delete(&url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| KaichiError::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(KaichiError::Http(format!(
                "Dify datasets API error {status}: {body}"
            )));
        }
        Ok(())
    }
}
