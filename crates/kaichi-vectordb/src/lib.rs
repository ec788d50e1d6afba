//! The vector dataset boundary: an async CRUD contract over a remote
//! document dataset, plus the Dify datasets client implementing it.
//!
//! The skill manager synchronizes its local skill dictionary against a
//! dataset through [`DatasetStore`]; the dataset's own index is what makes
//! skill documents semantically searchable on the server side.

mod dify;

pub use dify::{DifyDatasets, DifyDatasetsConfig};

use async_trait::async_trait;
use kaichi_core::KaichiResult;
use serde::{Deserialize, Serialize};

/// A dataset as listed by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub id: String,
    pub name: String,
}

/// A document inside a dataset. The id is the delete handle; the name is
/// what retrieval matches against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetDocument {
    pub id: String,
    pub name: String,
}

/// Async CRUD surface over a remote document dataset.
#[async_trait]
pub trait DatasetStore: Send + Sync {
    /// Create a dataset and return its id.
    async fn create_dataset(&self, name: &str) -> KaichiResult<String>;

    async fn list_datasets(&self) -> KaichiResult<Vec<DatasetSummary>>;

    /// Insert a text document and return the new document's id.
    async fn create_document_by_text(
        &self,
        dataset_id: &str,
        name: &str,
        text: &str,
    ) -> KaichiResult<String>;

    /// List one page of documents. `page` is 1-based; a result shorter
    /// than `limit` is the last page.
    async fn list_documents(
        &self,
        dataset_id: &str,
        keyword: Option<&str>,
        page: u32,
        limit: u32,
    ) -> KaichiResult<Vec<DatasetDocument>>;

    async fn delete_document(&self, dataset_id: &str, document_id: &str) -> KaichiResult<()>;
}

/// Enumerate every document in a dataset, following pagination.
pub async fn list_all_documents(
    store: &dyn DatasetStore,
    dataset_id: &str,
) -> KaichiResult<Vec<DatasetDocument>> {
    const PAGE_LIMIT: u32 = 100;
    let mut documents = Vec::new();
    let mut page = 1;
    loop {
        let batch = store
            .list_documents(dataset_id, None, page, PAGE_LIMIT)
            .await?;
        let last = (batch.len() as u32) < PAGE_LIMIT;
        documents.extend(batch);
        if last {
            return Ok(documents);
        }
        page += 1;
    }
}
