use async_trait::async_trait;
use kaichi_core::{KaichiError, KaichiResult, PromptLibrary, SkillRetriever};
use kaichi_llm::{CompletionRequest, LlmReply, TextCompletion};
use kaichi_skills::{SkillManager, SkillManagerConfig, SkillStore};
use kaichi_vectordb::{DatasetDocument, DatasetStore, DatasetSummary};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// LLM stub returning a fixed answer for every call.
struct FixedLlm {
    answer: String,
}

#[async_trait]
impl TextCompletion for FixedLlm {
    async fn complete(&self, _request: CompletionRequest) -> KaichiResult<LlmReply> {
        Ok(LlmReply::new(self.answer.clone()))
    }
}

/// In-memory dataset double tracking documents by id.
#[derive(Default)]
struct MemoryDataset {
    state: Mutex<MemoryState>,
    /// When set, deletes silently do nothing — used to provoke the
    /// consistency post-condition.
    ignore_deletes: bool,
}

#[derive(Default)]
struct MemoryState {
    docs: Vec<DatasetDocument>,
    next_id: u64,
}

#[async_trait]
impl DatasetStore for MemoryDataset {
    async fn create_dataset(&self, _name: &str) -> KaichiResult<String> {
        Ok("ds".to_string())
    }

    async fn list_datasets(&self) -> KaichiResult<Vec<DatasetSummary>> {
        Ok(vec![])
    }

    async fn create_document_by_text(
        &self,
        _dataset_id: &str,
        name: &str,
        _text: &str,
    ) -> KaichiResult<String> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("doc-{}", state.next_id);
        state.docs.push(DatasetDocument {
            id: id.clone(),
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn list_documents(
        &self,
        _dataset_id: &str,
        _keyword: Option<&str>,
        page: u32,
        limit: u32,
    ) -> KaichiResult<Vec<DatasetDocument>> {
        let state = self.state.lock().unwrap();
        let start = ((page - 1) * limit) as usize;
        Ok(state
            .docs
            .iter()
            .skip(start)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn delete_document(&self, _dataset_id: &str, document_id: &str) -> KaichiResult<()> {
        if self.ignore_deletes {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        state.docs.retain(|d| d.id != document_id);
        Ok(())
    }
}

fn write_prompts(dir: &Path) {
    let skill_dir = dir.join("skill");
    std::fs::create_dir_all(&skill_dir).unwrap();
    std::fs::write(
        skill_dir.join("skill_description.txt"),
        "Describe {{function_name}}:\n{{code}}",
    )
    .unwrap();
    std::fs::write(
        skill_dir.join("skill_review.txt"),
        "Review {{skill_name}}:\n{{skill_code}}",
    )
    .unwrap();
    std::fs::write(
        skill_dir.join("skill_analysis.txt"),
        "Analyze:\n{{skill_content}}",
    )
    .unwrap();
}

fn manager_with(
    ckpt: &Path,
    prompts_dir: &Path,
    dataset: Arc<MemoryDataset>,
    answer: &str,
    resume: bool,
) -> SkillManager {
    let config = SkillManagerConfig {
        retrieval_top_k: 5,
        ckpt_dir: ckpt.to_path_buf(),
        resume,
        dataset_name: "skill_dataset".to_string(),
        cache_size: 100,
    };
    SkillManager::new(
        config,
        Arc::new(FixedLlm {
            answer: answer.to_string(),
        }),
        dataset,
        "ds".to_string(),
        PromptLibrary::new(prompts_dir),
    )
    .unwrap()
}

const SCHEMA_ANSWER: &str =
    "```json\n{\"name\": \"hello\", \"parameters\": {}, \"returns\": {\"type\": \"string\"}}\n```";

#[tokio::test]
async fn test_add_then_readd_versions_files_and_replaces_document() {
    let ckpt = tempfile::tempdir().unwrap();
    let prompts = tempfile::tempdir().unwrap();
    write_prompts(prompts.path());
    let dataset = Arc::new(MemoryDataset::default());
    let manager = manager_with(ckpt.path(), prompts.path(), dataset.clone(), SCHEMA_ANSWER, false);

    let c1 = "async def hello():\n    return 'v1'\n";
    let c2 = "async def hello():\n    return 'v2'\n";

    manager.add_new_skill("hello", c1).await.unwrap();
    manager.add_new_skill("hello", c2).await.unwrap();

    // Local dictionary points at the newest code.
    let record = manager.get_skill("hello").unwrap();
    assert_eq!(record.code, c2);
    assert_eq!(manager.list_skills(), vec!["hello".to_string()]);

    // Both versioned files exist on disk.
    let skill_dir = ckpt.path().join("skill");
    assert!(skill_dir.join("code/hello.py").exists());
    assert!(skill_dir.join("code/helloV2.py").exists());
    assert!(skill_dir.join("description/hello.txt").exists());
    assert!(skill_dir.join("description/helloV2.txt").exists());

    // The dataset holds exactly one document named hello.
    let docs = dataset
        .list_documents("ds", None, 1, 100)
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].name, "hello");
}

#[tokio::test]
async fn test_consistency_postcondition_fires_on_drift() {
    let ckpt = tempfile::tempdir().unwrap();
    let prompts = tempfile::tempdir().unwrap();
    write_prompts(prompts.path());
    let dataset = Arc::new(MemoryDataset {
        ignore_deletes: true,
        ..Default::default()
    });
    let manager = manager_with(ckpt.path(), prompts.path(), dataset, SCHEMA_ANSWER, false);

    manager.add_new_skill("hello", "async def hello(): ...").await.unwrap();
    // Second add leaves the stale document behind, so docs != skills.
    let err = manager
        .add_new_skill("hello", "async def hello(): pass")
        .await
        .unwrap_err();
    assert!(matches!(err, KaichiError::Invariant(_)));
}

#[tokio::test]
async fn test_description_must_be_json() {
    let ckpt = tempfile::tempdir().unwrap();
    let prompts = tempfile::tempdir().unwrap();
    write_prompts(prompts.path());
    let dataset = Arc::new(MemoryDataset::default());
    let manager = manager_with(
        ckpt.path(),
        prompts.path(),
        dataset,
        "this is prose, not a schema",
        false,
    );

    let err = manager
        .add_new_skill("hello", "async def hello(): ...")
        .await
        .unwrap_err();
    assert!(matches!(err, KaichiError::Parse(_)));
    // Nothing was persisted.
    assert!(manager.list_skills().is_empty());
}

#[tokio::test]
async fn test_retrieval_matches_substring_case_insensitive() {
    let ckpt = tempfile::tempdir().unwrap();
    let prompts = tempfile::tempdir().unwrap();
    write_prompts(prompts.path());
    let dataset = Arc::new(MemoryDataset::default());
    let manager = manager_with(ckpt.path(), prompts.path(), dataset, SCHEMA_ANSWER, false);

    manager
        .add_new_skill("fetch_articles", "async def fetch_articles(): ...")
        .await
        .unwrap();
    manager
        .add_new_skill("write_report", "async def write_report(): ...")
        .await
        .unwrap();

    let hits = manager.retrieve_skills("FETCH").await.unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].contains("fetch_articles"));

    let none = manager.retrieve_skills("deploy").await.unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_retrieval_capped_at_top_k() {
    let ckpt = tempfile::tempdir().unwrap();
    let prompts = tempfile::tempdir().unwrap();
    write_prompts(prompts.path());
    let dataset = Arc::new(MemoryDataset::default());

    let config = SkillManagerConfig {
        retrieval_top_k: 2,
        ckpt_dir: ckpt.path().to_path_buf(),
        resume: false,
        dataset_name: "skill_dataset".to_string(),
        cache_size: 100,
    };
    let manager = SkillManager::new(
        config,
        Arc::new(FixedLlm {
            answer: SCHEMA_ANSWER.to_string(),
        }),
        dataset,
        "ds".to_string(),
        PromptLibrary::new(prompts.path()),
    )
    .unwrap();

    for i in 0..4 {
        let name = format!("task_step_{i}");
        let code = format!("async def task_step_{i}(): ...");
        manager.add_new_skill(&name, &code).await.unwrap();
    }

    let hits = manager.retrieve_skills("task").await.unwrap();
    assert_eq!(hits.len(), 2);
}

#[tokio::test]
async fn test_resume_reloads_dictionary() {
    let ckpt = tempfile::tempdir().unwrap();
    let prompts = tempfile::tempdir().unwrap();
    write_prompts(prompts.path());
    let dataset = Arc::new(MemoryDataset::default());

    {
        let manager =
            manager_with(ckpt.path(), prompts.path(), dataset.clone(), SCHEMA_ANSWER, false);
        manager
            .add_new_skill("greet", "async def greet(): ...")
            .await
            .unwrap();
    }

    let resumed = manager_with(ckpt.path(), prompts.path(), dataset, SCHEMA_ANSWER, true);
    assert_eq!(resumed.list_skills(), vec!["greet".to_string()]);
    let entry = resumed.get("greet").await.unwrap().unwrap();
    assert!(entry.code.contains("async def greet"));
}

#[tokio::test]
async fn test_store_versions_stay_dense() {
    let ckpt = tempfile::tempdir().unwrap();
    let prompts = tempfile::tempdir().unwrap();
    write_prompts(prompts.path());
    let dataset = Arc::new(MemoryDataset::default());
    let manager = manager_with(ckpt.path(), prompts.path(), dataset, SCHEMA_ANSWER, false);

    for _ in 0..3 {
        manager
            .add_new_skill("hello", "async def hello(): ...")
            .await
            .unwrap();
    }

    let store = SkillStore::new(ckpt.path()).unwrap();
    assert_eq!(
        store.versions("hello"),
        vec!["hello", "helloV2", "helloV3"]
    );
}
