use crate::store::{SkillRecord, SkillStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kaichi_core::json::fix_and_parse_json;
use kaichi_core::{
    KaichiError, KaichiResult, PromptLibrary, SkillEntry, SkillRetriever, UsageCache,
};
use kaichi_llm::{CompletionRequest, TextCompletion};
use kaichi_vectordb::{list_all_documents, DatasetStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

/// Settings for the skill manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillManagerConfig {
    #[serde(default = "default_retrieval_top_k")]
    pub retrieval_top_k: usize,
    pub ckpt_dir: PathBuf,
    #[serde(default)]
    pub resume: bool,
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

fn default_cache_size() -> usize {
    100
}

impl SkillManagerConfig {
    pub fn validate(&self) -> KaichiResult<()> {
        if self.retrieval_top_k == 0 {
            return Err(KaichiError::Config("Invalid retrieval_top_k: 0".to_string()));
        }
        if self.cache_size == 0 {
            return Err(KaichiError::Config("Invalid cache size: 0".to_string()));
        }
        Ok(())
    }
}

/// An auxiliary LLM review of a skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillReview {
    pub review: String,
    pub timestamp: DateTime<Utc>,
}

/// An auxiliary LLM analysis of skill content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillAnalysis {
    pub analysis: String,
    pub timestamp: DateTime<Utc>,
}

struct Inner {
    skills: BTreeMap<String, SkillRecord>,
    cache: UsageCache<SkillRecord>,
}

/// The system's long-term memory: named skills persisted locally and
/// mirrored as documents in a vector dataset.
///
/// The manager exclusively owns the skill dictionary and the on-disk skill
/// files; everything else reads skills through its accessors or the
/// [`SkillRetriever`] capability.
pub struct SkillManager {
    config: SkillManagerConfig,
    llm: Arc<dyn TextCompletion>,
    dataset: Arc<dyn DatasetStore>,
    dataset_id: String,
    store: SkillStore,
    prompts: PromptLibrary,
    inner: Mutex<Inner>,
}

impl SkillManager {
    pub fn new(
        config: SkillManagerConfig,
        llm: Arc<dyn TextCompletion>,
        dataset: Arc<dyn DatasetStore>,
        dataset_id: String,
        prompts: PromptLibrary,
    ) -> KaichiResult<Self> {
        config.validate()?;
        let store = SkillStore::new(&config.ckpt_dir)?;

        let skills = if config.resume {
            let skills = store.load()?;
            info!(count = skills.len(), "Loaded skill library");
            skills
        } else {
            BTreeMap::new()
        };

        let mut cache = UsageCache::new(config.cache_size);
        for (name, record) in &skills {
            cache.add(name.clone(), record.clone());
        }

        Ok(Self {
            config,
            llm,
            dataset,
            dataset_id,
            store,
            prompts,
            inner: Mutex::new(Inner { skills, cache }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Distill a successful program into the library.
    ///
    /// Generates the JSON-Schema description, replaces any prior dataset
    /// document under the same name, writes a fresh version to disk,
    /// persists the dictionary, and checks the dataset/local consistency
    /// post-condition.
    pub async fn add_new_skill(
        &self,
        program_name: &str,
        program_code: &str,
    ) -> KaichiResult<()> {
        info!(skill = %program_name, "Adding skill");

        let description = self
            .generate_skill_description(program_name, program_code)
            .await?;

        let previous_document = self
            .lock()
            .skills
            .get(program_name)
            .map(|record| record.document_id.clone());

        if let Some(document_id) = previous_document {
            self.dataset
                .delete_document(&self.dataset_id, &document_id)
                .await?;
        }

        let document_id = self
            .dataset
            .create_document_by_text(&self.dataset_id, program_name, program_code)
            .await?;

        let local_count = {
            let mut inner = self.lock();
            let stem = self.store.next_stem(program_name);
            self.store.write_version(&stem, program_code, &description)?;

            let record = SkillRecord {
                code: program_code.to_string(),
                description,
                document_id,
            };
            inner.cache.add(program_name, record.clone());
            inner.skills.insert(program_name.to_string(), record);
            self.store.persist(&inner.skills)?;
            self.store.check_integrity(&inner.skills)?;
            inner.skills.len()
        };

        let documents = list_all_documents(self.dataset.as_ref(), &self.dataset_id).await?;
        if documents.len() != local_count {
            return Err(KaichiError::Invariant(format!(
                "Dataset holds {} documents but the local library has {} skills",
                documents.len(),
                local_count
            )));
        }

        info!(skill = %program_name, "Skill added");
        Ok(())
    }

    /// Return the code bodies of up to `retrieval_top_k` skills whose
    /// dataset document name contains the query, case-insensitively.
    pub async fn retrieve_skills(&self, query: &str) -> KaichiResult<Vec<String>> {
        let documents = list_all_documents(self.dataset.as_ref(), &self.dataset_id).await?;
        let needle = query.to_lowercase();

        let mut retrieved = Vec::new();
        let mut matched = Vec::new();
        {
            let mut inner = self.lock();
            for document in &documents {
                if retrieved.len() >= self.config.retrieval_top_k {
                    break;
                }
                if !document.name.to_lowercase().contains(&needle) {
                    continue;
                }
                let mut code = inner.cache.get(&document.name).map(|r| r.code.clone());
                if code.is_none() {
                    code = inner.skills.get(&document.name).map(|r| r.code.clone());
                }
                match code {
                    Some(code) => {
                        retrieved.push(code);
                        matched.push(document.name.clone());
                    }
                    None => {
                        warn!(document = %document.name, "Dataset document has no local skill")
                    }
                }
            }
        }

        info!(count = retrieved.len(), names = ?matched, "Retrieved skills");
        Ok(retrieved)
    }

    /// Look up a skill in the local dictionary only.
    pub fn get_skill(&self, name: &str) -> Option<SkillRecord> {
        let mut inner = self.lock();
        if let Some(record) = inner.cache.get(name) {
            return Some(record.clone());
        }
        inner.skills.get(name).cloned()
    }

    /// All live skill names.
    pub fn list_skills(&self) -> Vec<String> {
        self.lock().skills.keys().cloned().collect()
    }

    /// Number of live skills.
    pub fn skill_count(&self) -> usize {
        self.lock().skills.len()
    }

    /// Produce a JSON-Schema description of the entry function. Fails with
    /// a parse error when the model's output is not valid JSON.
    pub async fn generate_skill_description(
        &self,
        program_name: &str,
        program_code: &str,
    ) -> KaichiResult<String> {
        let system = self.prompts.render(
            "skill/skill_description",
            &[("code", program_code), ("function_name", program_name)],
        )?;
        let reply = self
            .llm
            .complete(
                CompletionRequest::new(
                    "Please generate a skill description based on the provided code.",
                    "SkillManager",
                )
                .with_system(system),
            )
            .await?;

        let schema = fix_and_parse_json(&reply.answer).map_err(|_| {
            KaichiError::Parse(format!(
                "Skill description for '{program_name}' is not valid JSON"
            ))
        })?;
        Ok(serde_json::to_string_pretty(&schema)?)
    }

    /// Auxiliary LLM pass: review a skill's code. Not on the hot loop.
    pub async fn review_skill(&self, name: &str, code: &str) -> KaichiResult<SkillReview> {
        let system = self.prompts.render(
            "skill/skill_review",
            &[("skill_name", name), ("skill_code", code)],
        )?;
        let reply = self
            .llm
            .complete(
                CompletionRequest::new(
                    "Please review this skill and provide detailed feedback.",
                    "SkillManager",
                )
                .with_system(system),
            )
            .await?;
        Ok(SkillReview {
            review: reply.answer,
            timestamp: Utc::now(),
        })
    }

    /// Auxiliary LLM pass: analyze skill content. Not on the hot loop.
    pub async fn analyze_skill(&self, content: &str) -> KaichiResult<SkillAnalysis> {
        let system = self
            .prompts
            .render("skill/skill_analysis", &[("skill_content", content)])?;
        let reply = self
            .llm
            .complete(
                CompletionRequest::new(
                    "Please analyze this skill and provide detailed insights.",
                    "SkillManager",
                )
                .with_system(system),
            )
            .await?;
        Ok(SkillAnalysis {
            analysis: reply.answer,
            timestamp: Utc::now(),
        })
    }
}

#[async_trait]
impl SkillRetriever for SkillManager {
    async fn retrieve(&self, query: &str) -> KaichiResult<Vec<String>> {
        self.retrieve_skills(query).await
    }

    async fn get(&self, name: &str) -> KaichiResult<Option<SkillEntry>> {
        Ok(self.get_skill(name).map(|record| SkillEntry {
            code: record.code,
            description: record.description,
        }))
    }

    async fn list(&self) -> KaichiResult<Vec<String>> {
        Ok(self.list_skills())
    }
}
