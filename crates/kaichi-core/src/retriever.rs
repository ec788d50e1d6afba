use crate::KaichiResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A stored skill as seen through the retrieval seam: the entry function's
/// source and its JSON-Schema description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillEntry {
    pub code: String,
    pub description: String,
}

/// Capability interface for skill lookup.
///
/// The action agent never talks to the skill manager directly; the
/// orchestrator constructs the manager and passes it in behind this trait,
/// which keeps the agent crates free of each other.
#[async_trait]
pub trait SkillRetriever: Send + Sync {
    /// Return up to the retrieval cap of skill code bodies whose names
    /// match the query.
    async fn retrieve(&self, query: &str) -> KaichiResult<Vec<String>>;

    /// Look up a single skill by exact name.
    async fn get(&self, name: &str) -> KaichiResult<Option<SkillEntry>>;

    /// All live skill names.
    async fn list(&self) -> KaichiResult<Vec<String>>;
}
