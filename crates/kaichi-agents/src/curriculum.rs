use chrono::{DateTime, Utc};
use kaichi_core::json::extract_json_from_markdown;
use kaichi_core::{KaichiError, KaichiResult, PromptLibrary, UsageCache};
use kaichi_llm::{CompletionRequest, TextCompletion};
use kaichi_observer::ProjectSnapshot;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use crate::AgentMode;

static QA_PAIR: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"Question (\d+): (.+)\nConcept \d+: (.+)").unwrap()
});

/// Settings for the curriculum agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurriculumConfig {
    pub ckpt_dir: PathBuf,
    #[serde(default)]
    pub mode: AgentMode,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default)]
    pub resume: bool,
    /// Source material handed to the question/answer passes.
    #[serde(default)]
    pub source_content: String,
    #[serde(default = "default_max_key_file_chars")]
    pub max_key_file_chars: usize,
}

fn default_max_retries() -> usize {
    5
}

fn default_cache_size() -> usize {
    100
}

fn default_max_key_file_chars() -> usize {
    2000
}

impl CurriculumConfig {
    pub fn validate(&self) -> KaichiResult<()> {
        if self.max_retries == 0 {
            return Err(KaichiError::Config("Invalid max retries: 0".to_string()));
        }
        if self.cache_size == 0 {
            return Err(KaichiError::Config("Invalid cache size: 0".to_string()));
        }
        Ok(())
    }
}

/// One question/concept pair used to build task context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaPair {
    pub question: String,
    pub concept: String,
    pub answer: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Exploration progress over proposed tasks.
///
/// `completed_tasks` and `failed_tasks` are disjoint; completion
/// supersedes any prior failure and a later failure never demotes a
/// completed task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskProgress {
    pub completed_tasks: Vec<String>,
    pub failed_tasks: Vec<String>,
    pub last_updated: BTreeMap<String, DateTime<Utc>>,
    pub iteration_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
}

impl TaskProgress {
    pub fn add_completed_task(&mut self, task: &str) {
        if !self.completed_tasks.iter().any(|t| t == task) {
            self.completed_tasks.push(task.to_string());
            self.last_updated.insert(task.to_string(), Utc::now());
            self.success_count += 1;
        }
        self.failed_tasks.retain(|t| t != task);
    }

    pub fn add_failed_task(&mut self, task: &str) {
        if !self.failed_tasks.iter().any(|t| t == task)
            && !self.completed_tasks.iter().any(|t| t == task)
        {
            self.failed_tasks.push(task.to_string());
            self.last_updated.insert(task.to_string(), Utc::now());
            self.failure_count += 1;
        }
    }

    pub fn increment_iteration(&mut self) {
        self.iteration_count += 1;
    }

    /// Successes over all decided outcomes; 0 when nothing is decided yet.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return 0.0;
        }
        self.success_count as f64 / total as f64
    }

    /// Number of completed tasks.
    pub fn progress(&self) -> usize {
        self.completed_tasks.len()
    }
}

/// Decides what to learn next and assembles the context the action agent
/// conditions on. Exclusively owns the progress record.
pub struct CurriculumAgent {
    config: CurriculumConfig,
    llm: Arc<dyn TextCompletion>,
    snapshot: ProjectSnapshot,
    prompts: PromptLibrary,
    progress: Mutex<TaskProgress>,
    qa: Mutex<UsageCache<QaPair>>,
}

impl CurriculumAgent {
    pub fn new(
        config: CurriculumConfig,
        llm: Arc<dyn TextCompletion>,
        snapshot: ProjectSnapshot,
        prompts: PromptLibrary,
    ) -> KaichiResult<Self> {
        config.validate()?;
        fs::create_dir_all(config.ckpt_dir.join("curriculum"))?;

        let mut progress = TaskProgress::default();
        let mut qa = UsageCache::new(config.cache_size);
        if config.resume {
            match Self::load_state(&config) {
                Ok((saved_progress, saved_qa)) => {
                    info!(
                        completed = saved_progress.completed_tasks.len(),
                        failed = saved_progress.failed_tasks.len(),
                        "Loaded curriculum progress"
                    );
                    progress = saved_progress;
                    for (question, pair) in saved_qa {
                        qa.add(question, pair);
                    }
                }
                Err(e) => warn!(error = %e, "Failed to load curriculum state"),
            }
        }

        Ok(Self {
            config,
            llm,
            snapshot,
            prompts,
            progress: Mutex::new(progress),
            qa: Mutex::new(qa),
        })
    }

    /// Decide the next task and assemble its context.
    pub async fn propose_next_task(&self) -> KaichiResult<(String, String)> {
        match self.config.mode {
            AgentMode::Auto => self.propose_ai_task().await,
            AgentMode::Manual => self.propose_manual_task().await,
        }
    }

    async fn propose_ai_task(&self) -> KaichiResult<(String, String)> {
        let system = {
            let progress = self.lock_progress();
            let completed = join_or_none(&progress.completed_tasks);
            let failed = join_or_none(&progress.failed_tasks);
            self.prompts.render(
                "curriculum/task_proposal",
                &[
                    ("completed_tasks", completed.as_str()),
                    ("failed_tasks", failed.as_str()),
                    ("iteration_count", &progress.iteration_count.to_string()),
                    ("success_rate", &format!("{:.2}", progress.success_rate())),
                    (
                        "project",
                        &self
                            .snapshot
                            .format_for_context(self.config.max_key_file_chars),
                    ),
                ],
            )?
        };

        for attempt in 1..=self.config.max_retries {
            let proposal = async {
                let reply = self
                    .llm
                    .complete(
                        CompletionRequest::new(
                            "Based on the current progress and project observation, propose the next task.",
                            "CurriculumAgent",
                        )
                        .with_system(system.clone()),
                    )
                    .await?;

                let body = extract_json_from_markdown(&reply.answer);
                let parsed: serde_json::Value = serde_json::from_str(&body)
                    .map_err(|e| KaichiError::Parse(format!("Invalid task proposal: {e}")))?;
                parsed
                    .get("next_task")
                    .and_then(serde_json::Value::as_str)
                    .map(String::from)
                    .ok_or_else(|| {
                        KaichiError::Parse("No next_task in proposal answer".to_string())
                    })
            }
            .await;

            match proposal {
                Ok(task) => {
                    info!(task = %task, "Proposed next task");
                    let context = self.get_task_context(&task).await?;
                    return Ok((task, context));
                }
                Err(e) => warn!(attempt, error = %e, "Task proposal attempt failed"),
            }
        }

        Err(KaichiError::Curriculum(format!(
            "Task proposal failed after {} attempts",
            self.config.max_retries
        )))
    }

    async fn propose_manual_task(&self) -> KaichiResult<(String, String)> {
        let mut stdout = std::io::stdout();
        write!(stdout, "Enter the next task: ")?;
        stdout.flush()?;

        let mut task = String::new();
        std::io::stdin().read_line(&mut task)?;
        let task = task.trim().to_string();
        if task.is_empty() {
            return Err(KaichiError::Curriculum("Empty task".to_string()));
        }

        let context = self.get_task_context(&task).await?;
        Ok((task, context))
    }

    /// Build the free-form context for a task: the task restatement, the
    /// rendered project snapshot, and a Q&A section derived from the
    /// source material. Q&A failures degrade to the snapshot-only context.
    pub async fn get_task_context(&self, task: &str) -> KaichiResult<String> {
        let cached = self
            .lock_qa()
            .get(task)
            .filter(|pair| pair.answer.is_some())
            .cloned();
        if let Some(pair) = cached {
            return Ok(self.format_context(task, &[pair]));
        }

        let (questions, concepts) = self.run_qa_step1(task).await;
        {
            let mut qa = self.lock_qa();
            for (question, concept) in questions.iter().zip(&concepts) {
                qa.add(
                    question.clone(),
                    QaPair {
                        question: question.clone(),
                        concept: concept.clone(),
                        answer: None,
                        timestamp: Utc::now(),
                    },
                );
            }
        }

        let answers = self.run_qa_step2(&questions).await;

        let pairs = {
            let mut qa = self.lock_qa();
            for (question, answer) in questions.iter().zip(&answers) {
                if let (Some(answer), Some(pair)) = (answer, qa.get_mut(question)) {
                    pair.answer = Some(answer.clone());
                    pair.timestamp = Utc::now();
                }
            }
            questions
                .iter()
                .filter_map(|q| qa.get(q).cloned())
                .collect::<Vec<_>>()
        };

        if let Err(e) = self.persist_qa() {
            warn!(error = %e, "Failed to persist QA pairs");
        }

        Ok(self.format_context(task, &pairs))
    }

    /// Record a rollout outcome and persist the progress record.
    pub fn update_exploration_progress(&self, task: &str, success: bool) -> KaichiResult<()> {
        {
            let mut progress = self.lock_progress();
            if success {
                info!(task = %task, "Task completed");
                progress.add_completed_task(task);
            } else {
                info!(task = %task, "Task failed");
                progress.add_failed_task(task);
            }
            progress.increment_iteration();
            self.persist_progress(&progress)?;
        }
        Ok(())
    }

    /// A copy of the current progress record.
    pub fn progress(&self) -> TaskProgress {
        self.lock_progress().clone()
    }

    async fn run_qa_step1(&self, task: &str) -> (Vec<String>, Vec<String>) {
        let result = async {
            let system = self.prompts.render("curriculum/qa_step1", &[("task", task)])?;
            let reply = self
                .llm
                .complete(
                    CompletionRequest::new(
                        format!("Source Material:\n{}", self.config.source_content),
                        "CurriculumAgent",
                    )
                    .with_system(system),
                )
                .await?;
            Ok::<_, KaichiError>(reply.answer)
        }
        .await;

        match result {
            Ok(answer) => {
                let mut questions = Vec::new();
                let mut concepts = Vec::new();
                for caps in QA_PAIR.captures_iter(&answer) {
                    questions.push(caps[2].trim().to_string());
                    concepts.push(caps[3].trim().to_string());
                }
                if questions.is_empty() {
                    warn!("No question-concept pairs in QA answer");
                }
                (questions, concepts)
            }
            Err(e) => {
                warn!(error = %e, "QA step 1 failed");
                (Vec::new(), Vec::new())
            }
        }
    }

    async fn run_qa_step2(&self, questions: &[String]) -> Vec<Option<String>> {
        let mut answers = Vec::with_capacity(questions.len());
        for question in questions {
            let result = async {
                let system = self.prompts.load("curriculum/qa_step2")?;
                let reply = self
                    .llm
                    .complete(
                        CompletionRequest::new(
                            format!(
                                "Question:\n{question}\n\nSource Material:\n{}",
                                self.config.source_content
                            ),
                            "CurriculumAgent",
                        )
                        .with_system(system),
                    )
                    .await?;
                Ok::<_, KaichiError>(reply.answer)
            }
            .await;

            match result {
                Ok(answer) => answers.push(Some(answer)),
                Err(e) => {
                    warn!(error = %e, "QA step 2 failed for a question");
                    answers.push(None);
                }
            }
        }
        answers
    }

    fn format_context(&self, task: &str, pairs: &[QaPair]) -> String {
        let mut sections = vec![
            format!("Task: {task}"),
            self.snapshot
                .format_for_context(self.config.max_key_file_chars),
        ];

        if !pairs.is_empty() {
            let concepts = pairs
                .iter()
                .map(|p| format!("- {}", p.concept))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("Key Concepts:\n{concepts}"));

            let answered = pairs
                .iter()
                .filter_map(|p| {
                    p.answer
                        .as_ref()
                        .map(|a| format!("Question:\n{}\nAnswer:\n{a}", p.question))
                })
                .collect::<Vec<_>>();
            if !answered.is_empty() {
                sections.push(format!("Technical Q&A:\n{}", answered.join("\n\n")));
            }
        }

        sections.join("\n\n")
    }

    fn lock_progress(&self) -> MutexGuard<'_, TaskProgress> {
        match self.progress.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_qa(&self) -> MutexGuard<'_, UsageCache<QaPair>> {
        match self.qa.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn progress_path(config: &CurriculumConfig) -> PathBuf {
        config.ckpt_dir.join("curriculum/progress.json")
    }

    fn qa_path(config: &CurriculumConfig) -> PathBuf {
        config.ckpt_dir.join("curriculum/qa_pairs.json")
    }

    fn load_state(
        config: &CurriculumConfig,
    ) -> KaichiResult<(TaskProgress, BTreeMap<String, QaPair>)> {
        let progress_path = Self::progress_path(config);
        let progress = if progress_path.exists() {
            serde_json::from_str(&fs::read_to_string(progress_path)?)?
        } else {
            TaskProgress::default()
        };

        let qa_path = Self::qa_path(config);
        let qa = if qa_path.exists() {
            serde_json::from_str(&fs::read_to_string(qa_path)?)?
        } else {
            BTreeMap::new()
        };

        Ok((progress, qa))
    }

    fn persist_progress(&self, progress: &TaskProgress) -> KaichiResult<()> {
        fs::write(
            Self::progress_path(&self.config),
            serde_json::to_string_pretty(progress)?,
        )?;
        Ok(())
    }

    fn persist_qa(&self) -> KaichiResult<()> {
        let qa = self.lock_qa();
        let entries: BTreeMap<&String, &QaPair> = qa.iter().collect();
        let serialized = serde_json::to_string_pretty(&entries)?;
        drop(qa);
        fs::write(Self::qa_path(&self.config), serialized)?;
        Ok(())
    }
}

fn join_or_none(tasks: &[String]) -> String {
    if tasks.is_empty() {
        "None".to_string()
    } else {
        tasks.join(", ")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kaichi_llm::LlmReply;
    use kaichi_observer::{CodeStatistics, ProjectMeta, ProjectSnapshot};
    use std::collections::VecDeque;

    struct ScriptedLlm {
        replies: Mutex<VecDeque<String>>,
    }

    impl ScriptedLlm {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().map(|r| (*r).to_string()).collect()),
            })
        }
    }

    #[async_trait]
    impl TextCompletion for ScriptedLlm {
        async fn complete(&self, _request: CompletionRequest) -> KaichiResult<LlmReply> {
            let answer = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| KaichiError::Llm("No scripted reply left".to_string()))?;
            Ok(LlmReply::new(answer))
        }
    }

    fn snapshot() -> ProjectSnapshot {
        ProjectSnapshot {
            directory_structure: vec!["core/app.py".to_string()],
            key_files: BTreeMap::new(),
            meta: ProjectMeta {
                file_count: 1,
                dir_count: 1,
                total_size: 10,
            },
            log_summary: vec![],
            code_statistics: CodeStatistics::default(),
            code_outline: vec!["core/app.py: async def main".to_string()],
        }
    }

    fn prompts(dir: &std::path::Path) -> PromptLibrary {
        let curriculum = dir.join("curriculum");
        fs::create_dir_all(&curriculum).unwrap();
        fs::write(
            curriculum.join("task_proposal.txt"),
            "Done: {{completed_tasks}}\nFailed: {{failed_tasks}}\nIteration: {{iteration_count}}\nRate: {{success_rate}}\n{{project}}",
        )
        .unwrap();
        fs::write(curriculum.join("qa_step1.txt"), "Ask about {{task}}").unwrap();
        fs::write(curriculum.join("qa_step2.txt"), "Answer the question.").unwrap();
        PromptLibrary::new(dir)
    }

    fn config(ckpt: &std::path::Path) -> CurriculumConfig {
        CurriculumConfig {
            ckpt_dir: ckpt.to_path_buf(),
            mode: AgentMode::Auto,
            max_retries: 3,
            cache_size: 100,
            resume: false,
            source_content: "source".to_string(),
            max_key_file_chars: 500,
        }
    }

    #[tokio::test]
    async fn test_task_extracted_from_fenced_json() {
        let ckpt = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new(&[
            "```json\n{\"next_task\":\"do X\"}\n```",
            "Question 1: What files exist?\nConcept 1: Project layout",
            "There is one file.",
        ]);
        let agent =
            CurriculumAgent::new(config(ckpt.path()), llm, snapshot(), prompts(tmp.path())).unwrap();

        let (task, context) = agent.propose_next_task().await.unwrap();
        assert_eq!(task, "do X");
        assert!(context.contains("Task: do X"));
        assert!(context.contains("Project layout"));
        assert!(context.contains("There is one file."));
    }

    #[tokio::test]
    async fn test_proposal_retries_on_bad_json() {
        let ckpt = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new(&[
            "not json",
            "{\"next_task\": \"recover\"}",
            "no pairs",
        ]);
        let agent =
            CurriculumAgent::new(config(ckpt.path()), llm, snapshot(), prompts(tmp.path())).unwrap();

        let (task, context) = agent.propose_next_task().await.unwrap();
        assert_eq!(task, "recover");
        // QA produced nothing; the context still carries the snapshot.
        assert!(context.contains("core/app.py"));
    }

    #[tokio::test]
    async fn test_proposal_exhaustion_errors() {
        let ckpt = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new(&["junk", "junk", "junk"]);
        let agent =
            CurriculumAgent::new(config(ckpt.path()), llm, snapshot(), prompts(tmp.path())).unwrap();

        assert!(matches!(
            agent.propose_next_task().await,
            Err(KaichiError::Curriculum(_))
        ));
    }

    #[tokio::test]
    async fn test_progress_updates_persist() {
        let ckpt = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::new(&[]);
        let agent =
            CurriculumAgent::new(config(ckpt.path()), llm, snapshot(), prompts(tmp.path())).unwrap();

        agent.update_exploration_progress("task-a", true).unwrap();
        agent.update_exploration_progress("task-b", false).unwrap();

        let saved: TaskProgress = serde_json::from_str(
            &fs::read_to_string(ckpt.path().join("curriculum/progress.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(saved.completed_tasks, vec!["task-a"]);
        assert_eq!(saved.failed_tasks, vec!["task-b"]);
        assert_eq!(saved.iteration_count, 2);
        assert_eq!(saved.success_count, 1);
        assert_eq!(saved.failure_count, 1);
    }

    #[test]
    fn test_completion_supersedes_failure() {
        let mut progress = TaskProgress::default();
        progress.add_failed_task("t");
        assert_eq!(progress.failed_tasks, vec!["t"]);

        progress.add_completed_task("t");
        assert_eq!(progress.completed_tasks, vec!["t"]);
        assert!(progress.failed_tasks.is_empty());

        // A later failure never demotes a completed task.
        progress.add_failed_task("t");
        assert!(progress.failed_tasks.is_empty());
        assert_eq!(progress.failure_count, 1);
    }

    #[test]
    fn test_success_rate_zero_without_outcomes() {
        let progress = TaskProgress::default();
        assert_eq!(progress.success_rate(), 0.0);
    }

    #[test]
    fn test_progress_round_trip() {
        let mut progress = TaskProgress::default();
        progress.add_completed_task("a");
        progress.add_failed_task("b");
        progress.increment_iteration();
        progress.increment_iteration();

        let json = serde_json::to_string(&progress).unwrap();
        let restored: TaskProgress = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.completed_tasks, progress.completed_tasks);
        assert_eq!(restored.failed_tasks, progress.failed_tasks);
        assert_eq!(restored.iteration_count, 2);
        assert_eq!(restored.success_count, 1);
        assert_eq!(restored.failure_count, 1);
        assert_eq!(
            restored.last_updated.keys().collect::<Vec<_>>(),
            progress.last_updated.keys().collect::<Vec<_>>()
        );
    }
}
