//! The `kaichi` binary: configuration, logging, and the top-level
//! `learn` / `observe` / `skill` commands.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::KaichiConfig;
use kaichi_agents::{
    ActionAgent, ActionConfig, CriticAgent, CriticConfig, CurriculumAgent, CurriculumConfig,
};
use kaichi_core::PromptLibrary;
use kaichi_llm::build_client;
use kaichi_observer::ProjectObserver;
use kaichi_orchestrator::{Orchestrator, OrchestratorConfig};
use kaichi_sandbox::SandboxRunner;
use kaichi_skills::{SkillManager, SkillManagerConfig, SkillStore};
use kaichi_vectordb::{DifyDatasets, DifyDatasetsConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kaichi", about = "Kaichi — self-improving code-generation agent")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "kaichi.toml")]
    config: PathBuf,

    /// Log level filter (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the learning loop
    Learn {
        /// Fixed task; omitted means the curriculum proposes tasks
        #[arg(long)]
        task: Option<String>,
        /// Number of loop iterations
        #[arg(long, default_value_t = 1)]
        maxloop: usize,
    },
    /// Scan the observed project and persist its snapshot
    Observe,
    /// Inspect the skill library
    Skill {
        #[command(subcommand)]
        action: SkillAction,
    },
}

#[derive(Subcommand)]
enum SkillAction {
    /// List locally stored skills
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let mut config = KaichiConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config '{}'", cli.config.display()))?;
    config.apply_env();

    init_tracing(&config, cli.log_level.as_deref())?;

    match cli.command {
        Commands::Observe => observe(&config),
        Commands::Skill {
            action: SkillAction::List,
        } => list_skills(&config),
        Commands::Learn { task, maxloop } => learn(&config, task, maxloop).await,
    }
}

fn init_tracing(config: &KaichiConfig, log_level: Option<&str>) -> anyhow::Result<()> {
    let filter = match log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    std::fs::create_dir_all(&config.paths.ckpt_dir)?;
    let log_file = std::fs::File::options()
        .create(true)
        .append(true)
        .open(config.paths.ckpt_dir.join("agent.log"))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(log_file)),
        )
        .init();
    Ok(())
}

fn observe(config: &KaichiConfig) -> anyhow::Result<()> {
    let observer = ProjectObserver::new(&config.paths.observation_dir, &config.paths.ckpt_dir);
    let snapshot = observer.observe()?;
    let path = observer.save(&snapshot)?;
    info!(
        files = snapshot.meta.file_count,
        dirs = snapshot.meta.dir_count,
        bytes = snapshot.meta.total_size,
        path = %path.display(),
        "Project observed"
    );
    println!("{}", serde_json::to_string_pretty(&snapshot.meta)?);
    Ok(())
}

fn list_skills(config: &KaichiConfig) -> anyhow::Result<()> {
    let store = SkillStore::new(&config.paths.ckpt_dir)?;
    let skills = store.load()?;
    if skills.is_empty() {
        println!("No skills stored yet.");
        return Ok(());
    }
    for (name, record) in &skills {
        println!("{name}\t{} bytes", record.code.len());
    }
    Ok(())
}

async fn learn(config: &KaichiConfig, task: Option<String>, maxloop: usize) -> anyhow::Result<()> {
    let prompts = PromptLibrary::new(&config.paths.prompt_dir);
    let llm_config = config.llm_config()?;
    let rewrite_model = llm_config.rewrite_model.clone();
    let llm = build_client(llm_config)?;

    // One fresh observation per run; the curriculum conditions on it.
    let observer = ProjectObserver::new(&config.paths.observation_dir, &config.paths.ckpt_dir);
    let snapshot = observer.observe()?;
    observer.save(&snapshot)?;

    let datasets = DifyDatasets::new(DifyDatasetsConfig {
        api_base: std::env::var("DIFY_API_BASE").unwrap_or_default(),
        api_key: std::env::var("DIFY_DATASETS_API_KEY").unwrap_or_default(),
        request_timeout: 60,
    })?;
    let configured_id = std::env::var("DIFY_DATASETS_ID").ok();
    let dataset_id = datasets
        .resolve_dataset_id(configured_id.as_deref(), &config.skills.dataset_name)
        .await?;
    let datasets = Arc::new(datasets);

    let source_content = if config.curriculum.source_content.is_empty() {
        snapshot
            .key_files
            .get("README.md")
            .and_then(|c| c.clone())
            .unwrap_or_default()
    } else {
        config.curriculum.source_content.clone()
    };

    let curriculum = CurriculumAgent::new(
        CurriculumConfig {
            ckpt_dir: config.paths.ckpt_dir.clone(),
            mode: config.curriculum.mode,
            max_retries: config.curriculum.max_retries,
            cache_size: config.curriculum.cache_size,
            resume: config.resume,
            source_content,
            max_key_file_chars: 2000,
        },
        llm.clone(),
        snapshot,
        prompts.clone(),
    )?;

    let skills = Arc::new(SkillManager::new(
        SkillManagerConfig {
            retrieval_top_k: config.skills.retrieval_top_k,
            ckpt_dir: config.paths.ckpt_dir.clone(),
            resume: config.resume,
            dataset_name: config.skills.dataset_name.clone(),
            cache_size: config.skills.cache_size,
        },
        llm.clone(),
        datasets,
        dataset_id,
        prompts.clone(),
    )?);

    let action = ActionAgent::new(
        ActionConfig {
            max_retries: config.curriculum.max_retries,
            cache_size: config.skills.cache_size,
            rewrite_model: Some(rewrite_model),
        },
        llm.clone(),
        skills.clone(),
        prompts.clone(),
    )?;

    let critic = CriticAgent::new(
        CriticConfig {
            ckpt_dir: config.paths.ckpt_dir.clone(),
            mode: config.curriculum.mode,
            max_retries: config.curriculum.max_retries,
            cache_size: config.skills.cache_size,
            resume: config.resume,
        },
        llm,
        prompts,
    )?;

    let sandbox = SandboxRunner::new(config.sandbox.clone())?;

    let mut orchestrator = Orchestrator::new(
        OrchestratorConfig {
            ckpt_dir: config.paths.ckpt_dir.clone(),
            max_retries: config.curriculum.max_retries as u64,
            backoff_secs: 3,
        },
        curriculum,
        action,
        critic,
        skills,
        sandbox,
    )?;

    let report = orchestrator.learn(task, maxloop).await?;
    orchestrator.close();

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
