use kaichi_core::KaichiResult;
use kaichi_sandbox::ExecutionState;
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Everything recorded about one step, alongside the executed script.
#[derive(Debug, Serialize)]
pub struct StepRecord<'a> {
    pub task: &'a str,
    pub program_name: &'a str,
    pub exec_code: &'a str,
    pub state: &'a ExecutionState,
    pub success: bool,
    pub critique: &'a str,
}

/// Write `step_NNN.py` and `step_NNN.json` into the rollout's artifact
/// directory. Called on success and failure paths alike so failed steps
/// stay diagnosable offline.
pub fn write_step_artifacts(
    dir: &Path,
    step: u64,
    script: &str,
    record: &StepRecord<'_>,
) -> KaichiResult<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(format!("step_{step:03}.py")), script)?;
    fs::write(
        dir.join(format!("step_{step:03}.json")),
        serde_json::to_string_pretty(record)?,
    )?;
    Ok(())
}
