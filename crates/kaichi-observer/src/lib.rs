//! Project observation: scan a target project directory and distill it
//! into a single JSON snapshot the curriculum agent can condition on.
//!
//! The snapshot is written atomically to the target directory so every
//! other component reads a stable, cheap view instead of re-walking the
//! tree.

mod outline;
mod snapshot;

pub use snapshot::{CodeStatistics, ProjectMeta, ProjectSnapshot};

use kaichi_core::{KaichiError, KaichiResult};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File names read in full when present at the project root.
const KEY_FILES: &[&str] = &["README.md", "config.yaml"];

/// Extensions counted as code for the line statistics.
const CODE_EXTENSIONS: &[&str] = &["py", "js", "java", "cpp"];

/// Lines taken from the head of each log file.
const LOG_PREVIEW_LINES: usize = 5;

/// Scans a source directory and persists a [`ProjectSnapshot`] into a
/// target directory.
pub struct ProjectObserver {
    source_dir: PathBuf,
    target_dir: PathBuf,
}

impl ProjectObserver {
    pub fn new(source_dir: impl Into<PathBuf>, target_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            target_dir: target_dir.into(),
        }
    }

    /// Walk the source tree and build the snapshot. Fails only when the
    /// source directory itself is unreadable; individual unreadable files
    /// are recorded as null and skipped.
    pub fn observe(&self) -> KaichiResult<ProjectSnapshot> {
        if !self.source_dir.is_dir() {
            return Err(KaichiError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Source directory missing: {}", self.source_dir.display()),
            )));
        }

        let mut walk = Walk::default();
        walk.visit(&self.source_dir, &self.source_dir)?;

        let key_files = self.extract_key_files();
        let log_summary = self.summarize_logs();
        let code_outline = self.outline_code(&walk.files);
        let code_statistics = self.analyze_code(&walk.files);

        Ok(ProjectSnapshot {
            directory_structure: walk
                .files
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            key_files,
            meta: ProjectMeta {
                file_count: walk.file_count,
                dir_count: walk.dir_count,
                total_size: walk.total_size,
            },
            log_summary,
            code_statistics,
            code_outline,
        })
    }

    /// Persist the snapshot atomically as `project_observation.json` in
    /// the target directory.
    pub fn save(&self, snapshot: &ProjectSnapshot) -> KaichiResult<PathBuf> {
        fs::create_dir_all(&self.target_dir)?;
        let path = self.target_dir.join("project_observation.json");
        let tmp = self.target_dir.join("project_observation.json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(snapshot)?)?;
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), "Saved project observation");
        Ok(path)
    }

    fn extract_key_files(&self) -> BTreeMap<String, Option<String>> {
        let mut key_files = BTreeMap::new();
        for name in KEY_FILES {
            let path = self.source_dir.join(name);
            let content = match fs::read_to_string(&path) {
                Ok(content) => Some(content),
                Err(e) => {
                    if path.exists() {
                        warn!(file = %name, error = %e, "Failed to read key file");
                    }
                    None
                }
            };
            key_files.insert((*name).to_string(), content);
        }
        key_files
    }

    fn summarize_logs(&self) -> Vec<String> {
        let log_dir = self.source_dir.join("logs");
        let mut summaries = Vec::new();
        let Ok(entries) = fs::read_dir(&log_dir) else {
            return summaries;
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        paths.sort();
        for path in paths {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            match fs::read_to_string(&path) {
                Ok(content) => {
                    let head: Vec<&str> = content.lines().take(LOG_PREVIEW_LINES).collect();
                    summaries.push(format!("{name}: {}", head.join(" | ")));
                }
                Err(e) => warn!(file = %name, error = %e, "Failed to read log file"),
            }
        }
        summaries
    }

    fn analyze_code(&self, files: &[PathBuf]) -> CodeStatistics {
        let mut stats = CodeStatistics::default();
        for rel in files {
            let Some(ext) = rel.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if !CODE_EXTENSIONS.contains(&ext) {
                continue;
            }
            match fs::read_to_string(self.source_dir.join(rel)) {
                Ok(content) => {
                    stats.total_lines += content.lines().count() as u64;
                    *stats.file_types.entry(format!(".{ext}")).or_insert(0) += 1;
                }
                Err(e) => warn!(file = %rel.display(), error = %e, "Failed to analyze code file"),
            }
        }
        stats
    }

    fn outline_code(&self, files: &[PathBuf]) -> Vec<String> {
        let mut outlines = Vec::new();
        for rel in files {
            if rel.extension().and_then(|e| e.to_str()) != Some("py") {
                continue;
            }
            let Ok(source) = fs::read_to_string(self.source_dir.join(rel)) else {
                continue;
            };
            if let Some(line) = outline::outline_python(&rel.display().to_string(), &source) {
                outlines.push(line);
            }
        }
        outlines
    }
}

/// Depth-first walk accumulator. Symlinks are recorded as entries but
/// never followed, so the scan cannot escape the root.
#[derive(Default)]
struct Walk {
    files: Vec<PathBuf>,
    file_count: u64,
    dir_count: u64,
    total_size: u64,
}

impl Walk {
    fn visit(&mut self, root: &Path, dir: &Path) -> KaichiResult<()> {
        let mut entries: Vec<_> = fs::read_dir(dir)?.filter_map(Result::ok).collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_symlink() {
                continue;
            }
            if file_type.is_dir() {
                self.dir_count += 1;
                self.visit(root, &path)?;
            } else if file_type.is_file() {
                self.file_count += 1;
                if let Ok(meta) = entry.metadata() {
                    self.total_size += meta.len();
                }
                if let Ok(rel) = path.strip_prefix(root) {
                    self.files.push(rel.to_path_buf());
                }
            }
        }
        Ok(())
    }
}
