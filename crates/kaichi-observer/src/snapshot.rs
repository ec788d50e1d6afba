use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregate counts over the scanned tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectMeta {
    pub file_count: u64,
    pub dir_count: u64,
    pub total_size: u64,
}

/// Line counts and extension frequencies over recognized code files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeStatistics {
    pub total_lines: u64,
    pub file_types: BTreeMap<String, u64>,
}

/// A single JSON document summarising the observed project. Immutable
/// once written; the curriculum agent only ever reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    /// Relative paths of every regular file, depth-first.
    pub directory_structure: Vec<String>,
    /// Key file name → full text, or null when absent/unreadable.
    pub key_files: BTreeMap<String, Option<String>>,
    pub meta: ProjectMeta,
    /// One head-of-file preview per file under `logs/`.
    pub log_summary: Vec<String>,
    pub code_statistics: CodeStatistics,
    /// One class/function summary line per Python source.
    pub code_outline: Vec<String>,
}

impl ProjectSnapshot {
    /// Render the snapshot as context text for prompt assembly: directory
    /// listing, truncated key files, meta counts, and code summaries.
    pub fn format_for_context(&self, max_key_file_chars: usize) -> String {
        let mut sections = Vec::new();

        sections.push(format!(
            "Project layout ({} files, {} directories, {} bytes):\n{}",
            self.meta.file_count,
            self.meta.dir_count,
            self.meta.total_size,
            self.directory_structure.join("\n")
        ));

        for (name, content) in &self.key_files {
            match content {
                Some(text) => {
                    let truncated: String = text.chars().take(max_key_file_chars).collect();
                    sections.push(format!("{name}:\n{truncated}"));
                }
                None => sections.push(format!("{name}: (absent)")),
            }
        }

        if !self.code_outline.is_empty() {
            sections.push(format!("Code outline:\n{}", self.code_outline.join("\n")));
        }

        if !self.log_summary.is_empty() {
            sections.push(format!("Recent logs:\n{}", self.log_summary.join("\n")));
        }

        sections.push(format!(
            "Code statistics: {} lines across {:?}",
            self.code_statistics.total_lines, self.code_statistics.file_types
        ));

        sections.join("\n\n")
    }
}
