use crate::{KaichiError, KaichiResult};
use std::path::PathBuf;

/// Loads prompt templates from a directory laid out as `<name>/<role>.txt`
/// (e.g. `curriculum/task_proposal.txt`) and renders them with
/// `{{placeholder}}` substitution.
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    dir: PathBuf,
}

impl PromptLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Load a template by its `<name>/<role>` key.
    pub fn load(&self, key: &str) -> KaichiResult<String> {
        let path = self.dir.join(format!("{key}.txt"));
        std::fs::read_to_string(&path).map_err(|e| {
            KaichiError::Config(format!("Cannot load prompt '{}': {e}", path.display()))
        })
    }

    /// Load a template and substitute every `{{key}}` token.
    pub fn render(&self, key: &str, vars: &[(&str, &str)]) -> KaichiResult<String> {
        Ok(render_template(&self.load(key)?, vars))
    }
}

/// Substitute `{{key}}` tokens in a template. Unknown tokens are left in
/// place so missing variables are visible in logs rather than silently
/// erased.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut rendered = template.to_string();
    for (key, value) in vars {
        rendered = rendered.replace(&format!("{{{{{key}}}}}"), value);
    }
    rendered
}
