use kaichi_core::{KaichiError, KaichiResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// A persisted skill: the entry function's source, its JSON-Schema
/// description, and the id of its document in the vector dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillRecord {
    pub code: String,
    pub description: String,
    pub document_id: String,
}

/// The on-disk half of the skill library.
///
/// Layout under `<ckpt>/skill/`:
/// - `skills.json` — the authoritative name → record dictionary
/// - `code/<name[Vk]>.py` — skill source, one file per version
/// - `description/<name[Vk]>.txt` — JSON-Schema text, one per version
///
/// Version stems are dense: `name`, `nameV2`, `nameV3`, …
pub struct SkillStore {
    root: PathBuf,
}

impl SkillStore {
    pub fn new(ckpt_dir: impl AsRef<Path>) -> KaichiResult<Self> {
        let root = ckpt_dir.as_ref().join("skill");
        fs::create_dir_all(root.join("code"))?;
        fs::create_dir_all(root.join("description"))?;
        Ok(Self { root })
    }

    fn dict_path(&self) -> PathBuf {
        self.root.join("skills.json")
    }

    fn code_path(&self, stem: &str) -> PathBuf {
        self.root.join("code").join(format!("{stem}.py"))
    }

    fn description_path(&self, stem: &str) -> PathBuf {
        self.root.join("description").join(format!("{stem}.txt"))
    }

    /// Load the skill dictionary; an absent file is an empty library.
    pub fn load(&self) -> KaichiResult<BTreeMap<String, SkillRecord>> {
        let path = self.dict_path();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let data = fs::read_to_string(&path)?;
        serde_json::from_str(&data)
            .map_err(|e| KaichiError::Skill(format!("Corrupt skills.json: {e}")))
    }

    /// Persist the skill dictionary atomically.
    pub fn persist(&self, skills: &BTreeMap<String, SkillRecord>) -> KaichiResult<()> {
        let tmp = self.root.join("skills.json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(skills)?)?;
        fs::rename(&tmp, self.dict_path())?;
        Ok(())
    }

    /// Pick the filesystem stem for a new version of `name`: the bare name
    /// if unused, otherwise `nameVk` for the smallest k ≥ 2 not on disk.
    pub fn next_stem(&self, name: &str) -> String {
        if !self.code_path(name).exists() {
            return name.to_string();
        }
        let mut k = 2u32;
        loop {
            let stem = format!("{name}V{k}");
            if !self.code_path(&stem).exists() {
                return stem;
            }
            k += 1;
        }
    }

    /// Write the two files backing a skill version.
    pub fn write_version(&self, stem: &str, code: &str, description: &str) -> KaichiResult<()> {
        fs::write(self.code_path(stem), code)?;
        fs::write(self.description_path(stem), description)?;
        Ok(())
    }

    /// Check that every live name has both of its files on disk and that
    /// its version suffixes are dense.
    pub fn check_integrity(&self, skills: &BTreeMap<String, SkillRecord>) -> KaichiResult<()> {
        for name in skills.keys() {
            if !self.code_path(name).exists() || !self.description_path(name).exists() {
                return Err(KaichiError::Invariant(format!(
                    "Skill '{name}' is missing its on-disk files"
                )));
            }
            let mut k = 2u32;
            while self.code_path(&format!("{name}V{k}")).exists() {
                if !self.description_path(&format!("{name}V{k}")).exists() {
                    return Err(KaichiError::Invariant(format!(
                        "Skill '{name}' version V{k} is missing its description"
                    )));
                }
                k += 1;
            }
        }
        Ok(())
    }

    /// Version stems currently on disk for a name, in order.
    pub fn versions(&self, name: &str) -> Vec<String> {
        let mut stems = Vec::new();
        if self.code_path(name).exists() {
            stems.push(name.to_string());
        }
        let mut k = 2u32;
        loop {
            let stem = format!("{name}V{k}");
            if !self.code_path(&stem).exists() {
                return stems;
            }
            stems.push(stem);
            k += 1;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_stems_are_dense() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SkillStore::new(tmp.path()).unwrap();

        assert_eq!(store.next_stem("hello"), "hello");
        store.write_version("hello", "c1", "d1").unwrap();
        assert_eq!(store.next_stem("hello"), "helloV2");
        store.write_version("helloV2", "c2", "d2").unwrap();
        assert_eq!(store.next_stem("hello"), "helloV3");

        assert_eq!(store.versions("hello"), vec!["hello", "helloV2"]);
    }

    #[test]
    fn test_persist_and_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SkillStore::new(tmp.path()).unwrap();

        let mut skills = BTreeMap::new();
        skills.insert(
            "greet".to_string(),
            SkillRecord {
                code: "async def greet(): ...".to_string(),
                description: "{}".to_string(),
                document_id: "d1".to_string(),
            },
        );
        store.persist(&skills).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["greet"].document_id, "d1");
    }

    #[test]
    fn test_integrity_detects_missing_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SkillStore::new(tmp.path()).unwrap();

        let mut skills = BTreeMap::new();
        skills.insert(
            "ghost".to_string(),
            SkillRecord {
                code: String::new(),
                description: String::new(),
                document_id: "d".to_string(),
            },
        );
        assert!(matches!(
            store.check_integrity(&skills),
            Err(KaichiError::Invariant(_))
        ));

        store.write_version("ghost", "code", "desc").unwrap();
        store.check_integrity(&skills).unwrap();
    }
}
