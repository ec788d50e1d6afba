//! The skill library: Kaichi's long-term memory.
//!
//! Skills are named async functions promoted from successful rollouts.
//! Each lives in three places that must agree after every mutation: the
//! `skills.json` dictionary, a pair of versioned files on disk, and a
//! document in the external vector dataset.

mod manager;
mod store;

pub use manager::{SkillAnalysis, SkillManager, SkillManagerConfig, SkillReview};
pub use store::{SkillRecord, SkillStore};
