//! Skill file registry
//!
//! Skill files are JSON documents exported from the skill composer:
//! `{ "token": "K", "data": [[...], ...] }`. The block refers to a skill by
//! name, which defaults to the file stem.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};
use crate::{BlockError, Result};

/// One row of skill data; exports mix header scalars and frame rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SkillRow {
    Scalar(i64),
    Row(Vec<i64>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    #[serde(default)]
    pub name: String,
    pub token: String,
    pub data: Vec<SkillRow>,
}

impl Skill {
    /// Data flattened one level into command parameters
    pub fn flatten(&self) -> Vec<i64> {
        self.data
            .iter()
            .flat_map(|row| match row {
                SkillRow::Scalar(v) => vec![*v],
                SkillRow::Row(values) => values.clone(),
            })
            .collect()
    }

    /// Completion token declared by the skill
    pub fn completion_token(&self) -> Option<char> {
        self.token.chars().next()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SkillRegistry {
    skills: HashMap<String, Skill>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, skill: Skill) {
        debug!("Registered skill '{}' (token {})", skill.name, skill.token);
        self.skills.insert(skill.name.clone(), skill);
    }

    pub fn get(&self, name: &str) -> Option<&Skill> {
        self.skills.get(name)
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// Parse one skill document, naming it `name` when the file has no name
    pub fn parse_skill(name: &str, contents: &str) -> Result<Skill> {
        let mut skill: Skill = serde_json::from_str(contents)?;
        if skill.name.is_empty() {
            skill.name = name.to_string();
        }
        if skill.token.is_empty() {
            return Err(BlockError::Script(format!("Skill '{}' has no token", skill.name)));
        }
        Ok(skill)
    }

    /// Load every `*.json` file in `dir`. Unreadable files are skipped with a warning.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let loaded = std::fs::read_to_string(&path)
                .map_err(BlockError::from)
                .and_then(|contents| Self::parse_skill(&stem, &contents));
            match loaded {
                Ok(skill) => registry.insert(skill),
                Err(e) => warn!("Skipping skill file {}: {}", path.display(), e),
            }
        }
        info!("Loaded {} skill(s) from {}", registry.len(), dir.display());
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_flatten() {
        let skill = SkillRegistry::parse_skill(
            "hello",
            r#"{"token": "K", "data": [-2, 0, 0, 1, [0, 0, 30, 4], [10, 10, 0, 4]]}"#,
        )
        .unwrap();
        assert_eq!(skill.name, "hello");
        assert_eq!(skill.completion_token(), Some('K'));
        assert_eq!(skill.flatten(), vec![-2, 0, 0, 1, 0, 0, 30, 4, 10, 10, 0, 4]);
    }

    #[test]
    fn test_declared_name_wins() {
        let skill = SkillRegistry::parse_skill("file", r#"{"name": "wave", "token": "K", "data": []}"#).unwrap();
        assert_eq!(skill.name, "wave");
        assert!(SkillRegistry::parse_skill("x", r#"{"token": "", "data": []}"#).is_err());
    }

    #[test]
    fn test_load_dir() {
        let dir = std::env::temp_dir().join(format!("skills-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("sit.json"), r#"{"token": "K", "data": [[1, 2]]}"#).unwrap();
        std::fs::write(dir.join("broken.json"), "{").unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let registry = SkillRegistry::load_dir(&dir).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("sit").unwrap().flatten(), vec![1, 2]);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
