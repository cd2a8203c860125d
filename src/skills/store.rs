// SPDX-License-Identifier: MIT
//! Filesystem-backed skill store.
//!
//! Layout: `«root»/skills/«name»/SKILL.md` plus optional side directories
//! (`scripts/`, `references/`, `assets/`). Writes are atomic — temp file
//! then rename — and an overwritten SKILL.md leaves a timestamped backup
//! behind, pruned oldest-first past a small cap. The store tolerates a
//! missing root on load and skips unparseable skills with a warning.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::Serialize;
use tracing::{debug, warn};

use super::{parse_skill_md, to_skill_md, Skill, SkillState};

pub const SKILL_FILE: &str = "SKILL.md";
const SKILLS_DIR: &str = "skills";
const BACKUP_INFIX: &str = ".backup-";
const BACKUP_TIME_FORMAT: &str = "%Y%m%d-%H%M%S";
const MAX_BACKUPS: usize = 3;

/// Per-file cap for the side-file API.
pub const MAX_FILE_SIZE: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("skill not found: {0}")]
    NotFound(String),
    #[error("invalid file path: {0}")]
    InvalidPath(String),
    #[error("file exceeds {MAX_FILE_SIZE} byte limit")]
    TooLarge,
    #[error(transparent)]
    Skill(#[from] super::SkillError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct SkillFile {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreStatus {
    pub total_skills: usize,
    pub active_skills: usize,
}

pub struct SkillStore {
    root: PathBuf,
    skills: RwLock<HashMap<String, Skill>>,
}

impl SkillStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            skills: RwLock::new(HashMap::new()),
        }
    }

    fn skills_dir(&self) -> PathBuf {
        self.root.join(SKILLS_DIR)
    }

    fn skill_dir(&self, name: &str) -> PathBuf {
        self.skills_dir().join(name)
    }

    fn skill_path(&self, name: &str) -> PathBuf {
        self.skill_dir(name).join(SKILL_FILE)
    }

    /// Scan the skills directory, replacing the in-memory set. Invalid
    /// documents are skipped with a warning; a missing root is simply an
    /// empty store.
    pub fn load(&self) -> Result<(), StoreError> {
        let dir = self.skills_dir();
        let mut loaded = HashMap::new();

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                *self.skills.write().expect("skills lock poisoned") = loaded;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let path = entry.path().join(SKILL_FILE);
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), err = %e, "skipping unreadable skill");
                    continue;
                }
            };
            match parse_skill_md(&content).and_then(|s| s.validate().map(|_| s)) {
                Ok(skill) => {
                    // The directory name is authoritative when they disagree.
                    let dir_name = entry.file_name().to_string_lossy().into_owned();
                    if skill.name != dir_name {
                        warn!(
                            dir = %dir_name,
                            name = %skill.name,
                            "skill name does not match its directory; using frontmatter name"
                        );
                    }
                    loaded.insert(skill.name.clone(), skill);
                }
                Err(e) => {
                    warn!(path = %path.display(), err = %e, "skipping invalid skill");
                }
            }
        }

        debug!(count = loaded.len(), root = %self.root.display(), "skill store loaded");
        *self.skills.write().expect("skills lock poisoned") = loaded;
        Ok(())
    }

    pub fn list(&self) -> Vec<Skill> {
        let mut skills: Vec<Skill> = self
            .skills
            .read()
            .expect("skills lock poisoned")
            .values()
            .cloned()
            .collect();
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills
    }

    pub fn active(&self) -> Vec<Skill> {
        self.list()
            .into_iter()
            .filter(|s| s.state == SkillState::Active)
            .collect()
    }

    pub fn get(&self, name: &str) -> Result<Skill, StoreError> {
        self.skills
            .read()
            .expect("skills lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    pub fn has_content(&self) -> bool {
        !self.skills.read().expect("skills lock poisoned").is_empty()
    }

    pub fn status(&self) -> StoreStatus {
        let skills = self.skills.read().expect("skills lock poisoned");
        StoreStatus {
            total_skills: skills.len(),
            active_skills: skills
                .values()
                .filter(|s| s.state == SkillState::Active)
                .count(),
        }
    }

    /// Validate, serialize, back up any existing document and write
    /// atomically.
    pub fn save(&self, skill: &Skill) -> Result<(), StoreError> {
        skill.validate()?;
        let content = to_skill_md(skill)?;
        let path = self.skill_path(&skill.name);

        fs::create_dir_all(path.parent().expect("skill path has a parent"))?;
        if path.exists() {
            if let Err(e) = create_backup(&path) {
                warn!(path = %path.display(), err = %e, "backup failed; writing anyway");
            }
        }
        write_atomic(&path, content.as_bytes())?;

        self.skills
            .write()
            .expect("skills lock poisoned")
            .insert(skill.name.clone(), skill.clone());
        Ok(())
    }

    /// Remove the whole skill directory. Deleting a skill that does not
    /// exist is not an error.
    pub fn delete(&self, name: &str) -> Result<(), StoreError> {
        let dir = self.skill_dir(name);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.skills
            .write()
            .expect("skills lock poisoned")
            .remove(name);
        Ok(())
    }

    // ─── Side files ──────────────────────────────────────────────────────────

    pub fn list_files(&self, name: &str) -> Result<Vec<SkillFile>, StoreError> {
        self.get(name)?;
        let dir = self.skill_dir(name);
        let mut files = Vec::new();
        walk_files(&dir, &dir, &mut files)?;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    pub fn read_file(&self, name: &str, rel_path: &str) -> Result<Vec<u8>, StoreError> {
        self.get(name)?;
        let path = self.resolve_file(name, rel_path)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(rel_path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_file(&self, name: &str, rel_path: &str, data: &[u8]) -> Result<(), StoreError> {
        self.get(name)?;
        if data.len() > MAX_FILE_SIZE {
            return Err(StoreError::TooLarge);
        }
        let path = self.resolve_file(name, rel_path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&path, data)?;

        // Rewriting SKILL.md through the file API must keep the index
        // coherent.
        if rel_path == SKILL_FILE {
            self.load()?;
        }
        Ok(())
    }

    pub fn delete_file(&self, name: &str, rel_path: &str) -> Result<(), StoreError> {
        self.get(name)?;
        if rel_path == SKILL_FILE {
            return Err(StoreError::InvalidPath(
                "SKILL.md cannot be deleted through the file API".into(),
            ));
        }
        let path = self.resolve_file(name, rel_path)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reject traversal out of the skill directory.
    fn resolve_file(&self, name: &str, rel_path: &str) -> Result<PathBuf, StoreError> {
        if rel_path.is_empty() {
            return Err(StoreError::InvalidPath("empty path".into()));
        }
        let rel = Path::new(rel_path);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(StoreError::InvalidPath(rel_path.to_string()));
        }
        Ok(self.skill_dir(name).join(rel))
    }
}

fn walk_files(base: &Path, dir: &Path, out: &mut Vec<SkillFile>) -> Result<(), StoreError> {
    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_files(base, &path, out)?;
        } else if let Ok(meta) = entry.metadata() {
            let rel = path
                .strip_prefix(base)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            // Backups are bookkeeping, not content.
            if rel.contains(BACKUP_INFIX) {
                continue;
            }
            out.push(SkillFile {
                path: rel,
                size: meta.len(),
            });
        }
    }
    Ok(())
}

/// Temp-file-then-rename. The temp file sits next to the target so the
/// rename stays on one filesystem.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{file_name}.tmp"));
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Copy the current file to `«path».backup-«YYYYMMDD-HHMMSS»` and prune old
/// backups beyond [`MAX_BACKUPS`], oldest first.
fn create_backup(path: &Path) -> Result<(), StoreError> {
    let stamp = chrono::Local::now().format(BACKUP_TIME_FORMAT);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let backup = path.with_file_name(format!("{file_name}{BACKUP_INFIX}{stamp}"));
    fs::copy(path, &backup)?;
    prune_backups(path)?;
    Ok(())
}

fn prune_backups(path: &Path) -> Result<(), StoreError> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    let prefix = format!(
        "{}{BACKUP_INFIX}",
        path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    );

    let mut backups: Vec<PathBuf> = fs::read_dir(dir)?
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
        .map(|e| e.path())
        .collect();
    if backups.len() <= MAX_BACKUPS {
        return Ok(());
    }
    // The timestamp suffix makes lexicographic order chronological.
    backups.sort();
    for stale in &backups[..backups.len() - MAX_BACKUPS] {
        let _ = fs::remove_file(stale);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::{OutputFormat, WorkflowOutput};
    use tempfile::TempDir;

    fn sample_skill(name: &str, state: SkillState) -> Skill {
        Skill {
            name: name.into(),
            description: "A test skill".into(),
            state,
            body: "\n# Body\n\nContent here.\n".into(),
            ..Skill::default()
        }
    }

    #[test]
    fn load_tolerates_missing_root() {
        let dir = TempDir::new().unwrap();
        let store = SkillStore::new(dir.path().join("does-not-exist"));
        store.load().unwrap();
        assert!(!store.has_content());
    }

    #[test]
    fn save_get_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = SkillStore::new(dir.path());
        let skill = sample_skill("greeting", SkillState::Active);
        store.save(&skill).unwrap();

        let got = store.get("greeting").unwrap();
        assert_eq!(got.description, "A test skill");

        // A second store over the same root sees the same document.
        let store2 = SkillStore::new(dir.path());
        store2.load().unwrap();
        let again = store2.get("greeting").unwrap();
        assert_eq!(again.body, skill.body);
        assert_eq!(again.state, SkillState::Active);
    }

    #[test]
    fn save_rejects_invalid_skills() {
        let dir = TempDir::new().unwrap();
        let store = SkillStore::new(dir.path());
        let mut skill = sample_skill("ok", SkillState::Draft);
        skill.name = "not ok!".into();
        assert!(store.save(&skill).is_err());
    }

    #[test]
    fn delete_removes_directory() {
        let dir = TempDir::new().unwrap();
        let store = SkillStore::new(dir.path());
        store.save(&sample_skill("gone", SkillState::Draft)).unwrap();
        store.write_file("gone", "scripts/run.sh", b"#!/bin/sh\n").unwrap();

        store.delete("gone").unwrap();
        assert!(matches!(store.get("gone"), Err(StoreError::NotFound(_))));
        assert!(!dir.path().join("skills/gone").exists());

        // Deleting again is fine.
        store.delete("gone").unwrap();
    }

    #[test]
    fn load_skips_invalid_documents() {
        let dir = TempDir::new().unwrap();
        let bad = dir.path().join("skills/broken");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join(SKILL_FILE), "no frontmatter here").unwrap();

        let store = SkillStore::new(dir.path());
        store.save(&sample_skill("good", SkillState::Draft)).unwrap();
        store.load().unwrap();

        assert!(store.get("good").is_ok());
        assert!(store.get("broken").is_err());
    }

    #[test]
    fn active_filter_and_status() {
        let dir = TempDir::new().unwrap();
        let store = SkillStore::new(dir.path());
        store.save(&sample_skill("a", SkillState::Active)).unwrap();
        store.save(&sample_skill("b", SkillState::Draft)).unwrap();
        store.save(&sample_skill("c", SkillState::Disabled)).unwrap();

        let active = store.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "a");

        let status = store.status();
        assert_eq!(status.total_skills, 3);
        assert_eq!(status.active_skills, 1);
    }

    #[test]
    fn overwrite_leaves_backups_with_pruning() {
        let dir = TempDir::new().unwrap();
        let store = SkillStore::new(dir.path());
        let mut skill = sample_skill("versioned", SkillState::Draft);
        store.save(&skill).unwrap();

        for i in 0..5 {
            skill.description = format!("revision {i}");
            store.save(&skill).unwrap();
        }

        let entries: Vec<String> = fs::read_dir(dir.path().join("skills/versioned"))
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains(BACKUP_INFIX))
            .collect();
        assert!(!entries.is_empty());
        assert!(entries.len() <= MAX_BACKUPS, "backups not pruned: {entries:?}");

        // The current document carries the last revision.
        let store2 = SkillStore::new(dir.path());
        store2.load().unwrap();
        assert_eq!(store2.get("versioned").unwrap().description, "revision 4");
    }

    #[test]
    fn file_api_roundtrip_and_listing() {
        let dir = TempDir::new().unwrap();
        let store = SkillStore::new(dir.path());
        store.save(&sample_skill("files", SkillState::Draft)).unwrap();

        store
            .write_file("files", "references/notes.md", b"# Notes")
            .unwrap();
        assert_eq!(store.read_file("files", "references/notes.md").unwrap(), b"# Notes");

        let listed = store.list_files("files").unwrap();
        let paths: Vec<&str> = listed.iter().map(|f| f.path.as_str()).collect();
        assert!(paths.contains(&"SKILL.md"));
        assert!(paths.contains(&"references/notes.md"));

        store.delete_file("files", "references/notes.md").unwrap();
        assert!(matches!(
            store.read_file("files", "references/notes.md"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn file_api_rejects_traversal_and_oversize() {
        let dir = TempDir::new().unwrap();
        let store = SkillStore::new(dir.path());
        store.save(&sample_skill("guarded", SkillState::Draft)).unwrap();

        assert!(matches!(
            store.write_file("guarded", "../escape.txt", b"x"),
            Err(StoreError::InvalidPath(_))
        ));
        assert!(matches!(
            store.read_file("guarded", "/etc/passwd"),
            Err(StoreError::InvalidPath(_))
        ));

        let big = vec![0u8; MAX_FILE_SIZE + 1];
        assert!(matches!(
            store.write_file("guarded", "assets/big.bin", &big),
            Err(StoreError::TooLarge)
        ));
    }

    #[test]
    fn files_for_unknown_skill_are_not_found() {
        let dir = TempDir::new().unwrap();
        let store = SkillStore::new(dir.path());
        assert!(matches!(
            store.list_files("ghost"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn executable_skill_roundtrips_workflow() {
        let dir = TempDir::new().unwrap();
        let store = SkillStore::new(dir.path());
        let doc = r#"---
name: pipeline
description: Two-step pipeline
state: active
workflow:
  - id: first
    tool: alpha__run
  - id: second
    tool: beta__run
    depends_on: [first]
output:
  format: merged
  include: [second]
---

Pipeline body.
"#;
        let skill = crate::skills::parse_skill_md(doc).unwrap();
        store.save(&skill).unwrap();

        let store2 = SkillStore::new(dir.path());
        store2.load().unwrap();
        let got = store2.get("pipeline").unwrap();
        assert_eq!(got.workflow.len(), 2);
        assert_eq!(got.workflow[1].depends_on, vec!["first"]);
        let output: WorkflowOutput = got.output.unwrap();
        assert_eq!(output.format, OutputFormat::Merged);
        assert_eq!(output.include, vec!["second"]);
    }
}
