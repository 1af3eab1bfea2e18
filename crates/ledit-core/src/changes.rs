// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// Kind of file mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOp {
    Write,
    Edit,
}

/// One recorded file mutation inside a revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub op: FileOp,
    /// Content before the mutation; `None` when the file did not exist.
    pub old_content: Option<String>,
    pub new_content: String,
}

/// A bundle of file mutations associated with one user turn, committable
/// and rollback-able as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revision {
    pub revision_id: String,
    /// The user request this revision belongs to.
    pub instructions: String,
    pub changes: Vec<FileChange>,
}

/// Tracks file writes/edits for the current turn.
///
/// A revision is allocated lazily on the first mutation after `enable`, so
/// turns that never touch a file produce no revision at all.  `commit`
/// closes the revision; `rollback` replays the inverse sequence, newest
/// change first.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    enabled: bool,
    instructions: String,
    current: Option<Revision>,
    committed: Vec<Revision>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking for a new turn.  Does not allocate a revision yet.
    pub fn enable(&mut self, instructions: &str) {
        self.enabled = true;
        self.instructions = instructions.to_string();
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The open revision's id, if a mutation has occurred this turn.
    pub fn revision_id(&self) -> Option<&str> {
        self.current.as_ref().map(|r| r.revision_id.as_str())
    }

    pub fn change_count(&self) -> usize {
        self.current.as_ref().map(|r| r.changes.len()).unwrap_or(0)
    }

    pub fn tracked_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self
            .current
            .iter()
            .flat_map(|r| r.changes.iter().map(|c| c.path.clone()))
            .collect();
        files.sort();
        files.dedup();
        files
    }

    pub fn record_write(&mut self, path: &str, old_content: Option<String>, new_content: &str) {
        self.record(path, FileOp::Write, old_content, new_content);
    }

    pub fn record_edit(&mut self, path: &str, old_content: &str, new_content: &str) {
        self.record(path, FileOp::Edit, Some(old_content.to_string()), new_content);
    }

    fn record(&mut self, path: &str, op: FileOp, old_content: Option<String>, new_content: &str) {
        if !self.enabled {
            return;
        }
        let revision = self.current.get_or_insert_with(|| {
            let id = Uuid::new_v4().to_string();
            debug!(revision = %id, "opening revision");
            Revision {
                revision_id: id,
                instructions: self.instructions.clone(),
                changes: Vec::new(),
            }
        });
        revision.changes.push(FileChange {
            path: path.to_string(),
            op,
            old_content,
            new_content: new_content.to_string(),
        });
    }

    /// Close the open revision and archive it.  No-op when nothing changed.
    pub fn commit(&mut self) -> Option<String> {
        let revision = self.current.take()?;
        let id = revision.revision_id.clone();
        debug!(revision = %id, changes = revision.changes.len(), "committing revision");
        self.committed.push(revision);
        Some(id)
    }

    /// Undo the open revision by replaying the inverse sequence, newest
    /// change first.  Files that did not exist before are removed; others
    /// are restored to their prior content.
    pub fn rollback(&mut self) -> anyhow::Result<usize> {
        let Some(revision) = self.current.take() else {
            return Ok(0);
        };
        let mut restored = 0usize;
        for change in revision.changes.iter().rev() {
            match &change.old_content {
                Some(old) => {
                    std::fs::write(&change.path, old)?;
                }
                None => {
                    if Path::new(&change.path).exists() {
                        if let Err(e) = std::fs::remove_file(&change.path) {
                            warn!(path = %change.path, error = %e, "rollback: remove failed");
                            continue;
                        }
                    }
                }
            }
            restored += 1;
        }
        Ok(restored)
    }

    /// Drop all state, open and committed.
    pub fn clear(&mut self) {
        self.current = None;
        self.committed.clear();
    }

    /// Human-readable description of the open revision.
    pub fn summary(&self) -> String {
        match &self.current {
            None => "no pending changes".to_string(),
            Some(r) => {
                let mut lines = vec![format!(
                    "revision {} ({} changes):",
                    r.revision_id,
                    r.changes.len()
                )];
                for c in &r.changes {
                    let verb = match (c.op, c.old_content.is_some()) {
                        (FileOp::Write, false) => "create",
                        (FileOp::Write, true) => "overwrite",
                        (FileOp::Edit, _) => "edit",
                    };
                    lines.push(format!("  {verb} {}", c.path));
                }
                lines.join("\n")
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_revision_until_first_mutation() {
        let mut t = ChangeTracker::new();
        t.enable("do something");
        assert!(t.revision_id().is_none());
        t.record_write("a.txt", None, "x");
        assert!(t.revision_id().is_some());
    }

    #[test]
    fn disabled_tracker_records_nothing() {
        let mut t = ChangeTracker::new();
        t.record_write("a.txt", None, "x");
        assert_eq!(t.change_count(), 0);
    }

    #[test]
    fn commit_closes_and_returns_id() {
        let mut t = ChangeTracker::new();
        t.enable("turn");
        t.record_write("a.txt", None, "x");
        let id = t.revision_id().unwrap().to_string();
        assert_eq!(t.commit().as_deref(), Some(id.as_str()));
        assert!(t.revision_id().is_none());
    }

    #[test]
    fn commit_without_changes_is_none() {
        let mut t = ChangeTracker::new();
        t.enable("turn");
        assert!(t.commit().is_none());
    }

    #[test]
    fn tracked_files_deduplicates() {
        let mut t = ChangeTracker::new();
        t.enable("turn");
        t.record_write("b.txt", None, "1");
        t.record_edit("a.txt", "1", "2");
        t.record_edit("a.txt", "2", "3");
        assert_eq!(t.tracked_files(), vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn rollback_restores_prior_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "original").unwrap();

        let mut t = ChangeTracker::new();
        t.enable("turn");
        std::fs::write(&path, "modified").unwrap();
        t.record_edit(path.to_str().unwrap(), "original", "modified");

        let restored = t.rollback().unwrap();
        assert_eq!(restored, 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "original");
    }

    #[test]
    fn rollback_removes_created_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new.txt");

        let mut t = ChangeTracker::new();
        t.enable("turn");
        std::fs::write(&path, "fresh").unwrap();
        t.record_write(path.to_str().unwrap(), None, "fresh");

        t.rollback().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn rollback_replays_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "v3").unwrap();

        let mut t = ChangeTracker::new();
        t.enable("turn");
        // v1 -> v2 -> v3 recorded in order; inverse replay must end at v1.
        t.record_edit(path.to_str().unwrap(), "v1", "v2");
        t.record_edit(path.to_str().unwrap(), "v2", "v3");

        t.rollback().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "v1");
    }

    #[test]
    fn summary_names_files_and_verbs() {
        let mut t = ChangeTracker::new();
        t.enable("turn");
        t.record_write("new.txt", None, "x");
        t.record_edit("old.txt", "a", "b");
        let s = t.summary();
        assert!(s.contains("create new.txt"));
        assert!(s.contains("edit old.txt"));
    }

    #[test]
    fn clear_drops_everything() {
        let mut t = ChangeTracker::new();
        t.enable("turn");
        t.record_write("a", None, "x");
        t.commit();
        t.record_write("b", None, "y");
        t.clear();
        assert_eq!(t.change_count(), 0);
        assert!(t.commit().is_none());
    }
}
