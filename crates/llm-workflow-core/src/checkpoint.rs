// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Checkpoint persistence for interrupted runs.
//!
//! One JSON file per run under a configured directory (file mode 0600,
//! directory mode 0700 on unix). Writes go through a temp file and rename
//! so a saved record always represents a consistent step boundary. When no
//! directory is configured the store is disabled and every operation is a
//! no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

/// A point-in-time snapshot of a run at a step boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Run id.
    pub run_id: Uuid,
    /// Workflow name.
    pub workflow_id: String,
    /// Id of the last step that reached a terminal state.
    pub step_id: String,
    /// Document-order index of that step.
    pub step_index: usize,
    /// Full workflow context at the boundary.
    pub context: Value,
    /// Outputs of completed steps keyed by step id.
    pub step_outputs: HashMap<String, Value>,
    /// When the checkpoint was written.
    pub created_at: DateTime<Utc>,
}

/// File-backed checkpoint store.
pub struct CheckpointStore {
    dir: Option<PathBuf>,
}

impl CheckpointStore {
    /// Creates a store rooted at `dir`, creating it with restrictive
    /// permissions. An empty path disables the store.
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir: PathBuf = dir.into();
        if dir.as_os_str().is_empty() {
            return Ok(Self::disabled());
        }
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self { dir: Some(dir) })
    }

    /// A store with persistence disabled; all operations are no-ops.
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    /// Whether the store persists anything.
    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    /// Persists a checkpoint atomically.
    pub fn save(&self, checkpoint: &Checkpoint) -> std::io::Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let path = self.file_path(dir, checkpoint.run_id);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(checkpoint)?;
        std::fs::write(&tmp, data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Loads the checkpoint for a run, or `None` when absent or disabled.
    pub fn load(&self, run_id: Uuid) -> std::io::Result<Option<Checkpoint>> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };

        let path = self.file_path(dir, run_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        match serde_json::from_str(&content) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Discarding unreadable checkpoint");
                Ok(None)
            }
        }
    }

    /// Deletes the checkpoint for a run. Missing files are not an error.
    pub fn delete(&self, run_id: Uuid) -> std::io::Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let path = self.file_path(dir, run_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Lists checkpoints of runs that never completed (completion deletes
    /// the file, so anything on disk was interrupted).
    pub fn list_interrupted(&self) -> std::io::Result<Vec<Checkpoint>> {
        let Some(dir) = &self.dir else {
            return Ok(Vec::new());
        };

        let mut checkpoints = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<Checkpoint>(&content) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint");
                }
            }
        }
        checkpoints.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(checkpoints)
    }

    fn file_path(&self, dir: &Path, run_id: Uuid) -> PathBuf {
        dir.join(format!("{}.json", run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample(run_id: Uuid) -> Checkpoint {
        Checkpoint {
            run_id,
            workflow_id: "wf".to_string(),
            step_id: "s2".to_string(),
            step_index: 1,
            context: json!({"inputs": {"a": 1}, "steps": {}}),
            step_outputs: HashMap::from([("s1".to_string(), json!({"ok": true}))]),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let run_id = Uuid::new_v4();
        let checkpoint = sample(run_id);

        store.save(&checkpoint).unwrap();
        let loaded = store.load(run_id).unwrap().unwrap();

        // Equal in all fields; created_at round-trips through JSON too.
        assert_eq!(loaded.run_id, checkpoint.run_id);
        assert_eq!(loaded.workflow_id, checkpoint.workflow_id);
        assert_eq!(loaded.step_id, checkpoint.step_id);
        assert_eq!(loaded.step_index, checkpoint.step_index);
        assert_eq!(loaded.context, checkpoint.context);
        assert_eq!(loaded.step_outputs, checkpoint.step_outputs);
    }

    #[test]
    fn test_save_overwrites_atomically() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let run_id = Uuid::new_v4();

        let mut checkpoint = sample(run_id);
        store.save(&checkpoint).unwrap();
        checkpoint.step_id = "s3".to_string();
        checkpoint.step_index = 2;
        store.save(&checkpoint).unwrap();

        let loaded = store.load(run_id).unwrap().unwrap();
        assert_eq!(loaded.step_id, "s3");
        // No leftover temp files.
        let stray: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref().unwrap().path().extension().and_then(|x| x.to_str()) == Some("tmp")
            })
            .collect();
        assert!(stray.is_empty());
    }

    #[test]
    fn test_delete_and_list_interrupted() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();

        let a = sample(Uuid::new_v4());
        let b = sample(Uuid::new_v4());
        store.save(&a).unwrap();
        store.save(&b).unwrap();

        assert_eq!(store.list_interrupted().unwrap().len(), 2);

        store.delete(a.run_id).unwrap();
        let remaining = store.list_interrupted().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].run_id, b.run_id);

        // Deleting twice is fine.
        store.delete(a.run_id).unwrap();
    }

    #[test]
    fn test_disabled_store_is_noop() {
        let store = CheckpointStore::disabled();
        assert!(!store.is_enabled());
        let checkpoint = sample(Uuid::new_v4());
        store.save(&checkpoint).unwrap();
        assert!(store.load(checkpoint.run_id).unwrap().is_none());
        assert!(store.list_interrupted().unwrap().is_empty());
        store.delete(checkpoint.run_id).unwrap();
    }

    #[test]
    fn test_empty_dir_disables() {
        let store = CheckpointStore::new("").unwrap();
        assert!(!store.is_enabled());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let root = dir.path().join("checkpoints");
        let store = CheckpointStore::new(&root).unwrap();
        let checkpoint = sample(Uuid::new_v4());
        store.save(&checkpoint).unwrap();

        let dir_mode = std::fs::metadata(&root).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);

        let file = root.join(format!("{}.json", checkpoint.run_id));
        let file_mode = std::fs::metadata(&file).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
    }
}
