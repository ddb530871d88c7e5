// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Safe loading of referenced workflow files.
//!
//! A sub-workflow reference must stay inside the parent workflow's
//! directory: relative paths only, no `..` segments, no symlinks among the
//! components the reference adds (the parent directory itself is trusted,
//! so an engine mounted under a symlinked root still works). Recursion is
//! bounded by a load stack carrying cycle detection and a depth cap.
//!
//! Parsed definitions are cached by absolute path and invalidated when the
//! file's modification time changes.

use crate::workflow::Workflow;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Maximum depth of nested sub-workflow loads.
pub const MAX_LOAD_DEPTH: usize = 5;

/// Loader failure taxonomy. All variants are fatal for the referencing run.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// The reference is absolute, empty, or contains `..` segments.
    #[error("invalid workflow path '{0}'")]
    InvalidPath(String),
    /// The resolved path escapes the parent workflow's directory.
    #[error("workflow path '{0}' escapes the parent directory")]
    PathEscape(String),
    /// A user-supplied path component is a symlink.
    #[error("workflow path '{0}' traverses a symlink")]
    SymlinkInPath(String),
    /// The referenced file does not exist or cannot be read.
    #[error("workflow file '{0}' not found")]
    NotFound(String),
    /// The referenced file is not a valid workflow definition.
    #[error("failed to parse workflow '{path}': {reason}")]
    ParseFailed {
        /// Referenced path.
        path: String,
        /// Parse or validation failure.
        reason: String,
    },
    /// The reference graph contains a cycle.
    #[error("recursion detected: '{0}' is already being loaded")]
    Recursion(String),
    /// The load stack exceeded [`MAX_LOAD_DEPTH`].
    #[error("sub-workflow nesting exceeds the maximum depth of {MAX_LOAD_DEPTH}")]
    DepthExceeded,
}

impl LoaderError {
    /// User-safe message without filesystem paths.
    pub fn safe_message(&self) -> String {
        match self {
            Self::InvalidPath(_) => "invalid sub-workflow path".to_string(),
            Self::PathEscape(_) => "sub-workflow path escapes the workflow directory".to_string(),
            Self::SymlinkInPath(_) => "sub-workflow path traverses a symlink".to_string(),
            Self::NotFound(_) => "sub-workflow file not found".to_string(),
            Self::ParseFailed { .. } => "sub-workflow failed to parse".to_string(),
            Self::Recursion(_) => "recursion detected in sub-workflow references".to_string(),
            Self::DepthExceeded => self.to_string(),
        }
    }
}

/// Per-load call stack: the chain of absolute paths currently loading.
#[derive(Debug, Clone, Default)]
pub struct LoadContext {
    stack: Vec<PathBuf>,
}

impl LoadContext {
    /// An empty root context.
    pub fn root() -> Self {
        Self::default()
    }

    /// Current nesting depth.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    fn contains(&self, path: &Path) -> bool {
        self.stack.iter().any(|p| p == path)
    }

    fn push(&self, path: PathBuf) -> Self {
        let mut stack = self.stack.clone();
        stack.push(path);
        Self { stack }
    }
}

struct CacheEntry {
    workflow: Arc<Workflow>,
    modified: SystemTime,
}

/// Validating, caching loader for sub-workflow references.
#[derive(Default)]
pub struct SubWorkflowLoader {
    cache: RwLock<HashMap<PathBuf, CacheEntry>>,
}

impl SubWorkflowLoader {
    /// Creates a loader with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads and validates the workflow at `relative_path` under
    /// `parent_dir`, then recursively validates its own sub-workflow
    /// references with an extended stack.
    pub fn load(
        &self,
        parent_dir: &Path,
        relative_path: &str,
        ctx: &LoadContext,
    ) -> Result<Arc<Workflow>, LoaderError> {
        let rel = validate_relative(relative_path)?;

        let parent_abs = parent_dir
            .canonicalize()
            .map_err(|_| LoaderError::NotFound(display_path(parent_dir)))?;
        let abs = parent_abs.join(&rel);

        // Descendant check on the lexically joined path. `..` segments were
        // rejected above so the join cannot climb out, but the check guards
        // against platform path oddities.
        if !abs.starts_with(&parent_abs) {
            return Err(LoaderError::PathEscape(relative_path.to_string()));
        }

        // Only the components the reference adds are checked for symlinks;
        // the parent directory itself is trusted.
        let mut walker = parent_abs.clone();
        for component in rel.components() {
            walker.push(component);
            match std::fs::symlink_metadata(&walker) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(LoaderError::SymlinkInPath(relative_path.to_string()));
                }
                // Missing intermediate components surface as NotFound when
                // the file is read.
                _ => {}
            }
        }

        if ctx.depth() >= MAX_LOAD_DEPTH {
            return Err(LoaderError::DepthExceeded);
        }
        if ctx.contains(&abs) {
            return Err(LoaderError::Recursion(display_path(&abs)));
        }

        let workflow = self.load_cached(&abs)?;

        // Validate the transitive reference graph before anything executes.
        let child_ctx = ctx.push(abs.clone());
        let child_dir = abs.parent().unwrap_or(&parent_abs);
        for child_path in workflow.sub_workflow_paths() {
            self.load(child_dir, &child_path, &child_ctx)?;
        }

        Ok(workflow)
    }

    /// Fetches from the cache when the file's mtime still matches,
    /// otherwise reads, parses, validates and re-caches.
    fn load_cached(&self, abs: &Path) -> Result<Arc<Workflow>, LoaderError> {
        let modified = std::fs::metadata(abs).and_then(|m| m.modified()).ok();

        if let Some(modified) = modified {
            let cache = self.cache.read();
            if let Some(entry) = cache.get(abs) {
                if entry.modified == modified {
                    return Ok(entry.workflow.clone());
                }
            }
        }

        // Stat failure or stale entry: evict and reload.
        self.cache.write().remove(abs);

        let content = std::fs::read_to_string(abs)
            .map_err(|_| LoaderError::NotFound(display_path(abs)))?;
        let workflow = Workflow::from_yaml(&content).map_err(|e| LoaderError::ParseFailed {
            path: display_path(abs),
            reason: e.to_string(),
        })?;
        workflow.validate().map_err(|e| LoaderError::ParseFailed {
            path: display_path(abs),
            reason: e.to_string(),
        })?;

        let workflow = Arc::new(workflow);
        if let Some(modified) = modified {
            self.cache.write().insert(
                abs.to_path_buf(),
                CacheEntry {
                    workflow: workflow.clone(),
                    modified,
                },
            );
        }
        Ok(workflow)
    }

    /// Number of cached definitions.
    pub fn cache_len(&self) -> usize {
        self.cache.read().len()
    }
}

/// Rejects absolute, empty and `..`-containing references.
fn validate_relative(relative_path: &str) -> Result<PathBuf, LoaderError> {
    if relative_path.trim().is_empty() {
        return Err(LoaderError::InvalidPath(relative_path.to_string()));
    }
    let path = Path::new(relative_path);
    if path.is_absolute() {
        return Err(LoaderError::InvalidPath(relative_path.to_string()));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(LoaderError::InvalidPath(relative_path.to_string())),
        }
    }
    Ok(path.to_path_buf())
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}
