use std::path::{Component, Path, PathBuf};

use crate::error::ToolExecutionError;

/// Canonical workspace root every tool path is resolved against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, ToolExecutionError> {
        let root = root.as_ref();
        let canonical_root = root
            .canonicalize()
            .map_err(|source| ToolExecutionError::io("resolving workspace root", root, source))?;

        if !canonical_root.is_dir() {
            return Err(ToolExecutionError::InvalidPath {
                message: format!("workspace root {} is not a directory", root.display()),
            });
        }

        Ok(Self {
            root: canonical_root,
        })
    }

    /// Canonical root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a path that must already exist inside the workspace.
    pub fn resolve_existing(&self, path: &str) -> Result<PathBuf, ToolExecutionError> {
        let candidate = self.absolute_candidate(path)?;
        let canonical = candidate
            .canonicalize()
            .map_err(|source| ToolExecutionError::io("resolving path", &candidate, source))?;

        self.ensure_inside(&canonical)?;
        Ok(canonical)
    }

    /// Resolves a path that may not exist yet; its nearest existing ancestor
    /// must lie inside the workspace.
    ///
    /// `.` and `..` are folded first, so a missing directory cannot hide a
    /// climb out of the root from the ancestor check.
    pub fn resolve_write(&self, path: &str) -> Result<PathBuf, ToolExecutionError> {
        let candidate = normalize_lexically(&self.absolute_candidate(path)?);
        let parent = candidate
            .parent()
            .ok_or_else(|| ToolExecutionError::InvalidPath {
                message: format!(
                    "path {} has no parent directory and cannot be written safely",
                    candidate.display()
                ),
            })?;

        let anchor = canonicalize_existing_ancestor(parent)?;
        self.ensure_inside(&anchor)?;
        Ok(candidate)
    }

    /// Fails with [`ToolExecutionError::PathEscape`] unless `canonical_path` is under the root.
    pub fn ensure_inside(&self, canonical_path: &Path) -> Result<(), ToolExecutionError> {
        if canonical_path.starts_with(&self.root) {
            Ok(())
        } else {
            Err(ToolExecutionError::PathEscape {
                path: canonical_path.to_path_buf(),
            })
        }
    }

    /// Root-relative form for messages; other paths print as-is.
    pub fn relative_display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .map(|relative| relative.display().to_string())
            .unwrap_or_else(|_| path.display().to_string())
    }

    fn absolute_candidate(&self, path: &str) -> Result<PathBuf, ToolExecutionError> {
        if path.trim().is_empty() {
            return Err(ToolExecutionError::InvalidPath {
                message: "path must not be empty".to_string(),
            });
        }

        let path = Path::new(path);
        Ok(if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        })
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

fn canonicalize_existing_ancestor(path: &Path) -> Result<PathBuf, ToolExecutionError> {
    for ancestor in path.ancestors() {
        if ancestor.exists() {
            return ancestor
                .canonicalize()
                .map_err(|source| ToolExecutionError::io("resolving path", ancestor, source));
        }
    }

    Err(ToolExecutionError::InvalidPath {
        message: format!("no existing ancestor found for path {}", path.display()),
    })
}
