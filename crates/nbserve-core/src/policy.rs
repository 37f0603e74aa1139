//! Notebook access policy.
//!
//! Resolves user-supplied notebook paths to canonical form and checks
//! them against an allow-list of directories. Canonicalization happens
//! before containment checks, so `..` traversal and symlinks cannot
//! escape an allowed root. The canonical path doubles as the session
//! identity key, so aliases of one file share a kernel.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    /// Canonicalized allowed roots. Empty means unrestricted.
    allowed_dirs: Vec<PathBuf>,
}

impl AccessPolicy {
    /// Build a policy from allowed root directories. Each root must
    /// exist so it can be canonicalized.
    pub fn new(dirs: impl IntoIterator<Item = impl AsRef<Path>>) -> Result<Self> {
        let mut allowed_dirs = Vec::new();
        for dir in dirs {
            let dir = dir.as_ref();
            let canonical = dir.canonicalize().map_err(|e| Error::AccessDenied {
                path: dir.to_path_buf(),
                reason: format!("cannot resolve allowed directory: {}", e),
            })?;
            allowed_dirs.push(canonical);
        }
        Ok(Self { allowed_dirs })
    }

    /// No containment restriction; paths are still canonicalized and
    /// extension-checked.
    pub fn unrestricted() -> Self {
        Self::default()
    }

    /// Validate `path` as a notebook and return its canonical form.
    pub fn resolve_notebook(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();

        let is_ipynb = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("ipynb"));
        if !is_ipynb {
            return Err(Error::AccessDenied {
                path: path.to_path_buf(),
                reason: "not a notebook file (.ipynb)".to_string(),
            });
        }

        let canonical = path
            .canonicalize()
            .map_err(|e| Error::Notebook(format!("cannot resolve '{}': {}", path.display(), e)))?;

        if !self.allowed_dirs.is_empty()
            && !self
                .allowed_dirs
                .iter()
                .any(|root| canonical.starts_with(root))
        {
            return Err(Error::AccessDenied {
                path: path.to_path_buf(),
                reason: "outside allowed directories".to_string(),
            });
        }

        Ok(canonical)
    }
}
