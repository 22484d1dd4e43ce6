//! Path sandbox guard for `file://` media references.
//!
//! An embedded engine trusts any `file://` URL it receives, so every trust
//! decision is made here, *before* a reference is built. Both the candidate and
//! the root are canonicalised (absolute, `..` removed, symlinks resolved) and
//! then compared component-wise, which means `/srv/media-evil` never matches
//! a root of `/srv/media`.
//!
//! A failure here is a security boundary violation: it aborts the request and
//! is never softened into a warning.

use crate::error::Doc2TextError;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, error};

/// A canonicalised allowed root, reusable across many checks.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Canonicalise `root` once. The root must exist.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, Doc2TextError> {
        let root = root.as_ref();
        let canonical = root.canonicalize().map_err(|e| {
            Doc2TextError::InvalidConfig(format!(
                "allowed media root '{}' cannot be resolved: {e}",
                root.display()
            ))
        })?;
        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the canonical form of `candidate` if it lies inside the root.
    ///
    /// Containment is decided before existence: a missing path outside the
    /// root is `PathOutsideSandbox`, and only a missing path that would lie
    /// inside it is `DocumentNotFound`.
    pub fn validate(&self, candidate: impl AsRef<Path>) -> Result<PathBuf, Doc2TextError> {
        let candidate = candidate.as_ref();
        let resolved = match candidate.canonicalize() {
            Ok(resolved) => resolved,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let projected = resolve_missing(candidate).map_err(|_| self.outside(candidate))?;
                if projected.starts_with(&self.root) {
                    return Err(Doc2TextError::DocumentNotFound {
                        path: candidate.to_path_buf(),
                    });
                }
                error!(
                    "Sandbox violation: missing path '{}' would resolve outside '{}'",
                    candidate.display(),
                    self.root.display()
                );
                return Err(self.outside(&projected));
            }
            Err(_) => return Err(self.outside(candidate)),
        };

        // `Path::starts_with` compares whole components, never raw bytes.
        if resolved.starts_with(&self.root) {
            debug!("Sandbox: {} allowed", resolved.display());
            Ok(resolved)
        } else {
            error!(
                "Sandbox violation: '{}' resolves to '{}', outside '{}'",
                candidate.display(),
                resolved.display(),
                self.root.display()
            );
            Err(Doc2TextError::PathOutsideSandbox {
                path: resolved,
                root: self.root.clone(),
            })
        }
    }

    fn outside(&self, path: &Path) -> Doc2TextError {
        Doc2TextError::PathOutsideSandbox {
            path: path.to_path_buf(),
            root: self.root.clone(),
        }
    }
}

/// Where a path that does not exist yet would resolve to.
///
/// Walks the components forward. Every prefix that exists is replaced by its
/// canonical form, so symlinks are followed; once a component is missing the
/// rest is applied lexically, `..` included.
fn resolve_missing(candidate: &Path) -> std::io::Result<PathBuf> {
    let absolute = std::path::absolute(candidate)?;
    let mut resolved = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => continue,
            Component::ParentDir => {
                resolved.pop();
            }
            other => resolved.push(other),
        }
        if let Ok(canonical) = resolved.canonicalize() {
            resolved = canonical;
        }
    }
    Ok(resolved)
}

/// Validate a single path against `allowed_root`.
///
/// Convenience wrapper around [`Sandbox`] for one-off checks.
pub fn validate_local_path(
    candidate: impl AsRef<Path>,
    allowed_root: impl AsRef<Path>,
) -> Result<PathBuf, Doc2TextError> {
    Sandbox::new(allowed_root)?.validate(candidate)
}
