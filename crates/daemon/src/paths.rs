//! Working directory validation.
//!
//! Every session working directory passes through a [`PathValidator`] before
//! the session is created. The shipped [`RootedPathValidator`] expands `~`,
//! canonicalizes the path and checks it against optional allowed roots.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors that can occur during path validation.
#[derive(Debug, Error)]
pub enum PathError {
    /// No path was given.
    #[error("working directory is empty")]
    Empty,

    /// The path is outside the allowed roots.
    #[error("path is outside allowed roots: {0}")]
    OutsideAllowedRoots(PathBuf),

    /// The path does not exist.
    #[error("path does not exist: {0}")]
    NotFound(PathBuf),

    /// The path is not a directory.
    #[error("path is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),

    /// Allowed roots were configured but none of them resolved.
    #[error("none of the allowed roots exist: {0:?}")]
    NoUsableRoots(Vec<PathBuf>),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decides whether a path may be used as a session working directory.
pub trait PathValidator: Send + Sync {
    /// Returns the resolved absolute directory, or why it was rejected.
    fn validate(&self, path: &str) -> Result<PathBuf, PathError>;
}

/// Validator that requires an existing directory under one of the allowed
/// roots. With no roots configured, any existing directory is accepted.
#[derive(Debug, Clone, Default)]
pub struct RootedPathValidator {
    allowed_roots: Vec<PathBuf>,
}

impl RootedPathValidator {
    /// Creates a validator for the given roots.
    ///
    /// Roots are canonicalized up front; roots that do not exist are skipped
    /// with a warning. Fails when roots were given and none of them resolve,
    /// since an empty root list would accept every directory.
    pub fn new(configured: Vec<PathBuf>) -> Result<Self, PathError> {
        let allowed_roots: Vec<PathBuf> = configured
            .iter()
            .filter_map(|root| {
                let expanded = expand_home(&root.to_string_lossy());
                match fs::canonicalize(&expanded) {
                    Ok(canonical) => Some(canonical),
                    Err(e) => {
                        tracing::warn!(
                            root = %expanded.display(),
                            error = %e,
                            "Ignoring allowed root that cannot be resolved"
                        );
                        None
                    }
                }
            })
            .collect();

        if !configured.is_empty() && allowed_roots.is_empty() {
            return Err(PathError::NoUsableRoots(configured));
        }
        Ok(Self { allowed_roots })
    }

    /// Creates a validator that accepts any existing directory.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Canonical allowed roots.
    pub fn allowed_roots(&self) -> &[PathBuf] {
        &self.allowed_roots
    }
}

impl PathValidator for RootedPathValidator {
    fn validate(&self, path: &str) -> Result<PathBuf, PathError> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(PathError::Empty);
        }

        let expanded = expand_home(trimmed);
        let canonical = fs::canonicalize(&expanded).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PathError::NotFound(expanded.clone()),
            std::io::ErrorKind::PermissionDenied => PathError::PermissionDenied(expanded.clone()),
            _ => PathError::Io(e),
        })?;

        if !canonical.is_dir() {
            return Err(PathError::NotADirectory(canonical));
        }

        if self.allowed_roots.is_empty()
            || self
                .allowed_roots
                .iter()
                .any(|root| canonical.starts_with(root))
        {
            return Ok(canonical);
        }

        Err(PathError::OutsideAllowedRoots(canonical))
    }
}

/// Expands a leading `~` to the user's home directory.
fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    Path::new(path).to_path_buf()
}
