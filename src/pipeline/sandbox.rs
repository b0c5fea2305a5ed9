//! Sandbox filesystem namespace
//!
//! All local artifacts (downloaded resources, generated keys, reports) live
//! under a single writable root. Requested paths are normalized lexically
//! and rewritten under the root when they point elsewhere.

use std::path::{Component, Path, PathBuf};

use tracing::warn;

use super::error::ProvisioningError;

/// Default sandbox root
pub const DEFAULT_SANDBOX_ROOT: &str = "/tmp";

#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a requested file path to a path inside the sandbox.
    ///
    /// `..` can never climb above the filesystem root, so
    /// `/tmp/../etc/passwd` normalizes to `/etc/passwd` and is then
    /// rewritten to `<root>/etc/passwd`. Relative paths are taken relative to
    /// the sandbox root. A path that resolves to the root itself is rejected.
    pub fn confine(&self, requested: &Path) -> Result<PathBuf, ProvisioningError> {
        let root = normalize(&self.root);

        let joined;
        let full = if requested.is_absolute() {
            normalize(requested)
        } else {
            joined = self.root.join(requested);
            normalize(&joined)
        };

        let inside = full.len() >= root.len() && full[..root.len()] == root[..];
        let relative = if inside {
            full[root.len()..].to_vec()
        } else {
            warn!(
                requested = %requested.display(),
                sandbox = %self.root.display(),
                "Path is outside the sandbox, rewriting under sandbox root"
            );
            full
        };

        if relative.is_empty() {
            return Err(ProvisioningError::config(format!(
                "Path {} resolves to the sandbox root, not a file",
                requested.display()
            )));
        }

        let mut confined = self.root.clone();
        confined.extend(relative);
        Ok(confined)
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(DEFAULT_SANDBOX_ROOT)
    }
}

/// Lexical normalization into plain components (no root, no `.`/`..`).
fn normalize(path: &Path) -> Vec<&std::ffi::OsStr> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => parts.clear(),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(part) => parts.push(part),
        }
    }
    parts
}
