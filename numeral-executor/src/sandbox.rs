//! Path confinement for every filesystem and process boundary.
//!
//! A [`PathSandbox`] is built either around a single approved root (upload
//! storage and deletion) or around an exact allow-list (interpreter
//! executables). Both modes normalise candidates lexically before comparing,
//! so relative segments, `.` components and trailing separators cannot be
//! used to slip past the check. The only way to obtain a [`SandboxedPath`] is
//! through [`PathSandbox::confine`].

use std::ffi::OsStr;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use indexmap::IndexSet;
use numeral_core::SecurityViolation;

use crate::ExecutorError;

/// A path that has passed a [`PathSandbox`] check.
///
/// Deliberately has no `Display` impl: absolute server paths must not end up
/// in client-facing messages by accident.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SandboxedPath(PathBuf);

impl SandboxedPath {
    /// Borrow the confined absolute path.
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Final path component, if any.
    #[must_use]
    pub fn file_name(&self) -> Option<&OsStr> {
        self.0.file_name()
    }
}

impl AsRef<Path> for SandboxedPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Debug for SandboxedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SandboxedPath").field(&self.0).finish()
    }
}

#[derive(Debug, Clone)]
enum Confinement {
    /// Candidates must be strict descendants of this root.
    Root(PathBuf),
    /// Candidates must equal one of these entries exactly.
    AllowList(IndexSet<PathBuf>),
}

/// Reusable confinement capability.
///
/// # Examples
/// ```
/// use std::path::Path;
/// use numeral_executor::PathSandbox;
///
/// let uploads = PathSandbox::upload_root(Path::new("/srv/numeral/uploads")).unwrap();
/// assert!(uploads.confine("upload-1.png").is_ok());
/// assert!(uploads.confine("../secrets").is_err());
/// assert!(uploads.confine("/etc/passwd").is_err());
/// ```
#[derive(Debug, Clone)]
pub struct PathSandbox {
    confinement: Confinement,
    /// Directory that relative candidates are resolved against.
    base: PathBuf,
}

impl PathSandbox {
    /// Build a sandbox that admits only descendants of `root`.
    ///
    /// Relative candidates are resolved against `root` itself.
    ///
    /// # Errors
    /// Returns [`ExecutorError::InvalidSandbox`] if `root` is relative or is
    /// the filesystem root.
    pub fn upload_root(root: &Path) -> Result<Self, ExecutorError> {
        if !root.is_absolute() {
            return Err(ExecutorError::InvalidSandbox {
                reason: format!("upload root {} is not absolute", root.display()),
            });
        }
        let root = normalize(root, root);
        if root.parent().is_none() {
            return Err(ExecutorError::InvalidSandbox {
                reason: "upload root may not be the filesystem root".to_owned(),
            });
        }
        Ok(Self { confinement: Confinement::Root(root.clone()), base: root })
    }

    /// Build a sandbox that admits only the listed executables.
    ///
    /// Relative entries and candidates are resolved against `base`.
    ///
    /// # Errors
    /// Returns [`ExecutorError::InvalidSandbox`] if `base` is relative or the
    /// list is empty.
    pub fn executables<I, P>(entries: I, base: &Path) -> Result<Self, ExecutorError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        if !base.is_absolute() {
            return Err(ExecutorError::InvalidSandbox {
                reason: format!("executable base {} is not absolute", base.display()),
            });
        }
        let base = normalize(base, base);
        let allowed: IndexSet<PathBuf> = entries
            .into_iter()
            .filter(|p| !p.as_ref().as_os_str().is_empty())
            .map(|p| normalize(&base, p.as_ref()))
            .collect();
        if allowed.is_empty() {
            return Err(ExecutorError::InvalidSandbox {
                reason: "executable whitelist is empty".to_owned(),
            });
        }
        Ok(Self { confinement: Confinement::AllowList(allowed), base })
    }

    /// Check `candidate` against this sandbox.
    ///
    /// Must be called before any filesystem mutation or process spawn that
    /// uses the path.
    ///
    /// # Errors
    /// Returns [`SecurityViolation::PathTraversal`] from a root sandbox and
    /// [`SecurityViolation::ExecutableNotWhitelisted`] from an allow-list
    /// sandbox. The offending path is logged, never returned.
    pub fn confine(&self, candidate: impl AsRef<Path>) -> Result<SandboxedPath, SecurityViolation> {
        let candidate = candidate.as_ref();
        match &self.confinement {
            Confinement::Root(root) => {
                if !is_well_formed(candidate) || has_parent_segment(candidate) {
                    return Err(reject(candidate, SecurityViolation::PathTraversal));
                }
                let resolved = normalize(&self.base, candidate);
                if resolved.starts_with(root) && resolved != *root {
                    Ok(SandboxedPath(resolved))
                } else {
                    Err(reject(candidate, SecurityViolation::PathTraversal))
                }
            }
            Confinement::AllowList(allowed) => {
                if !is_well_formed(candidate) {
                    return Err(reject(candidate, SecurityViolation::ExecutableNotWhitelisted));
                }
                let resolved = normalize(&self.base, candidate);
                if allowed.contains(&resolved) {
                    Ok(SandboxedPath(resolved))
                } else {
                    Err(reject(candidate, SecurityViolation::ExecutableNotWhitelisted))
                }
            }
        }
    }

    /// Whitelisted entries in configuration order, for allow-list sandboxes.
    pub fn allowed(&self) -> impl Iterator<Item = &Path> {
        let entries = match &self.confinement {
            Confinement::AllowList(allowed) => Some(allowed.iter().map(PathBuf::as_path)),
            Confinement::Root(_) => None,
        };
        entries.into_iter().flatten()
    }
}

fn reject(candidate: &Path, violation: SecurityViolation) -> SecurityViolation {
    tracing::warn!(
        path = %candidate.display(),
        violation = violation.tag(),
        "sandbox rejected path"
    );
    violation
}

/// Empty paths and embedded NUL bytes are never legitimate.
fn is_well_formed(candidate: &Path) -> bool {
    let raw = candidate.as_os_str();
    !raw.is_empty() && !raw.as_encoded_bytes().contains(&0)
}

fn has_parent_segment(candidate: &Path) -> bool {
    candidate.components().any(|c| matches!(c, Component::ParentDir))
}

/// Lexically resolve `candidate` against `base`.
///
/// `..` pops one level and never climbs above the filesystem root; `.` and
/// repeated or trailing separators vanish.
fn normalize(base: &Path, candidate: &Path) -> PathBuf {
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}
