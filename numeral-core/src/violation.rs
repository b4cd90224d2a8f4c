use serde::{Deserialize, Serialize};

/// Tagged reason a request was refused on security grounds.
///
/// The variants carry no paths or byte contents. Server-side detail belongs in
/// the log line emitted where the violation was detected; this type is what
/// travels towards the client boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum SecurityViolation {
    /// A path escaped, or tried to escape, the approved root.
    #[error("path is outside the permitted directory")]
    PathTraversal,

    /// An executable did not exactly match a whitelist entry.
    #[error("executable is not on the whitelist")]
    ExecutableNotWhitelisted,

    /// Stored bytes did not start with a signature of the declared type.
    #[error("file contents do not match the declared image type")]
    SignatureMismatch,

    /// Stored size fell outside the permitted bounds.
    #[error("file size is outside the permitted range")]
    SizeOutOfRange,
}

impl SecurityViolation {
    /// Stable machine-readable tag.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::PathTraversal => "path_traversal",
            Self::ExecutableNotWhitelisted => "executable_not_whitelisted",
            Self::SignatureMismatch => "signature_mismatch",
            Self::SizeOutOfRange => "size_out_of_range",
        }
    }
}

