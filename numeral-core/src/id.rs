use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one stored upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub struct AssetId(pub Uuid);

impl AssetId {
    /// Creates a new random `AssetId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the inner `Uuid`.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for AssetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for AssetId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Identifies a rate-limited client: network address plus credential identity.
///
/// Two requests share a window only if both components match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ClientKey(pub String);

impl ClientKey {
    /// Builds a key from a network address and a principal label.
    ///
    /// The principal is an opaque label (a credential fingerprint or
    /// `"anonymous"`), never the raw credential.
    pub fn new(address: impl fmt::Display, principal: impl fmt::Display) -> Self {
        Self(format!("{address}|{principal}"))
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ClientKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}
