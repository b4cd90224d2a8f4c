//! Credential gate for `/predict`.
//!
//! Every configured key is stored as its SHA-256 digest. A presented
//! credential is hashed once and compared against every stored digest with
//! [`subtle::ConstantTimeEq`], so the comparison time does not depend on
//! where the first differing byte sits or on which key (if any) matched.

use std::fmt::Write as _;

use sha2::{Digest, Sha256};
use subtle::{Choice, ConstantTimeEq};

use crate::config::AuthPolicy;

/// Number of credential characters that may appear in a log line.
const LOGGED_PREFIX_CHARS: usize = 4;

/// Why the gate refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No credential was presented and the policy requires one.
    #[error("API key required")]
    Missing,
    /// A credential was presented but matches no configured key.
    #[error("invalid API key")]
    Invalid,
}

/// Who the gate admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// A configured key matched. The fingerprint is a short digest prefix,
    /// safe to log and to use in rate-limit keys.
    Authenticated { fingerprint: String },
    /// No credential presented under the optional policy.
    Anonymous,
    /// The development bypass is active.
    Bypassed,
}

impl Identity {
    /// Label used to build the rate-limit key.
    #[must_use]
    pub fn principal(&self) -> &str {
        match self {
            Self::Authenticated { fingerprint } => fingerprint,
            Self::Anonymous => "anonymous",
            Self::Bypassed => "bypass",
        }
    }
}

/// Admits or rejects requests on their `x-api-key` credential.
#[derive(Clone)]
pub struct CredentialGate {
    digests: Vec<[u8; 32]>,
    policy: AuthPolicy,
    bypass: bool,
}

impl std::fmt::Debug for CredentialGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialGate")
            .field("keys", &self.digests.len())
            .field("policy", &self.policy)
            .field("bypass", &self.bypass)
            .finish()
    }
}

impl CredentialGate {
    /// Build a gate over `keys`. Empty keys are ignored.
    pub fn new<I, K>(keys: I, policy: AuthPolicy) -> Self
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let digests = keys
            .into_iter()
            .filter(|k| !k.as_ref().is_empty())
            .map(|k| digest(k.as_ref()))
            .collect();
        Self { digests, policy, bypass: false }
    }

    /// Admit everything without looking at credentials.
    #[must_use]
    pub fn with_bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    /// Number of configured keys.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.digests.len()
    }

    /// Decide on a request's presented credential.
    ///
    /// An empty string counts as absent.
    ///
    /// # Errors
    /// [`AuthError::Missing`] when no credential is presented under the
    /// required policy, [`AuthError::Invalid`] when a presented credential
    /// matches no key (under either policy).
    pub fn authorize(&self, presented: Option<&str>) -> Result<Identity, AuthError> {
        if self.bypass {
            tracing::debug!("credential check bypassed");
            return Ok(Identity::Bypassed);
        }

        let Some(credential) = presented.filter(|c| !c.is_empty()) else {
            return match self.policy {
                AuthPolicy::Required => {
                    tracing::warn!("request without API key");
                    Err(AuthError::Missing)
                }
                AuthPolicy::Optional => Ok(Identity::Anonymous),
            };
        };

        let candidate = digest(credential);
        let matched = self
            .digests
            .iter()
            .fold(Choice::from(0), |acc, stored| acc | stored[..].ct_eq(&candidate[..]));

        if bool::from(matched) {
            let fingerprint = fingerprint(&candidate);
            tracing::debug!(%fingerprint, "API key accepted");
            Ok(Identity::Authenticated { fingerprint })
        } else {
            tracing::warn!(key_prefix = %redact(credential), "invalid API key presented");
            Err(AuthError::Invalid)
        }
    }
}

fn digest(key: &str) -> [u8; 32] {
    Sha256::digest(key.as_bytes()).into()
}

fn fingerprint(digest: &[u8; 32]) -> String {
    digest[..6].iter().fold(String::with_capacity(12), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// First few characters of a credential, for log correlation only.
fn redact(credential: &str) -> String {
    let prefix: String = credential.chars().take(LOGGED_PREFIX_CHARS).collect();
    format!("{prefix}...")
}
