//! Sliding-window rate limiting per client.
//!
//! Each client owns a sorted list of the instants at which its accepted
//! requests arrived. A request is admitted when fewer than `max_requests`
//! of those instants fall inside the trailing window. Rejected requests are
//! not recorded, so hammering a closed window does not extend it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use numeral_core::ClientKey;

use crate::config::RateLimitConfig;

/// The limiter's backing store failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("rate limit store unavailable: {0}")]
pub struct StoreError(pub String);

/// Accepted-request instants for one client, oldest first.
#[derive(Debug, Clone, Default)]
pub struct ClientWindow {
    hits: VecDeque<Instant>,
}

impl ClientWindow {
    /// Drop every instant whose age at `now` is at least `window`.
    pub fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&front) = self.hits.front() {
            if now.saturating_duration_since(front) >= window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record an accepted request, keeping the list sorted.
    pub fn record(&mut self, at: Instant) {
        match self.hits.back() {
            Some(&last) if at < last => {
                let idx = self.hits.partition_point(|&t| t <= at);
                self.hits.insert(idx, at);
            }
            _ => self.hits.push_back(at),
        }
    }

    /// Number of recorded instants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    /// `true` when nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Earliest recorded instant.
    #[must_use]
    pub fn oldest(&self) -> Option<Instant> {
        self.hits.front().copied()
    }
}

/// Storage for client windows.
///
/// `with_window` must give the closure exclusive access to the client's
/// window for its whole duration: check-then-record happens inside it, so
/// two concurrent requests from one client can never both take the last
/// slot.
pub trait RateLimitStore: Send + Sync {
    /// Run `f` on the window for `key`, creating it empty if absent.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the store cannot be accessed.
    fn with_window<R>(
        &self,
        key: &ClientKey,
        f: impl FnOnce(&mut ClientWindow) -> R,
    ) -> Result<R, StoreError>;

    /// Prune every window and forget clients with nothing left in theirs.
    /// Returns the number of clients forgotten.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the store cannot be accessed.
    fn sweep(&self, now: Instant, window: Duration) -> Result<usize, StoreError>;
}

/// Process-local store behind a single mutex.
#[derive(Debug, Default)]
pub struct InMemoryWindowStore {
    windows: Mutex<HashMap<ClientKey, ClientWindow>>,
}

impl InMemoryWindowStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked clients.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the lock is poisoned.
    pub fn client_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<ClientKey, ClientWindow>>, StoreError> {
        self.windows.lock().map_err(|_| StoreError("window map lock poisoned".to_owned()))
    }
}

impl RateLimitStore for InMemoryWindowStore {
    fn with_window<R>(
        &self,
        key: &ClientKey,
        f: impl FnOnce(&mut ClientWindow) -> R,
    ) -> Result<R, StoreError> {
        let mut windows = self.lock()?;
        let window = windows.entry(key.clone()).or_default();
        Ok(f(window))
    }

    fn sweep(&self, now: Instant, window: Duration) -> Result<usize, StoreError> {
        let mut windows = self.lock()?;
        let before = windows.len();
        windows.retain(|_, w| {
            w.prune(now, window);
            !w.is_empty()
        });
        Ok(before - windows.len())
    }
}

/// Remaining budget after an admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// Configured maximum per window.
    pub limit: usize,
    /// Requests left in the current window.
    pub remaining: usize,
    /// Time until the oldest counted request leaves the window.
    pub reset_after: Duration,
}

impl Quota {
    /// Whole seconds until the window resets, rounded up like
    /// [`RateLimited::retry_after_secs`] so an open window never reads as 0.
    #[must_use]
    pub fn reset_after_secs(&self) -> u64 {
        ceil_secs(self.reset_after)
    }
}

/// Rejection details for a rate-limited request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimited {
    /// Configured maximum per window.
    pub limit: usize,
    /// Whole seconds until a slot frees up. Never zero.
    pub retry_after_secs: u64,
    /// Exact time until a slot frees up.
    pub reset_after: Duration,
}

/// Outcome of a limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request is admitted and has been counted.
    Allow(Quota),
    /// The request is over the limit and was not counted.
    Reject(RateLimited),
}

/// Sliding-window limiter over a [`RateLimitStore`].
#[derive(Debug)]
pub struct RateLimiter<S = InMemoryWindowStore> {
    store: S,
    config: RateLimitConfig,
}

impl RateLimiter<InMemoryWindowStore> {
    /// Limiter over a fresh in-memory store.
    #[must_use]
    pub fn in_memory(config: RateLimitConfig) -> Self {
        Self::with_store(InMemoryWindowStore::new(), config)
    }
}

impl<S: RateLimitStore> RateLimiter<S> {
    /// Limiter over an existing store.
    pub fn with_store(store: S, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// Limiter settings.
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Check and, if admitted, count a request from `key` arriving at `now`.
    ///
    /// If the store fails, the configured failure policy decides: fail-open
    /// admits the request with a full quota and logs a warning; fail-closed
    /// returns the error.
    ///
    /// # Errors
    /// Returns [`StoreError`] only under the fail-closed policy.
    pub fn check(&self, key: &ClientKey, now: Instant) -> Result<Decision, StoreError> {
        let RateLimitConfig { window, max_requests, fail_open } = self.config;

        let outcome = self.store.with_window(key, |w| {
            w.prune(now, window);
            let time_to_reset = |w: &ClientWindow| {
                w.oldest().map_or(window, |oldest| {
                    window.saturating_sub(now.saturating_duration_since(oldest))
                })
            };
            if w.len() >= max_requests {
                let reset_after = time_to_reset(&*w);
                Decision::Reject(RateLimited {
                    limit: max_requests,
                    retry_after_secs: ceil_secs(reset_after).max(1),
                    reset_after,
                })
            } else {
                w.record(now);
                Decision::Allow(Quota {
                    limit: max_requests,
                    remaining: max_requests - w.len(),
                    reset_after: time_to_reset(&*w),
                })
            }
        });

        match outcome {
            Ok(decision) => {
                if let Decision::Reject(limited) = decision {
                    tracing::warn!(
                        client = %key,
                        retry_after_secs = limited.retry_after_secs,
                        "rate limit exceeded"
                    );
                }
                Ok(decision)
            }
            Err(e) if fail_open => {
                tracing::warn!(
                    client = %key,
                    error = %e,
                    "rate limiter unavailable; admitting request"
                );
                Ok(Decision::Allow(Quota {
                    limit: max_requests,
                    remaining: max_requests,
                    reset_after: window,
                }))
            }
            Err(e) => {
                tracing::error!(
                    client = %key,
                    error = %e,
                    "rate limiter unavailable; refusing request"
                );
                Err(e)
            }
        }
    }

    /// Forget idle clients.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the store cannot be accessed.
    pub fn sweep(&self, now: Instant) -> Result<usize, StoreError> {
        let removed = self.store.sweep(now, self.config.window)?;
        if removed > 0 {
            tracing::debug!(removed, "swept idle rate-limit windows");
        }
        Ok(removed)
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}
