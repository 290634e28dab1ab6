//! Retrying invoker for remote calls
//!
//! Every call to the remote port goes through [`RetryingInvoker::invoke`],
//! which is the only place remote failures are classified:
//!
//! | Outcome                       | Handling                                   |
//! |-------------------------------|--------------------------------------------|
//! | `Ok(Some(v))`                 | returned                                   |
//! | `Ok(None)`                    | retried; `RetriesExhausted` past the budget |
//! | `Err(RemoteError::NotFound)`  | `Ok(None)` immediately                     |
//! | `Err(RemoteError::Unauthorized)` | retried after a credential refresh      |
//! | any other error               | `MirrorError::Remote`, no retry            |
//!
//! Attempts after the first wait `base * 2^n` (capped) and force a credential
//! refresh first.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cloudmirror_core::config::RetryConfig;
use cloudmirror_core::domain::{MirrorError, RemoteError};
use cloudmirror_core::ports::IRemoteStorageService;
use tracing::{debug, info, warn};

/// Default attempts per call, including the first
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Default delay before the second attempt
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Default cap on a single delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

// ============================================================================
// Backoff
// ============================================================================

/// Exponential backoff schedule: `delay(n) = base * 2^n`, capped at `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay to wait after the `n`-th failed attempt (0-based)
    pub fn delay(&self, n: u32) -> Duration {
        let factor = 2u32.checked_pow(n).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

// ============================================================================
// Classification
// ============================================================================

/// What to do with one failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// The entry does not exist; answer `None`
    Absent,
    /// Refresh credentials and try again
    Retry,
    /// Surface to the caller
    Fail,
}

fn classify(err: &RemoteError) -> Disposition {
    match err {
        RemoteError::NotFound(_) => Disposition::Absent,
        RemoteError::Unauthorized(_) => Disposition::Retry,
        RemoteError::Conflict(_)
        | RemoteError::Gone(_)
        | RemoteError::RateLimited(_)
        | RemoteError::Server(_)
        | RemoteError::Network(_)
        | RemoteError::InvalidResponse(_) => Disposition::Fail,
    }
}

// ============================================================================
// RetryingInvoker
// ============================================================================

/// Executes remote operations with bounded retries and error translation
#[derive(Clone)]
pub struct RetryingInvoker {
    remote: Arc<dyn IRemoteStorageService>,
    max_attempts: u32,
    backoff: Backoff,
}

impl RetryingInvoker {
    /// Invoker with the default budget (10 attempts, 100 ms doubling)
    pub fn new(remote: Arc<dyn IRemoteStorageService>) -> Self {
        Self {
            remote,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::default(),
        }
    }

    pub fn from_config(remote: Arc<dyn IRemoteStorageService>, config: &RetryConfig) -> Self {
        Self {
            remote,
            max_attempts: config.max_attempts.max(1),
            backoff: Backoff::new(config.base_delay(), config.max_delay()),
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// The remote port calls are made against
    pub fn remote(&self) -> &Arc<dyn IRemoteStorageService> {
        &self.remote
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `op` until it yields a value, the remote confirms absence, or the
    /// budget runs out.
    ///
    /// `Ok(None)` means the remote reported not-found.
    pub async fn invoke<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<Option<T>, MirrorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, RemoteError>>,
    {
        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let delay = self.backoff.delay(attempt - 1);
                tokio::time::sleep(delay).await;

                if let Err(err) = self.remote.refresh_credentials().await {
                    warn!(
                        operation,
                        attempt,
                        error = %err,
                        "Credential refresh failed, attempting anyway"
                    );
                }
            }

            match op().await {
                Ok(Some(value)) => {
                    if attempt > 0 {
                        info!(operation, attempt, "Operation succeeded after retry");
                    }
                    return Ok(Some(value));
                }
                Ok(None) => {
                    debug!(
                        operation,
                        attempt,
                        delay_ms = self.backoff.delay(attempt).as_millis() as u64,
                        "Empty result, retrying"
                    );
                }
                Err(err) => match classify(&err) {
                    Disposition::Absent => {
                        debug!(operation, error = %err, "Remote reported not found");
                        return Ok(None);
                    }
                    Disposition::Retry => {
                        warn!(
                            operation,
                            attempt,
                            delay_ms = self.backoff.delay(attempt).as_millis() as u64,
                            error = %err,
                            "Unauthorized, refreshing credentials and retrying"
                        );
                    }
                    Disposition::Fail => {
                        return Err(MirrorError::Remote {
                            operation: operation.to_string(),
                            source: err,
                        });
                    }
                },
            }
        }

        warn!(operation, attempts = self.max_attempts, "Retry budget exhausted");
        Err(MirrorError::RetriesExhausted {
            operation: operation.to_string(),
            attempts: self.max_attempts,
        })
    }

    /// Like [`invoke`](Self::invoke), but a not-found answer is an error.
    pub async fn invoke_required<T, F, Fut>(
        &self,
        operation: &str,
        id: impl Display,
        op: F,
    ) -> Result<T, MirrorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, RemoteError>>,
    {
        self.invoke(operation, op)
            .await?
            .ok_or_else(|| MirrorError::NotFound {
                operation: operation.to_string(),
                id: id.to_string(),
            })
    }
}

impl std::fmt::Debug for RetryingInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingInvoker")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}
