//! Coalescing of concurrent identical requests.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::trace;

use crate::error::{Error, Result};

/// How long an erroneous result stays visible to late joiners before the
/// request becomes retryable.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum ErrorExpiry {
    /// Errors become retryable as soon as they resolve.
    #[default]
    Immediate,

    /// Errors stay cached for the given interval.
    After(Duration),

    /// Errors are cached for the life of the deduplicator.
    Never,
}

/// Refines the error expiry per error kind; `None` falls back to the
/// default policy.
pub type ErrorExpiryOverride = fn(&Error) -> Option<ErrorExpiry>;

/// Configuration for a [`RequestDeduplicator`].
#[derive(Copy, Clone, Debug)]
pub struct DeduplicatorOptions {
    /// Keep successful futures so later identical requests short-circuit
    /// within the process.
    pub retain_successes: bool,

    /// Default expiry policy for erroneous results.
    pub error_expiry: ErrorExpiry,

    /// Per-error-kind refinement of the expiry policy.
    pub error_expiry_override: Option<ErrorExpiryOverride>,
}

impl Default for DeduplicatorOptions {
    fn default() -> Self {
        Self {
            retain_successes: true,
            error_expiry: ErrorExpiry::Immediate,
            error_expiry_override: None,
        }
    }
}

impl DeduplicatorOptions {
    fn error_expiry_for(&self, error: &Error) -> ErrorExpiry {
        self.error_expiry_override
            .and_then(|policy| policy(error))
            .unwrap_or(self.error_expiry)
    }
}

type SharedResult<V> = Shared<BoxFuture<'static, Result<V>>>;

/// Coalesces concurrent identical requests onto one in-flight future.
///
/// The first requester for a key starts the computation; every concurrent
/// requester joins the same shared future. Successful results are retained
/// (configurable) as an in-process result cache; erroneous results expire
/// per the configured policy.
pub struct RequestDeduplicator<K, V> {
    inflight: Arc<Mutex<HashMap<K, SharedResult<V>>>>,
    options: DeduplicatorOptions,
}

impl<K, V> RequestDeduplicator<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(options: DeduplicatorOptions) -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            options,
        }
    }

    /// Number of tracked requests (in flight plus retained).
    pub fn len(&self) -> usize {
        self.inflight.lock().expect("deduplicator lock poisoned").len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Request the computation for `key`, starting it via `make` only if no
    /// identical request is already tracked.
    pub async fn request(
        &self,
        key: K,
        make: impl FnOnce() -> BoxFuture<'static, Result<V>>,
    ) -> Result<V> {
        let (future, started) = {
            let mut inflight = self.inflight.lock().expect("deduplicator lock poisoned");
            match inflight.get(&key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let future = make().shared();
                    inflight.insert(key.clone(), future.clone());
                    (future, true)
                }
            }
        };
        if started {
            trace!("started deduplicated request");
        }

        let result = future.clone().await;
        match &result {
            Ok(_) => {
                if !self.options.retain_successes {
                    self.forget(&key, &future);
                }
            }
            Err(error) => match self.options.error_expiry_for(error) {
                ErrorExpiry::Immediate => self.forget(&key, &future),
                ErrorExpiry::After(interval) => {
                    let inflight = Arc::clone(&self.inflight);
                    let key = key.clone();
                    let future = future.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(interval).await;
                        let mut inflight =
                            inflight.lock().expect("deduplicator lock poisoned");
                        if let Some(existing) = inflight.get(&key)
                            && Shared::ptr_eq(existing, &future)
                        {
                            inflight.remove(&key);
                        }
                    });
                }
                ErrorExpiry::Never => {}
            },
        }
        result
    }

    /// Drop the tracked future for `key` if it is still the given one.
    fn forget(&self, key: &K, future: &SharedResult<V>) {
        let mut inflight = self.inflight.lock().expect("deduplicator lock poisoned");
        if let Some(existing) = inflight.get(key)
            && Shared::ptr_eq(existing, future)
        {
            inflight.remove(key);
        }
    }
}
