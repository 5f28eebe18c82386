//! Retry with exponential backoff and jitter around the scoring call, with an
//! optional TTL cache in front of it.

use crate::cache::ResponseCache;
use crate::errors::{ErrorClass, ScoringError};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    pub retryable: Vec<ErrorClass>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter: true,
            retryable: vec![
                ErrorClass::Timeout,
                ErrorClass::RateLimit,
                ErrorClass::ServerError,
            ],
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// `min(base * 2^(attempt-1), max)` for a 1-based retry attempt, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        let ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Backoff plus up to 10% uniform jitter when enabled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        if !self.jitter {
            return base;
        }
        let base_ms = base.as_millis() as u64;
        let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 10);
        Duration::from_millis(base_ms.saturating_add(jitter_ms))
    }

    fn delay_after(&self, err: &ScoringError, attempt: u32) -> Duration {
        match err {
            ScoringError::RateLimited {
                retry_after: Some(after),
            } => (*after).min(Duration::from_millis(self.max_delay_ms)),
            _ => self.delay_for(attempt),
        }
    }
}

/// What happened during one `RetryingCaller::execute`.
#[derive(Debug)]
pub struct CallOutcome<T> {
    pub result: Result<T, ScoringError>,
    /// Underlying invocations made; 0 on a cache hit.
    pub attempts: u32,
    pub cached: bool,
}

#[derive(Debug, Clone)]
struct CacheHandle {
    cache: Arc<ResponseCache>,
    ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct RetryingCaller {
    policy: RetryPolicy,
    cache: Option<CacheHandle>,
}

impl RetryingCaller {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>, ttl: Duration) -> Self {
        self.cache = Some(CacheHandle { cache, ttl });
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_caching(&self) -> bool {
        self.cache.is_some()
    }

    pub async fn call<T, F, Fut>(&self, cache_key: Option<&str>, op: F) -> Result<T, ScoringError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ScoringError>>,
    {
        self.execute(cache_key, op).await.result
    }

    /// Run `op`, retrying transient failures. A cache hit skips the call and all
    /// retry bookkeeping; only successful values are cached.
    pub async fn execute<T, F, Fut>(&self, cache_key: Option<&str>, mut op: F) -> CallOutcome<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ScoringError>>,
    {
        let cache = self.cache.as_ref().zip(cache_key);

        if let Some((handle, key)) = cache {
            if let Some(hit) = handle.cache.get(key) {
                match serde_json::from_value::<T>(hit) {
                    Ok(value) => {
                        debug!(cache_key = key, "scoring cache hit");
                        return CallOutcome {
                            result: Ok(value),
                            attempts: 0,
                            cached: true,
                        };
                    }
                    Err(e) => warn!(cache_key = key, error = %e, "discarding undecodable cache entry"),
                }
            }
        }

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => {
                    if let Some((handle, key)) = cache {
                        match serde_json::to_value(&value) {
                            Ok(json) => handle.cache.insert(key.to_string(), json, handle.ttl),
                            Err(e) => warn!(cache_key = key, error = %e, "value not cacheable"),
                        }
                    }
                    return CallOutcome {
                        result: Ok(value),
                        attempts,
                        cached: false,
                    };
                }
                Err(e)
                    if e.is_retryable(&self.policy.retryable)
                        && attempts <= self.policy.max_retries =>
                {
                    let backoff = self.policy.delay_after(&e, attempts);
                    warn!(
                        error = %e,
                        attempt = attempts,
                        max_retries = self.policy.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying scoring call"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    return CallOutcome {
                        result: Err(e),
                        attempts,
                        cached: false,
                    };
                }
            }
        }
    }
}
