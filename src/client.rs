//! Rate-limited captioning client.
//!
//! Wraps one [`CaptionBackend`] call with the shared [`CallLimiter`], key
//! rotation through [`KeyRotator`], and exponential backoff for transient
//! failures. Outcomes per attempt:
//!
//! | Classified error | Action |
//! |---|---|
//! | `RateLimited` | cool the key down, retry at once with the next key |
//! | `Transient` | back off `backoff_delay(attempt)`, retry, up to `max_retries` attempts |
//! | `Rejected` | give up on the item immediately |

use std::sync::Arc;
use std::time::Duration;

use crate::ai::{self, CallError, CaptionBackend, ImagePayload};
use crate::config::Config;
use crate::keys::{AllCoolingDown, KeyRotator};
use crate::limiter::CallLimiter;

/// Retry and backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts allowed for transient failures (the first call included).
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            max_jitter: Duration::from_secs(1),
        }
    }
}

/// Delay before the retry that follows failed attempt `attempt` (1-based).
///
/// `base * 2^(attempt-1)` plus up to `max_jitter` of random jitter, never more
/// than `backoff_cap`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let exponential = policy
        .backoff_base
        .saturating_mul(1u32 << exponent)
        .min(policy.backoff_cap);
    let jitter = policy.max_jitter.mul_f64(fastrand::f64());
    exponential.saturating_add(jitter).min(policy.backoff_cap)
}

/// Why an item could not be captioned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptionError {
    /// Non-retryable: bad input, permanent auth failure, blocked content.
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("gave up after {attempts} attempt(s): {last}")]
    RetriesExhausted { attempts: u32, last: String },
    /// Every key is cooling down and the rate-limit budget is spent.
    #[error("all {keys} API key(s) are rate limited")]
    CredentialsExhausted { keys: usize },
}

impl CaptionError {
    /// Only credential exhaustion stops the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CredentialsExhausted { .. })
    }
}

/// A successful caption.
#[derive(Debug, Clone, PartialEq)]
pub struct Caption {
    pub text: String,
    /// Label of the key that produced it.
    pub key: String,
    /// Attempts used, rate-limited ones included.
    pub attempts: u32,
}

pub type CallResult = Result<Caption, CaptionError>;

pub struct CaptionClient {
    backend: Arc<dyn CaptionBackend>,
    rotator: Arc<KeyRotator>,
    limiter: CallLimiter,
    policy: RetryPolicy,
    prompt: String,
}

impl CaptionClient {
    pub fn new(
        backend: Arc<dyn CaptionBackend>,
        rotator: Arc<KeyRotator>,
        limiter: CallLimiter,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            rotator,
            limiter,
            policy,
            prompt: ai::build_prompt(),
        }
    }

    /// Wire a client from configuration around the given backend.
    pub fn from_config(config: &Config, backend: Arc<dyn CaptionBackend>) -> Self {
        let rotator = Arc::new(KeyRotator::new(
            config.api_keys(),
            config.cooldown_base(),
            config.cooldown_cap(),
        ));
        let limiter = CallLimiter::new(
            config.processing.rate_limit_calls,
            config.rate_limit_period(),
        );
        Self::new(backend, rotator, limiter, config.retry_policy())
    }

    pub fn rotator(&self) -> &KeyRotator {
        &self.rotator
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Caption one image. `item_id` is only used for log lines.
    pub async fn caption(&self, image: &ImagePayload, item_id: &str) -> CallResult {
        let keys = self.rotator.len();
        let rate_limit_budget = self.policy.max_retries.saturating_mul(keys.max(1) as u32);
        let mut transient_failures = 0u32;
        let mut rate_limit_hits = 0u32;
        let mut attempts = 0u32;

        loop {
            let lease = match self.rotator.next_credential() {
                Ok(lease) => lease,
                Err(AllCoolingDown { ready_at }) => {
                    if rate_limit_hits >= rate_limit_budget || keys == 0 {
                        log::error!("All {keys} API key(s) rate limited for {item_id}");
                        return Err(CaptionError::CredentialsExhausted { keys });
                    }
                    log::warn!(
                        "All API keys cooling down, waiting {:?} before retrying {item_id}",
                        ready_at.saturating_duration_since(tokio::time::Instant::now())
                    );
                    tokio::time::sleep_until(ready_at).await;
                    continue;
                }
            };

            self.limiter.acquire().await;
            attempts += 1;

            match self.backend.generate(&lease.key, image, &self.prompt).await {
                Ok(raw) => {
                    let Some(text) = ai::normalize_caption(&raw) else {
                        self.rotator.report_error(&lease);
                        return Err(CaptionError::Rejected("empty response".to_string()));
                    };
                    self.rotator.report_success(&lease);
                    return Ok(Caption {
                        text,
                        key: lease.label(),
                        attempts,
                    });
                }
                Err(CallError::RateLimited(msg)) => {
                    rate_limit_hits += 1;
                    let cooldown = self.rotator.report_rate_limited(&lease);
                    log::warn!(
                        "Rate limit on key {} for {item_id}, cooling down {:?}: {msg}",
                        lease.label(),
                        cooldown
                    );
                }
                Err(CallError::Transient(msg)) => {
                    transient_failures += 1;
                    self.rotator.report_error(&lease);
                    if transient_failures >= self.policy.max_retries {
                        log::error!(
                            "Max retries ({}) reached for {item_id}: {msg}",
                            self.policy.max_retries
                        );
                        return Err(CaptionError::RetriesExhausted {
                            attempts: transient_failures,
                            last: msg,
                        });
                    }
                    let delay = backoff_delay(&self.policy, transient_failures);
                    log::warn!(
                        "Transient error (attempt {}/{}) on key {} for {item_id}: {msg}; retrying in {:.1}s",
                        transient_failures,
                        self.policy.max_retries,
                        lease.label(),
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(CallError::Rejected(msg)) => {
                    self.rotator.report_error(&lease);
                    log::error!("Non-retryable error for {item_id}: {msg}");
                    return Err(CaptionError::Rejected(msg));
                }
            }
        }
    }
}
