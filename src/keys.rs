//! Round-robin API key rotation with per-key cooldowns.
//!
//! [`KeyRotator::next_credential`] hands out the least recently used key that
//! is not cooling down. A key reported as rate limited is parked for
//! `cooldown_base * 2^(consecutive hits - 1)`, capped at `cooldown_cap`.
//! All counters live in memory; a new run starts from zero.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// One API key plus its usage counters.
#[derive(Debug)]
struct Credential {
    key: String,
    cooldown_until: Option<Instant>,
    /// Sequence number of the last hand-out; 0 = never used.
    last_used: u64,
    requests: u64,
    successes: u64,
    errors: u64,
    rate_limits: u64,
    consecutive_rate_limits: u32,
}

impl Credential {
    fn is_cooling(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }
}

/// A key handed out for one call attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Position of the key in the configured list.
    pub index: usize,
    pub key: String,
}

impl Lease {
    /// Key label safe for logs: `#n (...abcd)`.
    pub fn label(&self) -> String {
        format!("#{} ({})", self.index + 1, mask_key(&self.key))
    }
}

/// Every key is cooling down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("all API keys are cooling down")]
pub struct AllCoolingDown {
    /// When the earliest cooldown expires.
    pub ready_at: Instant,
}

/// Usage counters for one key, as reported by `--show-key-stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyStats {
    /// Masked key, e.g. `...abcd`.
    pub key: String,
    pub requests: u64,
    pub successes: u64,
    pub errors: u64,
    pub rate_limits: u64,
    /// Seconds of cooldown left when the stats were taken.
    #[serde(default)]
    pub cooldown_remaining_secs: u64,
}

impl KeyStats {
    /// Percentage of requests that did not error; 0 when unused.
    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.requests.saturating_sub(self.errors) as f64 / self.requests as f64 * 100.0
    }
}

struct RotatorState {
    credentials: Vec<Credential>,
    seq: u64,
}

/// Shared credential table. All methods take `&self`; one lock guards the table.
pub struct KeyRotator {
    state: Mutex<RotatorState>,
    cooldown_base: Duration,
    cooldown_cap: Duration,
}

impl KeyRotator {
    pub fn new(keys: Vec<String>, cooldown_base: Duration, cooldown_cap: Duration) -> Self {
        let credentials = keys
            .into_iter()
            .map(|key| Credential {
                key,
                cooldown_until: None,
                last_used: 0,
                requests: 0,
                successes: 0,
                errors: 0,
                rate_limits: 0,
                consecutive_rate_limits: 0,
            })
            .collect();
        Self {
            state: Mutex::new(RotatorState { credentials, seq: 0 }),
            cooldown_base,
            cooldown_cap,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand out the least recently used key that is not cooling down.
    ///
    /// Counts one request against the returned key.
    pub fn next_credential(&self) -> Result<Lease, AllCoolingDown> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let picked = state
            .credentials
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_cooling(now))
            .min_by_key(|(i, c)| (c.last_used, *i))
            .map(|(i, _)| i);

        let Some(index) = picked else {
            let ready_at = state
                .credentials
                .iter()
                .filter_map(|c| c.cooldown_until)
                .min()
                .unwrap_or(now);
            return Err(AllCoolingDown { ready_at });
        };

        state.seq += 1;
        let seq = state.seq;
        let cred = &mut state.credentials[index];
        cred.last_used = seq;
        cred.requests += 1;
        Ok(Lease {
            index,
            key: cred.key.clone(),
        })
    }

    /// Like [`next_credential`](Self::next_credential) but waits out cooldowns.
    pub async fn acquire(&self) -> Lease {
        loop {
            match self.next_credential() {
                Ok(lease) => return lease,
                Err(AllCoolingDown { ready_at }) => tokio::time::sleep_until(ready_at).await,
            }
        }
    }

    pub fn report_success(&self, lease: &Lease) {
        let mut state = self.state.lock();
        if let Some(cred) = state.credentials.get_mut(lease.index) {
            cred.successes += 1;
            cred.consecutive_rate_limits = 0;
        }
    }

    /// Put the key on cooldown. Returns the cooldown applied.
    pub fn report_rate_limited(&self, lease: &Lease) -> Duration {
        let now = Instant::now();
        let mut state = self.state.lock();
        let Some(cred) = state.credentials.get_mut(lease.index) else {
            return Duration::ZERO;
        };
        cred.errors += 1;
        cred.rate_limits += 1;
        cred.consecutive_rate_limits = cred.consecutive_rate_limits.saturating_add(1);

        let exponent = (cred.consecutive_rate_limits - 1).min(16);
        let cooldown = self
            .cooldown_base
            .saturating_mul(1u32 << exponent)
            .min(self.cooldown_cap);
        cred.cooldown_until = Some(now + cooldown);
        cooldown
    }

    /// Count a failed attempt that did not involve a rate limit.
    pub fn report_error(&self, lease: &Lease) {
        let mut state = self.state.lock();
        if let Some(cred) = state.credentials.get_mut(lease.index) {
            cred.errors += 1;
        }
    }

    pub fn stats(&self) -> Vec<KeyStats> {
        let now = Instant::now();
        let state = self.state.lock();
        state
            .credentials
            .iter()
            .map(|c| KeyStats {
                key: mask_key(&c.key),
                requests: c.requests,
                successes: c.successes,
                errors: c.errors,
                rate_limits: c.rate_limits,
                cooldown_remaining_secs: c
                    .cooldown_until
                    .map(|until| until.saturating_duration_since(now).as_secs())
                    .unwrap_or(0),
            })
            .collect()
    }
}

/// Show only the last four characters of a key.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("...{tail}")
}

/// Log the per-key statistics table.
pub fn log_key_stats(stats: &[KeyStats]) {
    log::info!("API key statistics:");
    for (i, s) in stats.iter().enumerate() {
        let cooling = if s.cooldown_remaining_secs > 0 {
            format!(", cooling {}s", s.cooldown_remaining_secs)
        } else {
            String::new()
        };
        log::info!(
            "  Key #{} {}: {} requests, {} errors, {} rate limits, {:.1}% success{cooling}",
            i + 1,
            s.key,
            s.requests,
            s.errors,
            s.rate_limits,
            s.success_rate()
        );
    }
}
