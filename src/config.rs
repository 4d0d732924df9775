use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::RetryPolicy;

/// Environment variable holding a comma-separated list of API keys.
pub const API_KEYS_ENV: &str = "GEMINI_API_KEYS";

/// Longest backoff or jitter setting accepted, in seconds (one day).
const MAX_DELAY_SECS: f64 = 86_400.0;

/// Top-level configuration for a captioning run.
///
/// Built once at startup and passed by reference into every component;
/// nothing in the crate reads ambient global state.
///
/// # Loading
///
/// ```rust,no_run
/// use batch_caption::config::Config;
///
/// // From a JSON file
/// let mut config = Config::load(Some("config.json".as_ref())).unwrap();
///
/// // Keys from GEMINI_API_KEYS win over the file
/// config.apply_env_overrides();
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Remote captioning endpoint and credentials.
    pub gemini: GeminiConfig,
    /// Worker pool, retry, backoff and rate limiting knobs.
    pub processing: ProcessingConfig,
    /// Input, output and checkpoint locations.
    pub paths: PathsConfig,
}

/// Gemini service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    /// Keys rotated round-robin; at least one is required.
    pub api_keys: Vec<String>,
    pub model: String,
    /// Base URL of the generative language API.
    pub endpoint: String,
    pub max_output_tokens: u32,
    pub request_timeout_secs: u64,
}

/// Controls concurrency, retries and pacing.
///
/// `max_workers`, `max_retries`, `backoff_base` and `backoff_cap` are the
/// core parameters; the rest tune the call limiter, credential cooldowns and
/// checkpoint flushing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Number of concurrent workers.
    pub max_workers: usize,
    /// Attempts allowed per item for transient failures.
    pub max_retries: u32,
    /// Backoff base in seconds.
    pub backoff_base: f64,
    /// Upper bound of any single backoff delay, in seconds.
    pub backoff_cap: f64,
    /// Maximum random jitter added to a backoff delay, in seconds.
    pub max_jitter: f64,
    /// Calls allowed per `rate_limit_period_secs` across all workers.
    pub rate_limit_calls: usize,
    pub rate_limit_period_secs: u64,
    /// First cooldown applied to a rate-limited key; doubles on each repeat.
    pub cooldown_base_secs: u64,
    pub cooldown_cap_secs: u64,
    /// Flush the checkpoint to disk after this many completions.
    pub checkpoint_flush_every: usize,
}

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub checkpoint_file: PathBuf,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            model: "gemini-2.5-flash".to_string(),
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            max_output_tokens: 2048,
            request_timeout_secs: 120,
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            max_retries: 5,
            backoff_base: 1.0,
            backoff_cap: 60.0,
            max_jitter: 1.0,
            rate_limit_calls: 1000,
            rate_limit_period_secs: 60,
            cooldown_base_secs: 30,
            cooldown_cap_secs: 600,
            checkpoint_flush_every: 25,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("images"),
            output_dir: PathBuf::from("captions"),
            checkpoint_file: PathBuf::from("checkpoint.json"),
        }
    }
}

impl Config {
    /// Resolve the config file path next to the executable.
    pub fn config_path() -> Result<PathBuf> {
        let exe_path = std::env::current_exe().context("Failed to get executable path")?;
        let exe_dir = exe_path
            .parent()
            .context("Failed to get executable directory")?;
        Ok(exe_dir.join("config.json"))
    }

    /// Load config from the given path, or from the default location.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            log::warn!(
                "Config file not found at {}. Using defaults.",
                config_path.display()
            );
            return Ok(Self::default());
        }

        let contents =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Save config to the given path, or to the default location.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, contents).context("Failed to write config file")?;
        log::info!("Config saved to {}", config_path.display());
        Ok(())
    }

    /// Replace the configured keys with `GEMINI_API_KEYS` when it is set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var(API_KEYS_ENV) {
            let keys = parse_key_list(&raw);
            if !keys.is_empty() {
                log::debug!("Using {} API key(s) from {API_KEYS_ENV}", keys.len());
                self.gemini.api_keys = keys;
            }
        }
    }

    /// The configured keys with blanks removed.
    pub fn api_keys(&self) -> Vec<String> {
        self.gemini
            .api_keys
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(String::from)
            .collect()
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<()> {
        let p = &self.processing;
        if self.api_keys().is_empty() {
            anyhow::bail!(
                "No API keys configured. Add them to gemini.api_keys or set {API_KEYS_ENV}."
            );
        }
        if p.max_workers == 0 {
            anyhow::bail!("processing.max_workers must be at least 1");
        }
        if p.max_retries == 0 {
            anyhow::bail!("processing.max_retries must be at least 1");
        }
        if !(p.backoff_base.is_finite() && p.backoff_base > 0.0) {
            anyhow::bail!("processing.backoff_base must be a positive number");
        }
        if !(p.backoff_cap.is_finite() && p.backoff_cap >= p.backoff_base) {
            anyhow::bail!("processing.backoff_cap must be >= backoff_base");
        }
        if !(p.max_jitter.is_finite() && p.max_jitter >= 0.0) {
            anyhow::bail!("processing.max_jitter must be zero or positive");
        }
        if p.backoff_cap > MAX_DELAY_SECS || p.max_jitter > MAX_DELAY_SECS {
            anyhow::bail!(
                "processing.backoff_cap and max_jitter must not exceed {MAX_DELAY_SECS} seconds"
            );
        }
        if p.rate_limit_calls == 0 || p.rate_limit_period_secs == 0 {
            anyhow::bail!("processing.rate_limit_calls and rate_limit_period_secs must be non-zero");
        }
        Ok(())
    }

    /// Retry and backoff parameters for [`CaptionClient`](crate::client::CaptionClient).
    pub fn retry_policy(&self) -> RetryPolicy {
        let p = &self.processing;
        RetryPolicy {
            max_retries: p.max_retries,
            backoff_base: delay_secs(p.backoff_base),
            backoff_cap: delay_secs(p.backoff_cap),
            max_jitter: delay_secs(p.max_jitter),
        }
    }

    pub fn cooldown_base(&self) -> Duration {
        Duration::from_secs(self.processing.cooldown_base_secs)
    }

    pub fn cooldown_cap(&self) -> Duration {
        Duration::from_secs(self.processing.cooldown_cap_secs)
    }

    pub fn rate_limit_period(&self) -> Duration {
        Duration::from_secs(self.processing.rate_limit_period_secs)
    }
}

/// Seconds to a `Duration`, clamped to `0..=MAX_DELAY_SECS`; NaN becomes zero.
fn delay_secs(secs: f64) -> Duration {
    if secs.is_nan() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(secs.clamp(0.0, MAX_DELAY_SECS))
}

/// Split a comma or newline separated key list.
fn parse_key_list(raw: &str) -> Vec<String> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(String::from)
        .collect()
}
