//! # batch-caption
//!
//! Resumable batch image captioning through the Gemini API. Built for
//! multi-hour jobs over large image collections: API keys are rotated on
//! rate limits, transient failures are retried with exponential backoff, and
//! every completed item is checkpointed so an interrupted run picks up where
//! it left off.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use batch_caption::ai::GeminiBackend;
//! use batch_caption::checkpoint::CheckpointStore;
//! use batch_caption::client::CaptionClient;
//! use batch_caption::config::Config;
//! use batch_caption::pipeline::Layout;
//! use batch_caption::processor::{Processor, RunMode, StopSignal};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load(Some("config.json".as_ref()))?;
//!     config.apply_env_overrides();
//!     config.validate()?;
//!
//!     let backend = Arc::new(GeminiBackend::new(
//!         config.gemini.endpoint.clone(),
//!         config.gemini.model.clone(),
//!         config.gemini.max_output_tokens,
//!         Duration::from_secs(config.gemini.request_timeout_secs),
//!     ));
//!     let client = Arc::new(CaptionClient::from_config(&config, backend));
//!     let checkpoint = Arc::new(CheckpointStore::load(
//!         &config.paths.checkpoint_file,
//!         config.processing.checkpoint_flush_every,
//!     )?);
//!
//!     let layout = Layout::new(&config.paths.input_dir, &config.paths.output_dir);
//!     let processor = Processor::new(client, checkpoint, config.processing.max_workers, StopSignal::new());
//!     let summary = processor
//!         .run(layout.collect_items(), RunMode::Normal { retry_failed: true })
//!         .await?;
//!
//!     println!("{} captioned, {} failed", summary.succeeded, summary.failed);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration types and loading/saving
//! - [`ai`]: Captioning backend trait, Gemini backend, error classification
//! - [`keys`]: API key rotation with cooldowns and usage stats
//! - [`limiter`]: Sliding-window call limiter
//! - [`client`]: Retrying, key-rotating captioning client
//! - [`checkpoint`]: Versioned, atomically written progress snapshot
//! - [`pipeline`]: Work items, input enumeration and caption output
//! - [`processor`]: Worker pool, resume and fix passes
//! - [`distribution`]: Splitting remaining work across machines

pub mod ai;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod distribution;
pub mod keys;
pub mod limiter;
pub mod pipeline;
pub mod processor;
