use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use batch_caption::ai::GeminiBackend;
use batch_caption::checkpoint::{CheckpointStore, Snapshot};
use batch_caption::client::CaptionClient;
use batch_caption::config::Config;
use batch_caption::distribution;
use batch_caption::keys::{self, KeyStats};
use batch_caption::pipeline::{Layout, WorkItem};
use batch_caption::processor::{Processor, RunAborted, RunMode, RunSummary, StopSignal};

/// Where the list of work items comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Walk the input directory
    Local,
    /// Read the items listed in --worker-file
    Worker,
}

#[derive(Parser, Debug)]
#[command(
    name = "batch-caption",
    version,
    about = "Resumable batch image captioning with Gemini API key rotation"
)]
struct Cli {
    /// Path to config file (default: config.json next to binary)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Initialize a default config.json and exit
    #[arg(long)]
    init: bool,

    /// Processing mode
    #[arg(long, value_enum, default_value_t = Mode::Local)]
    mode: Mode,

    /// File listing the images to process, one per line (worker mode)
    #[arg(long, value_name = "FILE")]
    worker_file: Option<PathBuf>,

    /// Worker id shown in log lines
    #[arg(long, default_value = "default")]
    worker_id: String,

    /// Override the input directory
    #[arg(long, value_name = "DIR")]
    input_dir: Option<PathBuf>,

    /// Override the output directory
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Override the checkpoint file
    #[arg(long, value_name = "FILE")]
    checkpoint: Option<PathBuf>,

    /// Maximum number of concurrent workers
    #[arg(long)]
    max_workers: Option<usize>,

    /// Maximum attempts per image for transient API errors
    #[arg(long)]
    retries: Option<u32>,

    /// Only retry images that failed in a previous run
    #[arg(long)]
    fix: bool,

    /// Don't retry previously failed images in a normal run
    #[arg(long)]
    no_retry_errors: bool,

    /// Show API key statistics from the last run and exit
    #[arg(long)]
    show_key_stats: bool,

    /// Split the remaining work into N worker files and exit
    #[arg(long, value_name = "N")]
    split: Option<usize>,

    /// Directory for --split output
    #[arg(long, value_name = "DIR", default_value = "work_distribution")]
    split_dir: PathBuf,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    if let Err(e) = dotenvy::dotenv() {
        log::debug!("No .env loaded: {e}");
    }

    // Handle --init
    if cli.init {
        let config = Config::default();
        let path = cli.config.as_deref();
        config.save(path)?;
        let save_path = match path {
            Some(p) => p.to_path_buf(),
            None => Config::config_path()?,
        };
        println!("Default config written to {}", save_path.display());
        return Ok(());
    }

    let config = load_config(&cli)?;

    // Handle --show-key-stats
    if cli.show_key_stats {
        show_key_stats(&config)?;
        return Ok(());
    }

    let layout = Layout::new(&config.paths.input_dir, &config.paths.output_dir);
    let items = collect_items(&cli, &layout)?;
    if items.is_empty() {
        log::warn!("No images found to process.");
        return Ok(());
    }

    // Handle --split
    if let Some(workers) = cli.split {
        let checkpoint = CheckpointStore::load(&config.paths.checkpoint_file, 1)?;
        let remaining: Vec<WorkItem> = items
            .into_iter()
            .filter(|item| !checkpoint.is_done(&item.id))
            .collect();
        log::info!(
            "{} image(s) already done, {} remaining",
            checkpoint.done_count(),
            remaining.len()
        );
        let files = distribution::write_worker_files(&remaining, workers, &cli.split_dir)?;
        println!("Wrote {} worker file(s) to {}", files.len(), cli.split_dir.display());
        return Ok(());
    }

    config.validate()?;

    let keys = config.api_keys();
    log::info!(
        "Retry configuration: max {} attempts, backoff {}s..{}s",
        config.processing.max_retries,
        config.processing.backoff_base,
        config.processing.backoff_cap
    );
    log::info!("Available API keys: {}", keys.len());

    let backend = Arc::new(GeminiBackend::new(
        config.gemini.endpoint.clone(),
        config.gemini.model.clone(),
        config.gemini.max_output_tokens,
        Duration::from_secs(config.gemini.request_timeout_secs),
    ));
    let client = Arc::new(CaptionClient::from_config(&config, backend));
    let checkpoint = Arc::new(CheckpointStore::load(
        &config.paths.checkpoint_file,
        config.processing.checkpoint_flush_every,
    )?);

    let stop = StopSignal::new();
    spawn_signal_handler(stop.clone(), Arc::clone(&checkpoint));

    let mut processor = Processor::new(
        client,
        checkpoint,
        config.processing.max_workers,
        stop,
    );
    if cli.mode == Mode::Worker {
        processor = processor.with_worker_id(cli.worker_id.clone());
    }

    let mode = if cli.fix {
        RunMode::Fix
    } else {
        RunMode::Normal {
            retry_failed: !cli.no_retry_errors,
        }
    };

    match processor.run(items, mode).await {
        Ok(summary) => print_summary(&summary, &cli),
        Err(err) => {
            // Still tell the user what failed before the abort.
            if let Some(aborted) = err.downcast_ref::<RunAborted>() {
                print_summary(&aborted.summary, &cli)?;
            }
            Err(err)
        }
    }
}

fn print_summary(summary: &RunSummary, cli: &Cli) -> Result<()> {
    report(summary, cli.fix);
    if cli.json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    }
    Ok(())
}

/// Load the config file and apply env and CLI overrides.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    config.apply_env_overrides();

    if let Some(dir) = &cli.input_dir {
        config.paths.input_dir = dir.clone();
    }
    if let Some(dir) = &cli.output_dir {
        config.paths.output_dir = dir.clone();
    }
    if let Some(file) = &cli.checkpoint {
        config.paths.checkpoint_file = file.clone();
    }
    if let Some(n) = cli.max_workers {
        config.processing.max_workers = n;
    }
    if let Some(n) = cli.retries {
        config.processing.max_retries = n;
    }
    Ok(config)
}

fn collect_items(cli: &Cli, layout: &Layout) -> Result<Vec<WorkItem>> {
    match cli.mode {
        Mode::Local => {
            log::info!("Scanning {}", layout.input_dir.display());
            Ok(layout.collect_items())
        }
        Mode::Worker => {
            let file = cli
                .worker_file
                .as_deref()
                .context("Worker mode needs --worker-file")?;
            let items = layout.items_from_worker_file(file)?;
            log::info!(
                "[worker {}] Loaded {} assigned image(s) from {}",
                cli.worker_id,
                items.len(),
                file.display()
            );
            Ok(items)
        }
    }
}

/// Print key statistics recorded by the last run, or the configured keys if none.
fn show_key_stats(config: &Config) -> Result<()> {
    let path = &config.paths.checkpoint_file;
    let recorded = if path.exists() {
        Snapshot::read(path)?.key_stats
    } else {
        Vec::new()
    };

    let stats = if recorded.is_empty() {
        log::info!("No recorded key statistics; showing configured keys");
        config
            .api_keys()
            .iter()
            .map(|k| KeyStats {
                key: keys::mask_key(k),
                requests: 0,
                successes: 0,
                errors: 0,
                rate_limits: 0,
                cooldown_remaining_secs: 0,
            })
            .collect()
    } else {
        recorded
    };

    if stats.is_empty() {
        anyhow::bail!("No API keys configured.");
    }
    keys::log_key_stats(&stats);
    Ok(())
}

/// Ctrl-C and SIGTERM, merged into one stream.
struct ShutdownSignals {
    #[cfg(unix)]
    term: Option<tokio::signal::unix::Signal>,
}

impl ShutdownSignals {
    fn new() -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let term = signal(SignalKind::terminate())
                .map_err(|e| log::warn!("Cannot listen for SIGTERM: {e}"))
                .ok();
            Self { term }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        if let Some(term) = self.term.as_mut() {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            return;
        }
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Raise the stop signal on the first Ctrl-C or SIGTERM; exit on the second.
///
/// Workers can sit in a key cooldown or the call limiter for minutes, so a
/// repeated signal saves the checkpoint and exits without waiting for them.
fn spawn_signal_handler(stop: StopSignal, checkpoint: Arc<CheckpointStore>) {
    tokio::spawn(async move {
        let mut signals = ShutdownSignals::new();
        loop {
            signals.recv().await;
            if stop.stop() {
                log::warn!("Second interrupt, exiting without waiting for in-flight images.");
                checkpoint.flush();
                std::process::exit(130);
            }
            log::warn!("Shutdown requested. Waiting for in-flight images to finish...");
            log::warn!("Progress will be saved; run the same command again to resume.");
            log::warn!("Press Ctrl-C again to exit immediately.");
        }
    });
}

fn report(summary: &RunSummary, fix: bool) {
    log::info!(
        "Done: {} succeeded, {} failed, {} skipped out of {} image(s)",
        summary.succeeded,
        summary.failed,
        summary.skipped,
        summary.total
    );

    if !summary.failures.is_empty() {
        log::warn!("Failed images:");
        for (id, reason) in &summary.failures {
            log::warn!("  {id}: {reason}");
        }
        if !fix {
            log::warn!("Run with --fix to retry only the failed images.");
        }
    }

    if summary.stopped {
        println!("Processing paused. Resume by running the same command again.");
    } else if summary.failed == 0 {
        println!("Processing complete.");
    } else {
        println!("Processing finished with {} failure(s).", summary.failed);
    }
}
