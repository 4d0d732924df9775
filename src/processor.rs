//! Bounded worker pool that captions pending items.
//!
//! Items already in the checkpoint are filtered out before anything is
//! dispatched. Each worker pulls from a shared queue, calls the
//! [`CaptionClient`], writes the caption atomically and records the outcome in
//! the [`CheckpointStore`]. A raised [`StopSignal`] is observed between items:
//! in-flight calls finish, no new items are taken, and the checkpoint is
//! flushed before [`Processor::run`] returns. A run that aborts on credential
//! exhaustion returns [`RunAborted`], which still carries the summary.

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::ai::ImagePayload;
use crate::checkpoint::CheckpointStore;
use crate::client::{CaptionClient, CaptionError};
use crate::keys;
use crate::pipeline::{self, WorkItem};

/// Which items a run dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Everything not yet done. Previously failed items are included unless
    /// `retry_failed` is false.
    Normal { retry_failed: bool },
    /// Only items recorded as failed by an earlier run.
    Fix,
}

/// Cooperative cancellation flag shared by the workers and the signal handler.
#[derive(Debug, Clone)]
pub struct StopSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Request a stop. Returns true if one had already been requested.
    pub fn stop(&self) -> bool {
        self.sender.send_replace(true)
    }

    pub fn is_stopped(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once [`stop`](Self::stop) has been called.
    pub async fn stopped(&self) {
        let mut rx = self.sender.subscribe();
        // The sender lives in `self`, so this only errors if it is dropped.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Outcome of one [`Processor::run`].
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct RunSummary {
    /// Items handed to the run.
    pub total: usize,
    /// Items that passed the checkpoint filter.
    pub pending: usize,
    /// Items a worker actually picked up.
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Items skipped because the checkpoint already had them.
    pub skipped: usize,
    /// Failed items with the reason, sorted by id.
    pub failures: Vec<(String, String)>,
    /// True if the run ended early because of a stop request.
    pub stopped: bool,
}

/// A run stopped early because no API key could serve requests.
///
/// Progress is flushed before this is returned; `summary` holds what the run
/// achieved up to the abort, failures included.
#[derive(Debug, thiserror::Error)]
#[error("Run aborted, progress saved")]
pub struct RunAborted {
    pub summary: RunSummary,
    #[source]
    pub cause: CaptionError,
}

#[derive(Default)]
struct WorkerTally {
    dispatched: usize,
    succeeded: usize,
    failures: Vec<(String, String)>,
    fatal: Option<CaptionError>,
}

enum ItemOutcome {
    Done,
    Failed(String),
    Fatal(CaptionError),
}

/// Shared state handed to every worker task.
struct Shared {
    client: Arc<CaptionClient>,
    checkpoint: Arc<CheckpointStore>,
    stop: StopSignal,
    queue: Mutex<VecDeque<WorkItem>>,
    progress: AtomicUsize,
    pending: usize,
    label: String,
}

pub struct Processor {
    client: Arc<CaptionClient>,
    checkpoint: Arc<CheckpointStore>,
    max_workers: usize,
    stop: StopSignal,
    worker_id: Option<String>,
}

impl Processor {
    pub fn new(
        client: Arc<CaptionClient>,
        checkpoint: Arc<CheckpointStore>,
        max_workers: usize,
        stop: StopSignal,
    ) -> Self {
        Self {
            client,
            checkpoint,
            max_workers: max_workers.max(1),
            stop,
            worker_id: None,
        }
    }

    /// Tag log lines with a worker id (for distributed runs).
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    /// Items of `items` that `mode` would dispatch, plus how many were already done.
    pub fn select_pending(&self, items: Vec<WorkItem>, mode: RunMode) -> (Vec<WorkItem>, usize) {
        let mut skipped = 0;
        let pending = items
            .into_iter()
            .filter(|item| {
                if self.checkpoint.is_done(&item.id) {
                    skipped += 1;
                    return false;
                }
                let failed = self.checkpoint.is_failed(&item.id);
                match mode {
                    RunMode::Normal { retry_failed } => retry_failed || !failed,
                    RunMode::Fix => failed,
                }
            })
            .collect();
        (pending, skipped)
    }

    /// Caption every pending item of `items`.
    ///
    /// Per-item failures are recorded and reported in the summary. Only
    /// [`CaptionError::CredentialsExhausted`] aborts the run: the checkpoint is
    /// flushed and the error is a [`RunAborted`] holding the summary.
    pub async fn run(&self, items: Vec<WorkItem>, mode: RunMode) -> Result<RunSummary> {
        let total = items.len();
        let (pending, skipped) = self.select_pending(items, mode);
        self.checkpoint.mark_skipped(skipped as u64);

        let label = match &self.worker_id {
            Some(id) => format!("[worker {id}] "),
            None => String::new(),
        };
        log::info!(
            "{label}Total: {total}, already done: {skipped}, to process: {}",
            pending.len()
        );

        let mut summary = RunSummary {
            total,
            pending: pending.len(),
            skipped,
            ..RunSummary::default()
        };
        if pending.is_empty() {
            self.finish();
            return Ok(summary);
        }

        let workers = self.max_workers.min(pending.len());
        let shared = Arc::new(Shared {
            client: Arc::clone(&self.client),
            checkpoint: Arc::clone(&self.checkpoint),
            stop: self.stop.clone(),
            pending: pending.len(),
            queue: Mutex::new(pending.into()),
            progress: AtomicUsize::new(0),
            label,
        });

        let mut set = JoinSet::new();
        for _ in 0..workers {
            set.spawn(worker_loop(Arc::clone(&shared)));
        }

        let mut fatal = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(tally) => {
                    summary.dispatched += tally.dispatched;
                    summary.succeeded += tally.succeeded;
                    summary.failures.extend(tally.failures);
                    if fatal.is_none() {
                        fatal = tally.fatal;
                    }
                }
                Err(e) => log::error!("Worker task ended abnormally: {e}"),
            }
        }

        summary.failures.sort();
        summary.failed = summary.failures.len();
        summary.stopped = self.stop.is_stopped();
        self.finish();

        match fatal {
            Some(cause) => Err(RunAborted { summary, cause }.into()),
            None => Ok(summary),
        }
    }

    /// Persist key stats and flush the checkpoint.
    fn finish(&self) {
        let stats = self.client.rotator().stats();
        keys::log_key_stats(&stats);
        self.checkpoint.set_key_stats(stats);
        self.checkpoint.flush();
    }
}

async fn worker_loop(shared: Arc<Shared>) -> WorkerTally {
    let mut tally = WorkerTally::default();

    loop {
        if shared.stop.is_stopped() {
            break;
        }
        let Some(item) = shared.queue.lock().pop_front() else {
            break;
        };
        tally.dispatched += 1;

        let outcome = process_item(&shared, &item).await;
        let n = shared.progress.fetch_add(1, Ordering::Relaxed) + 1;
        match outcome {
            ItemOutcome::Done => {
                tally.succeeded += 1;
                log::info!("{}[{n}/{}] Processed: {}", shared.label, shared.pending, item.id);
            }
            ItemOutcome::Failed(reason) => {
                log::error!(
                    "{}[{n}/{}] Failed: {}: {reason}",
                    shared.label,
                    shared.pending,
                    item.id
                );
                shared.checkpoint.mark_failed(&item.id, &reason);
                tally.failures.push((item.id.clone(), reason));
            }
            ItemOutcome::Fatal(err) => {
                log::error!("{}Stopping run: {err}", shared.label);
                let _ = shared.stop.stop();
                tally.fatal = Some(err);
                break;
            }
        }
    }

    tally
}

async fn process_item(shared: &Shared, item: &WorkItem) -> ItemOutcome {
    let bytes = match std::fs::read(&item.input_path) {
        Ok(bytes) => bytes,
        Err(e) => return ItemOutcome::Failed(format!("failed to read image: {e}")),
    };
    let payload = ImagePayload::from_bytes(&bytes, item.mime_type());

    match shared.client.caption(&payload, &item.id).await {
        Ok(caption) => match pipeline::write_caption(&item.output_path, &caption.text) {
            Ok(()) => {
                log::debug!("{} captioned with key {}", item.id, caption.key);
                shared.checkpoint.mark_done(&item.id);
                ItemOutcome::Done
            }
            Err(e) => ItemOutcome::Failed(format!("{e:#}")),
        },
        Err(err) if err.is_fatal() => ItemOutcome::Fatal(err),
        Err(err) => ItemOutcome::Failed(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{CallError, CaptionBackend};
    use crate::checkpoint::Snapshot;
    use crate::client::RetryPolicy;
    use crate::client::tests::ScriptedBackend;
    use crate::keys::KeyRotator;
    use crate::limiter::CallLimiter;
    use crate::pipeline::Layout;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        layout: Layout,
    }

    impl Fixture {
        fn new(images: &[&str]) -> Self {
            let dir = TempDir::new().unwrap();
            let layout = Layout::new(dir.path().join("in"), dir.path().join("out"));
            for name in images {
                let path = layout.input_dir.join(name);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(path, b"fake image").unwrap();
            }
            Self { dir, layout }
        }

        fn checkpoint_path(&self) -> std::path::PathBuf {
            self.dir.path().join("checkpoint.json")
        }

        fn checkpoint(&self) -> Arc<CheckpointStore> {
            Arc::new(CheckpointStore::load(&self.checkpoint_path(), 100).unwrap())
        }

        fn processor(
            &self,
            backend: Arc<ScriptedBackend>,
            keys: &[&str],
            max_retries: u32,
            max_workers: usize,
        ) -> Processor {
            self.processor_with_stop(backend, keys, max_retries, max_workers, StopSignal::new())
        }

        fn processor_with_stop(
            &self,
            backend: Arc<dyn CaptionBackend>,
            keys: &[&str],
            max_retries: u32,
            max_workers: usize,
            stop: StopSignal,
        ) -> Processor {
            let rotator = Arc::new(KeyRotator::new(
                keys.iter().map(|k| k.to_string()).collect(),
                Duration::from_secs(30),
                Duration::from_secs(300),
            ));
            let client = CaptionClient::new(
                backend,
                rotator,
                CallLimiter::new(1000, Duration::from_secs(60)),
                RetryPolicy {
                    max_retries,
                    backoff_base: Duration::from_millis(100),
                    backoff_cap: Duration::from_secs(2),
                    max_jitter: Duration::from_millis(10),
                },
            );
            Processor::new(Arc::new(client), self.checkpoint(), max_workers, stop)
        }
    }

    fn ok(caption: &str) -> Result<String, CallError> {
        Ok(format!(r#"{{"caption": "{caption}"}}"#))
    }

    // ── select_pending ───────────────────────────────────────────────

    #[tokio::test]
    async fn select_pending_per_mode() {
        let fx = Fixture::new(&[]);
        let mut snapshot = Snapshot::default();
        snapshot.done.insert("done.jpg".into());
        snapshot.failed.insert("failed.jpg".into(), "boom".into());
        snapshot.write(&fx.checkpoint_path()).unwrap();

        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let p = fx.processor(backend, &["k"], 3, 1);
        let items = || {
            ["done.jpg", "failed.jpg", "new.jpg"]
                .iter()
                .map(|id| fx.layout.item(id))
                .collect::<Vec<_>>()
        };
        let ids = |v: Vec<WorkItem>| v.into_iter().map(|i| i.id).collect::<Vec<_>>();

        let (pending, skipped) = p.select_pending(items(), RunMode::Normal { retry_failed: true });
        assert_eq!(ids(pending), vec!["failed.jpg", "new.jpg"]);
        assert_eq!(skipped, 1);

        let (pending, _) = p.select_pending(items(), RunMode::Normal { retry_failed: false });
        assert_eq!(ids(pending), vec!["new.jpg"]);

        let (pending, _) = p.select_pending(items(), RunMode::Fix);
        assert_eq!(ids(pending), vec!["failed.jpg"]);
    }

    // ── run ──────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn captions_all_items_and_writes_outputs() {
        let fx = Fixture::new(&["a/1.jpg", "a/2.png", "b/3.jpg"]);
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let p = fx.processor(backend.clone(), &["k1", "k2"], 3, 4);

        let summary = p
            .run(fx.layout.collect_items(), RunMode::Normal { retry_failed: true })
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.failed, 0);
        assert!(!summary.stopped);
        for id in ["a/1.txt", "a/2.txt", "b/3.txt"] {
            let text = fs::read_to_string(fx.layout.output_dir.join(id)).unwrap();
            assert!(text.contains("\"caption\""));
        }
        let on_disk = Snapshot::read(&fx.checkpoint_path()).unwrap();
        assert_eq!(on_disk.done.len(), 3);
        assert_eq!(on_disk.key_stats.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_first_call_rotates_to_second_key() {
        let fx = Fixture::new(&["1.jpg", "2.jpg", "3.jpg"]);
        let backend = Arc::new(ScriptedBackend::new(vec![Err(CallError::RateLimited(
            "HTTP 429".into(),
        ))]));
        let p = fx.processor(backend.clone(), &["key-A", "key-B"], 5, 1);

        let summary = p
            .run(fx.layout.collect_items(), RunMode::Normal { retry_failed: true })
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 3);
        let calls = backend.calls.lock().clone();
        assert_eq!(&calls[..2], &["key-A".to_string(), "key-B".to_string()]);
        // Key A stays on cooldown for the rest of this short run.
        assert!(calls[1..].iter().all(|k| k == "key-B"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_go_to_failure_log_not_checkpoint() {
        let fx = Fixture::new(&["bad.jpg", "good.jpg"]);
        let transient = Err(CallError::Transient("HTTP 503".into()));
        // bad.jpg is processed first (sorted) and fails five times.
        let script = vec![transient.clone(); 5];
        let backend = Arc::new(ScriptedBackend::new(script).with_fallback(ok("fine")));
        let p = fx.processor(backend.clone(), &["k"], 5, 1);

        let summary = p
            .run(fx.layout.collect_items(), RunMode::Normal { retry_failed: true })
            .await
            .unwrap();

        assert_eq!(backend.call_count(), 6);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].0, "bad.jpg");
        assert!(!p.checkpoint().is_done("bad.jpg"));
        assert!(p.checkpoint().is_failed("bad.jpg"));
        assert!(p.checkpoint().is_done("good.jpg"));
        assert!(!fx.layout.output_dir.join("bad.txt").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_dispatches_only_remaining_items() {
        let fx = Fixture::new(&["1.jpg", "2.jpg", "3.jpg", "4.jpg", "5.jpg"]);
        let mut snapshot = Snapshot::default();
        snapshot.done.insert("2.jpg".into());
        snapshot.done.insert("4.jpg".into());
        snapshot.write(&fx.checkpoint_path()).unwrap();

        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let p = fx.processor(backend.clone(), &["k"], 3, 2);
        let summary = p
            .run(fx.layout.collect_items(), RunMode::Normal { retry_failed: true })
            .await
            .unwrap();

        assert_eq!(backend.call_count(), 3);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.dispatched, 3);
        assert!(!fx.layout.output_dir.join("2.txt").exists());
        assert_eq!(p.checkpoint().done_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_makes_no_calls() {
        let fx = Fixture::new(&["1.jpg", "2.jpg"]);
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        fx.processor(backend.clone(), &["k"], 3, 2)
            .run(fx.layout.collect_items(), RunMode::Normal { retry_failed: true })
            .await
            .unwrap();
        assert_eq!(backend.call_count(), 2);

        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let summary = fx
            .processor(backend.clone(), &["k"], 3, 2)
            .run(fx.layout.collect_items(), RunMode::Normal { retry_failed: true })
            .await
            .unwrap();
        assert_eq!(backend.call_count(), 0);
        assert_eq!(summary.skipped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fix_pass_retries_only_failed_items() {
        let fx = Fixture::new(&["1.jpg", "2.jpg", "3.jpg"]);
        let mut snapshot = Snapshot::default();
        snapshot.done.insert("1.jpg".into());
        snapshot.failed.insert("2.jpg".into(), "HTTP 503".into());
        snapshot.write(&fx.checkpoint_path()).unwrap();

        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let p = fx.processor(backend.clone(), &["k"], 3, 2);
        let summary = p.run(fx.layout.collect_items(), RunMode::Fix).await.unwrap();

        assert_eq!(backend.call_count(), 1);
        assert_eq!(summary.succeeded, 1);
        assert!(p.checkpoint().is_done("2.jpg"));
        assert!(p.checkpoint().failed_ids().is_empty());
        assert!(!p.checkpoint().is_done("3.jpg"));
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_image_is_recorded_as_failure() {
        let fx = Fixture::new(&[]);
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let p = fx.processor(backend.clone(), &["k"], 3, 1);
        let summary = p
            .run(vec![fx.layout.item("missing.jpg")], RunMode::Normal { retry_failed: true })
            .await
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_signal_prevents_new_items() {
        let fx = Fixture::new(&["1.jpg", "2.jpg", "3.jpg"]);
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let p = fx.processor(backend.clone(), &["k"], 3, 1);
        let _ = p.stop.stop();

        let summary = p
            .run(fx.layout.collect_items(), RunMode::Normal { retry_failed: true })
            .await
            .unwrap();

        assert!(summary.stopped);
        assert_eq!(summary.dispatched, 0);
        assert_eq!(backend.call_count(), 0);
        // The checkpoint is still flushed on the way out.
        assert!(fx.checkpoint_path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn credential_exhaustion_aborts_and_flushes() {
        let fx = Fixture::new(&["1.jpg", "2.jpg", "3.jpg"]);
        let backend = Arc::new(
            ScriptedBackend::new(vec![ok("first")])
                .with_fallback(Err(CallError::RateLimited("HTTP 429".into()))),
        );
        let p = fx.processor(backend.clone(), &["k"], 2, 1);

        let err = p
            .run(fx.layout.collect_items(), RunMode::Normal { retry_failed: true })
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("rate limited"));
        assert!(p.stop.is_stopped());
        let on_disk = Snapshot::read(&fx.checkpoint_path()).unwrap();
        assert!(on_disk.done.contains("1.jpg"));
        // The aborted item is not blamed; it stays pending for the next run.
        assert!(on_disk.failed.is_empty());
        assert!(!on_disk.done.contains("3.jpg"));
    }

    /// Raises the stop signal from inside its first call, then captions normally.
    struct StopOnFirstCall {
        stop: StopSignal,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CaptionBackend for StopOnFirstCall {
        fn name(&self) -> &str {
            "StopOnFirstCall"
        }

        async fn generate(
            &self,
            _api_key: &str,
            _image: &ImagePayload,
            _prompt: &str,
        ) -> Result<String, CallError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                let _ = self.stop.stop();
            }
            ok("still finished")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_call_finishes_in_flight_item_only() {
        let fx = Fixture::new(&["1.jpg", "2.jpg", "3.jpg", "4.jpg"]);
        let stop = StopSignal::new();
        let backend = Arc::new(StopOnFirstCall {
            stop: stop.clone(),
            calls: AtomicUsize::new(0),
        });
        let p = fx.processor_with_stop(backend.clone(), &["k"], 3, 2, stop);

        let summary = p
            .run(fx.layout.collect_items(), RunMode::Normal { retry_failed: true })
            .await
            .unwrap();

        assert!(summary.stopped);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.succeeded, 1);
        // The in-flight item completed and reached disk via the final flush.
        assert!(fx.layout.output_dir.join("1.txt").exists());
        let on_disk = Snapshot::read(&fx.checkpoint_path()).unwrap();
        assert_eq!(on_disk.done.len(), 1);
        assert!(on_disk.done.contains("1.jpg"));
        for id in ["2.txt", "3.txt", "4.txt"] {
            assert!(!fx.layout.output_dir.join(id).exists());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_run_still_reports_earlier_failures() {
        let fx = Fixture::new(&["1.jpg", "2.jpg", "3.jpg"]);
        let backend = Arc::new(
            ScriptedBackend::new(vec![Err(CallError::Rejected("HTTP 400".into()))])
                .with_fallback(Err(CallError::RateLimited("HTTP 429".into()))),
        );
        let p = fx.processor(backend.clone(), &["k"], 2, 1);

        let err = p
            .run(fx.layout.collect_items(), RunMode::Normal { retry_failed: true })
            .await
            .unwrap_err();

        let aborted = err.downcast_ref::<RunAborted>().unwrap();
        assert!(aborted.cause.is_fatal());
        assert!(aborted.summary.stopped);
        assert_eq!(aborted.summary.failed, 1);
        assert_eq!(aborted.summary.failures[0].0, "1.jpg");
        assert!(aborted.summary.failures[0].1.contains("HTTP 400"));
        assert_eq!(p.checkpoint().failed_ids(), vec!["1.jpg"]);
        assert!(format!("{err:#}").contains("rate limited"));
    }

    // ── StopSignal ───────────────────────────────────────────────────

    #[tokio::test]
    async fn stop_signal_wakes_waiters() {
        let stop = StopSignal::new();
        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.stopped().await })
        };
        assert!(!stop.is_stopped());
        assert!(!stop.stop());
        waiter.await.unwrap();
        assert!(stop.is_stopped());
    }

    #[test]
    fn repeated_stop_requests_are_reported() {
        let stop = StopSignal::new();
        let handle = stop.clone();
        assert!(!stop.stop());
        assert!(handle.stop());
        assert!(stop.stop());
    }
}
