use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::pipeline::WorkItem;

/// Split `items` into `workers` contiguous chunks whose sizes differ by at most one.
///
/// Earlier chunks take the remainder. Chunks may be empty when there are
/// fewer items than workers.
pub fn split_work<T: Clone>(items: &[T], workers: usize) -> Vec<Vec<T>> {
    let workers = workers.max(1);
    let base = items.len() / workers;
    let remainder = items.len() % workers;

    let mut chunks = Vec::with_capacity(workers);
    let mut start = 0;
    for i in 0..workers {
        let size = base + usize::from(i < remainder);
        chunks.push(items[start..start + size].to_vec());
        start += size;
    }
    chunks
}

/// Write one `worker_{n}_images.txt` assignment file per worker into `dir`.
///
/// Each file starts with `#` header lines followed by one item id per line,
/// the format read back by [`Layout::items_from_worker_file`](crate::pipeline::Layout::items_from_worker_file).
/// Returns the paths written, in worker order.
pub fn write_worker_files(items: &[WorkItem], workers: usize, dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
    let mut written = Vec::new();
    for (i, chunk) in split_work(&ids, workers).iter().enumerate() {
        let path = dir.join(format!("worker_{}_images.txt", i + 1));
        let mut contents = String::new();
        let _ = writeln!(contents, "# Worker {} - {} images", i + 1, chunk.len());
        let _ = writeln!(contents, "# Paths are relative to the input directory");
        contents.push('\n');
        for id in chunk {
            contents.push_str(id);
            contents.push('\n');
        }
        std::fs::write(&path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        log::info!("Worker {}: {} images -> {}", i + 1, chunk.len(), path.display());
        written.push(path);
    }
    Ok(written)
}
