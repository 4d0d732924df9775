use anyhow::{Context, Result};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::checkpoint::write_atomic;

/// Supported image extensions.
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif", "bmp"];

/// Extension of caption files written to the output directory.
pub const CAPTION_EXTENSION: &str = "txt";

/// One image awaiting a caption.
///
/// `id` is the image path relative to the input root with `/` separators; it
/// is the key stored in the checkpoint. The output path mirrors that layout
/// under the output root with a `.txt` extension.
///
/// # Example
///
/// ```rust
/// use batch_caption::pipeline::WorkItem;
/// use std::path::Path;
///
/// let item = WorkItem::new(Path::new("/in"), Path::new("/out"), Path::new("K01/V002/0001.jpg"));
/// assert_eq!(item.id, "K01/V002/0001.jpg");
/// assert_eq!(item.output_path, Path::new("/out/K01/V002/0001.txt"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
}

impl WorkItem {
    pub fn new(input_root: &Path, output_root: &Path, relative: &Path) -> Self {
        Self {
            id: relative_id(relative),
            input_path: input_root.join(relative),
            output_path: output_root
                .join(relative)
                .with_extension(CAPTION_EXTENSION),
        }
    }

    /// MIME type sent to the captioning service.
    pub fn mime_type(&self) -> &'static str {
        mime_type(&self.input_path)
    }
}

/// Input and output roots shared by all items of a run.
#[derive(Debug, Clone)]
pub struct Layout {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Layout {
    pub fn new(input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    /// Build the item for an identifier (a path relative to the input root).
    pub fn item(&self, id: &str) -> WorkItem {
        WorkItem::new(&self.input_dir, &self.output_dir, Path::new(id))
    }

    /// Walk the input root recursively and return every supported image, sorted by id.
    pub fn collect_items(&self) -> Vec<WorkItem> {
        if !self.input_dir.is_dir() {
            log::warn!("Input directory does not exist: {}", self.input_dir.display());
            return Vec::new();
        }

        let mut items: Vec<WorkItem> = WalkDir::new(&self.input_dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && is_supported_image(e.path()))
            .filter_map(|e| {
                let relative = e.path().strip_prefix(&self.input_dir).ok()?;
                Some(WorkItem::new(&self.input_dir, &self.output_dir, relative))
            })
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }

    /// Read an explicit item list, one path per line.
    ///
    /// Blank lines and `#` comments are skipped. Paths may be relative to the
    /// input root or absolute paths inside it; anything else is skipped with a
    /// warning, as are unsupported extensions and duplicates.
    pub fn items_from_worker_file(&self, worker_file: &Path) -> Result<Vec<WorkItem>> {
        let contents = std::fs::read_to_string(worker_file)
            .with_context(|| format!("Failed to read worker file {}", worker_file.display()))?;

        let mut seen = std::collections::HashSet::new();
        let mut items = Vec::new();
        for line in contents.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let path = Path::new(line);
            let relative = if path.is_absolute() {
                match path.strip_prefix(&self.input_dir) {
                    Ok(rel) => rel,
                    Err(_) => {
                        log::warn!("Skipping path outside input directory: {line}");
                        continue;
                    }
                }
            } else {
                path
            };
            if !is_safe_relative(relative) {
                log::warn!("Skipping unsafe path: {line}");
                continue;
            }
            if !is_supported_image(relative) {
                log::warn!("Skipping unsupported file: {line}");
                continue;
            }
            let item = WorkItem::new(&self.input_dir, &self.output_dir, relative);
            if seen.insert(item.id.clone()) {
                items.push(item);
            }
        }
        Ok(items)
    }
}

/// Write a caption atomically, creating parent directories.
///
/// The caption appears at its final path complete or not at all.
pub fn write_caption(output_path: &Path, caption: &str) -> Result<()> {
    write_atomic(output_path, caption.as_bytes())
        .with_context(|| format!("Failed to write caption {}", output_path.display()))
}

/// Check if a file has a supported image extension.
fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Relative path with no `..`, root or prefix components.
fn is_safe_relative(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn relative_id(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// MIME type for an image path, defaulting to JPEG.
pub fn mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        _ => "image/jpeg",
    }
}
