use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::compress::{self, Encoding, ITEM_QUALITY};
use crate::envelope::{Backup, BackupSource, FORMAT_VERSION, SourceMode};
use crate::exclude::ExcludeMatcher;
use crate::git;
use crate::item::{self, Change, Item, MODE_SUBMODULE, MODE_SYMLINK, Payload};
use crate::progress::{ItemProgress, ProgressSink};
use crate::{Error, Result};

pub const DEFAULT_BIG_FILE_BYTES: u64 = 5 * 1024 * 1024;
pub const DEFAULT_TOTAL_BYTES_THRESHOLD: u64 = 50 * 1024 * 1024;
pub const DEFAULT_ITEM_COUNT_THRESHOLD: u64 = 100;

const MIN_WORKERS: usize = 2;
const MAX_WORKERS: usize = 4;

/// Concurrency thresholds for the compression pool. A threshold of 0
/// forces the pool on from the first item.
#[derive(Debug, Clone)]
pub struct Tuning {
    pub threads: usize,
    pub big_file_bytes: u64,
    pub total_bytes_threshold: u64,
    pub item_count_threshold: u64,
}

impl Default for Tuning {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(MIN_WORKERS)
            .clamp(MIN_WORKERS, MAX_WORKERS);
        Self {
            threads,
            big_file_bytes: DEFAULT_BIG_FILE_BYTES,
            total_bytes_threshold: DEFAULT_TOTAL_BYTES_THRESHOLD,
            item_count_threshold: DEFAULT_ITEM_COUNT_THRESHOLD,
        }
    }
}

impl Tuning {
    pub fn validate(&self) -> Result<()> {
        if self.threads < 1 {
            return Err(Error::InvalidConfig {
                message: "tuning.threads must be >= 1".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CollectConfig {
    pub mode: SourceMode,
    pub root: PathBuf,
    pub excludes: Vec<String>,
    pub tuning: Tuning,
    /// The artifact destination; skipped during filesystem walks when it
    /// lives under the root.
    pub output_path: Option<PathBuf>,
}

impl CollectConfig {
    pub fn validate(&self) -> Result<()> {
        self.tuning.validate()?;
        if !self.root.is_dir() {
            return Err(Error::InvalidConfig {
                message: format!(
                    "source root must be an existing directory: {}",
                    self.root.display()
                ),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct CollectOptions<'a> {
    pub progress: Option<&'a dyn ProgressSink>,
}

pub async fn build_backup(config: CollectConfig) -> Result<Backup> {
    build_backup_with(config, CollectOptions::default()).await
}

pub async fn build_backup_with(
    config: CollectConfig,
    options: CollectOptions<'_>,
) -> Result<Backup> {
    config.validate()?;
    let started = Instant::now();
    debug!(
        event = "phase.start",
        phase = "collect",
        mode = config.mode.as_str(),
        root = %config.root.display(),
        "phase.start"
    );

    let excludes = ExcludeMatcher::new(&config.excludes);
    let head = match config.mode {
        SourceMode::Index => git::head_revision(&config.root),
        SourceMode::Fs => None,
    };

    let mut collector = Collector::new(config.tuning.clone(), options.progress);
    match config.mode {
        SourceMode::Index => collect_index(&config, &excludes, &mut collector)?,
        SourceMode::Fs => collect_fs(&config, &excludes, &mut collector)?,
    }
    let items = collector.finish().await?;

    let root = path_to_utf8(&std::path::absolute(&config.root)?)?;
    let backup = Backup {
        format_version: FORMAT_VERSION,
        created_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        source_root: root.clone(),
        head,
        payload_encoding: Encoding::Brotli,
        source: BackupSource {
            mode: config.mode,
            root,
            excludes: config.excludes.clone(),
        },
        items,
        encrypted: false,
    };

    debug!(
        event = "phase.finish",
        phase = "collect",
        duration_ms = started.elapsed().as_millis() as u64,
        items = backup.items.len() as u64,
        "phase.finish"
    );
    Ok(backup)
}

fn collect_index(
    config: &CollectConfig,
    excludes: &ExcludeMatcher,
    collector: &mut Collector<'_>,
) -> Result<()> {
    for entry in git::staged_diff(&config.root)? {
        if excludes.is_excluded(&entry.path) {
            continue;
        }
        let change = match entry.status {
            'D' => Change::Delete,
            'A' | 'M' | 'T' => Change::Upsert {
                payload: fetch_staged_payload(&config.root, &entry.path)?,
            },
            'R' => Change::Rename {
                old_path: entry.old_path.clone().ok_or_else(|| Error::SourceAccess {
                    message: format!("rename entry {} has no old path", entry.path),
                })?,
                payload: fetch_staged_payload(&config.root, &entry.path)?,
            },
            'C' => Change::Copy {
                old_path: entry.old_path.clone().ok_or_else(|| Error::SourceAccess {
                    message: format!("copy entry {} has no old path", entry.path),
                })?,
                payload: fetch_staged_payload(&config.root, &entry.path)?,
            },
            other => {
                warn!(
                    event = "collect.skip_status",
                    status = %other,
                    path = %entry.path,
                    "collect.skip_status"
                );
                continue;
            }
        };
        collector.push(Item {
            path: entry.path,
            change,
        })?;
    }
    Ok(())
}

fn fetch_staged_payload(root: &Path, path: &str) -> Result<Payload> {
    let mode = git::staged_mode(root, path)?;
    match mode.as_str() {
        MODE_SUBMODULE => Ok(Payload::Submodule),
        MODE_SYMLINK => {
            let bytes = git::staged_content(root, path)?;
            let target = String::from_utf8(bytes).map_err(|_| Error::SourceAccess {
                message: format!("symlink target for {path} is not UTF-8"),
            })?;
            Ok(Payload::Symlink { target })
        }
        _ => {
            let content = git::staged_content(root, path)?;
            Ok(Payload::File {
                mode,
                content,
                encoding: Encoding::None,
            })
        }
    }
}

fn collect_fs(
    config: &CollectConfig,
    excludes: &ExcludeMatcher,
    collector: &mut Collector<'_>,
) -> Result<()> {
    let skip_output = config
        .output_path
        .as_ref()
        .and_then(|path| std::path::absolute(path).ok());

    let walker = WalkDir::new(&config.root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || entry.file_name() != ".git");

    for entry in walker {
        let entry = entry.map_err(|e| Error::SourceAccess {
            message: format!("walkdir error: {e}"),
        })?;
        let path = entry.path();
        if path == config.root {
            continue;
        }
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }

        let rel = path
            .strip_prefix(&config.root)
            .map_err(|_| Error::SourceAccess {
                message: format!("path strip_prefix failed for {}", path.display()),
            })?;
        let rel_str = rel_path_string(rel)?;
        if excludes.is_excluded(&rel_str) {
            continue;
        }
        if let Some(out) = &skip_output
            && std::path::absolute(path).is_ok_and(|abs| &abs == out)
        {
            continue;
        }

        let payload = if file_type.is_symlink() {
            let target = std::fs::read_link(path).map_err(|e| Error::SourceAccess {
                message: format!("read_link {rel_str} failed: {e}"),
            })?;
            let target = target
                .to_str()
                .ok_or_else(|| Error::NonUtf8Path {
                    path: target.clone(),
                })?
                .to_string();
            Payload::Symlink { target }
        } else if file_type.is_file() {
            let metadata = entry.metadata().map_err(|e| Error::SourceAccess {
                message: format!("stat {rel_str} failed: {e}"),
            })?;
            let content = std::fs::read(path).map_err(|e| Error::SourceAccess {
                message: format!("read {rel_str} failed: {e}"),
            })?;
            Payload::File {
                mode: file_mode(&metadata),
                content,
                encoding: Encoding::None,
            }
        } else {
            continue;
        };

        collector.push(Item {
            path: rel_str,
            change: Change::Upsert { payload },
        })?;
    }
    Ok(())
}

fn rel_path_string(rel: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| {
                Error::NonUtf8Path {
                    path: rel.to_path_buf(),
                }
            })?),
            _ => {
                return Err(Error::SourceAccess {
                    message: format!("unexpected path component in {}", rel.display()),
                });
            }
        }
    }
    Ok(parts.join("/"))
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;
    if metadata.permissions().mode() & 0o111 != 0 {
        "100755".to_string()
    } else {
        "100644".to_string()
    }
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> String {
    "100644".to_string()
}

fn path_to_utf8(path: &Path) -> Result<String> {
    path.to_str()
        .map(|s| s.to_string())
        .ok_or_else(|| Error::NonUtf8Path {
            path: path.to_path_buf(),
        })
}

struct ItemMeta {
    path: String,
    raw_bytes: u64,
}

enum Slot {
    Ready { blob: Vec<u8>, duration_ms: u64 },
    Pending(JoinHandle<Result<(Vec<u8>, u64)>>),
}

/// Accumulates items in enumeration order. Compression of qualifying
/// payloads is offloaded to a bounded blocking pool; results are
/// reattached by slot index, so the final sequence is independent of
/// worker completion order.
struct Collector<'a> {
    tuning: Tuning,
    progress: Option<&'a dyn ProgressSink>,
    pool: Option<Arc<Semaphore>>,
    seen_items: u64,
    seen_bytes: u64,
    slots: Vec<(Slot, ItemMeta)>,
}

impl<'a> Collector<'a> {
    fn new(tuning: Tuning, progress: Option<&'a dyn ProgressSink>) -> Self {
        Self {
            tuning,
            progress,
            pool: None,
            seen_items: 0,
            seen_bytes: 0,
            slots: Vec::new(),
        }
    }

    fn push(&mut self, item: Item) -> Result<()> {
        let raw_bytes = match item.change.payload() {
            Some(Payload::File { content, .. }) => content.len() as u64,
            _ => 0,
        };
        self.seen_items += 1;
        self.seen_bytes = self.seen_bytes.saturating_add(raw_bytes);

        if let Some(sink) = self.progress {
            sink.on_item(ItemProgress {
                phase: "start".to_string(),
                path: item.path.clone(),
                raw_bytes: Some(raw_bytes),
                stored_bytes: None,
                duration_ms: None,
            });
        }

        // Lazy pool creation; once any threshold trips, activation is
        // sticky for the rest of the run.
        if self.pool.is_none()
            && (raw_bytes >= self.tuning.big_file_bytes
                || self.seen_bytes >= self.tuning.total_bytes_threshold
                || self.seen_items >= self.tuning.item_count_threshold)
        {
            debug!(
                event = "pool.start",
                workers = self.tuning.threads as u64,
                "pool.start"
            );
            self.pool = Some(Arc::new(Semaphore::new(self.tuning.threads)));
        }

        let compressible = matches!(
            item.change.payload(),
            Some(Payload::File { content, .. }) if !content.is_empty()
        );
        let meta = ItemMeta {
            path: item.path.clone(),
            raw_bytes,
        };
        let started = Instant::now();

        let slot = match (&self.pool, compressible) {
            (Some(pool), true) => {
                let permits = Arc::clone(pool);
                Slot::Pending(tokio::spawn(async move {
                    let _permit =
                        permits
                            .acquire_owned()
                            .await
                            .map_err(|_| Error::SourceAccess {
                                message: "compression pool closed".to_string(),
                            })?;
                    tokio::task::spawn_blocking(move || {
                        let blob = finalize_item_blob(item)?;
                        Ok((blob, started.elapsed().as_millis() as u64))
                    })
                    .await
                    .map_err(|e| Error::SourceAccess {
                        message: format!("compression worker failed: {e}"),
                    })?
                }))
            }
            _ => {
                let blob = finalize_item_blob(item)?;
                Slot::Ready {
                    blob,
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            }
        };

        self.slots.push((slot, meta));
        Ok(())
    }

    /// Await every outstanding worker in slot order and tear the pool
    /// down. Teardown is unconditional whether or not the pool ever
    /// activated.
    async fn finish(mut self) -> Result<Vec<Vec<u8>>> {
        let mut blobs = Vec::with_capacity(self.slots.len());
        for (slot, meta) in self.slots.drain(..) {
            let (blob, duration_ms) = match slot {
                Slot::Ready { blob, duration_ms } => (blob, duration_ms),
                Slot::Pending(handle) => handle.await.map_err(|e| Error::SourceAccess {
                    message: format!("compression worker failed: {e}"),
                })??,
            };
            if let Some(sink) = self.progress {
                sink.on_item(ItemProgress {
                    phase: "done".to_string(),
                    path: meta.path,
                    raw_bytes: Some(meta.raw_bytes),
                    stored_bytes: Some(blob.len() as u64),
                    duration_ms: Some(duration_ms),
                });
            }
            blobs.push(blob);
        }
        self.pool.take();
        Ok(blobs)
    }
}

fn finalize_item_blob(mut item: Item) -> Result<Vec<u8>> {
    if let Some(Payload::File {
        content, encoding, ..
    }) = item.change.payload_mut()
        && *encoding == Encoding::None
        && !content.is_empty()
    {
        let compressed = compress::compress(content, Encoding::Brotli, ITEM_QUALITY)?;
        // Keep raw bytes when compression does not pay for itself.
        if compressed.len() < content.len() {
            *content = compressed;
            *encoding = Encoding::Brotli;
        }
    }
    item::encode_item(&item, Encoding::Brotli)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forced_tuning(pool_on: bool) -> Tuning {
        if pool_on {
            Tuning {
                threads: 2,
                big_file_bytes: 0,
                total_bytes_threshold: 0,
                item_count_threshold: 0,
            }
        } else {
            Tuning {
                threads: 2,
                big_file_bytes: u64::MAX,
                total_bytes_threshold: u64::MAX,
                item_count_threshold: u64::MAX,
            }
        }
    }

    fn sample_tree(root: &Path) {
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("README.md"), b"# demo\n").unwrap();
        std::fs::write(root.join("src/main.rs"), b"fn main() {}\n".repeat(100)).unwrap();
        std::fs::write(root.join("src/notes.log"), b"noise\n").unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join(".git/HEAD"), b"ref: refs/heads/main\n").unwrap();
    }

    fn fs_config(root: &Path, tuning: Tuning) -> CollectConfig {
        CollectConfig {
            mode: SourceMode::Fs,
            root: root.to_path_buf(),
            excludes: vec![],
            tuning,
            output_path: None,
        }
    }

    #[tokio::test]
    async fn pooled_and_inline_runs_collect_identical_items() {
        let dir = tempfile::tempdir().unwrap();
        sample_tree(dir.path());

        let pooled = build_backup(fs_config(dir.path(), forced_tuning(true)))
            .await
            .unwrap();
        let inline = build_backup(fs_config(dir.path(), forced_tuning(false)))
            .await
            .unwrap();

        let pooled_items = pooled.decode_items().unwrap();
        let inline_items = inline.decode_items().unwrap();
        assert!(!pooled_items.is_empty());
        assert_eq!(pooled_items, inline_items);
    }

    #[tokio::test]
    async fn git_dir_is_never_collected() {
        let dir = tempfile::tempdir().unwrap();
        sample_tree(dir.path());

        let backup = build_backup(fs_config(dir.path(), Tuning::default()))
            .await
            .unwrap();
        let paths: Vec<String> = backup
            .decode_items()
            .unwrap()
            .into_iter()
            .map(|i| i.path)
            .collect();
        assert!(paths.iter().all(|p| !p.starts_with(".git")));
        assert!(paths.contains(&"README.md".to_string()));
    }

    #[tokio::test]
    async fn excluded_paths_never_become_items() {
        let dir = tempfile::tempdir().unwrap();
        sample_tree(dir.path());

        let mut config = fs_config(dir.path(), Tuning::default());
        config.excludes = vec!["*.log".to_string()];
        let backup = build_backup(config).await.unwrap();

        let paths: Vec<String> = backup
            .decode_items()
            .unwrap()
            .into_iter()
            .map(|i| i.path)
            .collect();
        assert!(!paths.contains(&"src/notes.log".to_string()));
        assert!(paths.contains(&"src/main.rs".to_string()));
    }

    #[tokio::test]
    async fn output_artifact_under_the_root_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        sample_tree(dir.path());
        let out = dir.path().join("snapshot.ssp");
        std::fs::write(&out, b"placeholder").unwrap();

        let mut config = fs_config(dir.path(), Tuning::default());
        config.output_path = Some(out);
        let backup = build_backup(config).await.unwrap();

        let paths: Vec<String> = backup
            .decode_items()
            .unwrap()
            .into_iter()
            .map(|i| i.path)
            .collect();
        assert!(!paths.contains(&"snapshot.ssp".to_string()));
    }

    #[tokio::test]
    async fn sink_sees_one_start_and_one_done_per_item() {
        #[derive(Default)]
        struct RecordingSink(std::sync::Mutex<Vec<ItemProgress>>);
        impl ProgressSink for RecordingSink {
            fn on_item(&self, progress: ItemProgress) {
                self.0.lock().unwrap().push(progress);
            }
        }

        let dir = tempfile::tempdir().unwrap();
        sample_tree(dir.path());

        let sink = RecordingSink::default();
        let backup = build_backup_with(
            fs_config(dir.path(), forced_tuning(true)),
            CollectOptions {
                progress: Some(&sink),
            },
        )
        .await
        .unwrap();

        let events = sink.0.into_inner().unwrap();
        let starts = events.iter().filter(|e| e.phase == "start").count();
        let dones = events.iter().filter(|e| e.phase == "done").count();
        assert_eq!(starts, backup.items.len());
        assert_eq!(dones, backup.items.len());
        assert!(
            events
                .iter()
                .filter(|e| e.phase == "done")
                .all(|e| e.stored_bytes.is_some() && e.duration_ms.is_some())
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_are_collected_with_their_target_text() {
        let dir = tempfile::tempdir().unwrap();
        sample_tree(dir.path());
        std::os::unix::fs::symlink("README.md", dir.path().join("link")).unwrap();

        let backup = build_backup(fs_config(dir.path(), Tuning::default()))
            .await
            .unwrap();
        let items = backup.decode_items().unwrap();
        let link = items.iter().find(|i| i.path == "link").expect("link item");
        match &link.change {
            Change::Upsert {
                payload: Payload::Symlink { target },
            } => assert_eq!(target, "README.md"),
            other => panic!("unexpected change: {other:?}"),
        }
    }
}
