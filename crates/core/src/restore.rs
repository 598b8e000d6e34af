use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::compress;
use crate::envelope::{Backup, FORMAT_VERSION, LEGACY_FORMAT_VERSION};
use crate::item::{self, Change, Item, Payload};
use crate::progress::{ItemProgress, ProgressSink};
use crate::{Error, Result};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RestoreResult {
    pub restored: u64,
    pub removed: u64,
    pub skipped: u64,
}

#[derive(Default)]
pub struct RestoreOptions<'a> {
    pub progress: Option<&'a dyn ProgressSink>,
}

pub fn restore_backup(backup: &Backup, target_root: &Path) -> Result<RestoreResult> {
    restore_backup_with(backup, target_root, RestoreOptions::default())
}

/// Single-threaded ordered replay. Item order matters: a rename's old-path
/// cleanup must land before anything later touches the new path, so blobs
/// are consumed strictly left to right.
pub fn restore_backup_with(
    backup: &Backup,
    target_root: &Path,
    options: RestoreOptions<'_>,
) -> Result<RestoreResult> {
    if backup.format_version != FORMAT_VERSION && backup.format_version != LEGACY_FORMAT_VERSION {
        return Err(Error::Format {
            message: format!(
                "unsupported backup format version: {}",
                backup.format_version
            ),
        });
    }

    let started = Instant::now();
    debug!(
        event = "phase.start",
        phase = "restore",
        target = %target_root.display(),
        items = backup.items.len() as u64,
        "phase.start"
    );

    fs::create_dir_all(target_root)?;
    let mut result = RestoreResult::default();

    for blob in &backup.items {
        let item = item::decode_item(blob, backup.payload_encoding)?;
        if let Some(sink) = options.progress {
            sink.on_item(ItemProgress {
                phase: "start".to_string(),
                path: item.path.clone(),
                raw_bytes: None,
                stored_bytes: None,
                duration_ms: None,
            });
        }
        let item_started = Instant::now();
        apply_item(&item, target_root, &mut result)?;
        if let Some(sink) = options.progress {
            sink.on_item(ItemProgress {
                phase: "done".to_string(),
                path: item.path.clone(),
                raw_bytes: None,
                stored_bytes: None,
                duration_ms: Some(item_started.elapsed().as_millis() as u64),
            });
        }
    }

    debug!(
        event = "phase.finish",
        phase = "restore",
        duration_ms = started.elapsed().as_millis() as u64,
        restored = result.restored,
        removed = result.removed,
        skipped = result.skipped,
        target = %target_root.display(),
        "phase.finish"
    );
    Ok(result)
}

fn apply_item(item: &Item, root: &Path, result: &mut RestoreResult) -> Result<()> {
    let target = safe_join(root, &item.path)?;
    match &item.change {
        Change::Delete => {
            // Idempotent: absence still counts as removed.
            remove_entry(&target)?;
            result.removed += 1;
        }
        Change::Upsert { payload } => {
            write_payload(&item.path, payload, &target, result)?;
        }
        Change::Rename { old_path, payload } | Change::Copy { old_path, payload } => {
            let old_target = safe_join(root, old_path)?;
            if remove_entry(&old_target)? {
                result.removed += 1;
            }
            write_payload(&item.path, payload, &target, result)?;
        }
    }
    Ok(())
}

fn write_payload(
    rel_path: &str,
    payload: &Payload,
    target: &Path,
    result: &mut RestoreResult,
) -> Result<()> {
    match payload {
        Payload::Submodule => {
            warn!(
                event = "restore.skip_submodule",
                path = %rel_path,
                "restore.skip_submodule"
            );
            result.skipped += 1;
        }
        Payload::Symlink {
            target: link_target,
        } => {
            remove_entry(target)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            make_symlink(link_target, target)?;
            result.restored += 1;
        }
        Payload::File {
            mode,
            content,
            encoding,
        } => {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let bytes = compress::decompress(content, *encoding)?;
            fs::write(target, bytes)?;
            apply_mode(target, mode, rel_path);
            result.restored += 1;
        }
    }
    Ok(())
}

/// Hard safety boundary: absolute paths and any path whose normalized
/// form escapes the restore root are rejected, never rewritten. Applies
/// to every item kind, Delete included.
fn safe_join(root: &Path, rel: &str) -> Result<PathBuf> {
    if rel.is_empty() {
        return Err(Error::PathSafety {
            message: "item path is empty".to_string(),
        });
    }
    if rel.starts_with('/') || rel.starts_with('\\') || Path::new(rel).is_absolute() {
        return Err(Error::PathSafety {
            message: format!("item path is absolute: {rel}"),
        });
    }

    let mut depth: usize = 0;
    let mut out = root.to_path_buf();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => {
                depth += 1;
                out.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(Error::PathSafety {
                        message: format!("item path escapes the restore root: {rel}"),
                    });
                }
                depth -= 1;
                out.pop();
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathSafety {
                    message: format!("item path is absolute: {rel}"),
                });
            }
        }
    }
    if depth == 0 {
        return Err(Error::PathSafety {
            message: format!("item path resolves to the restore root: {rel}"),
        });
    }
    Ok(out)
}

fn remove_entry(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.is_dir() {
                fs::remove_dir_all(path)?;
            } else {
                fs::remove_file(path)?;
            }
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn apply_mode(path: &Path, mode: &str, rel_path: &str) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match u32::from_str_radix(mode, 8) {
            Ok(bits) => {
                let permissions = fs::Permissions::from_mode(bits & 0o7777);
                if let Err(e) = fs::set_permissions(path, permissions) {
                    warn!(
                        event = "restore.chmod_failed",
                        path = %rel_path,
                        error = %e,
                        "restore.chmod_failed"
                    );
                }
            }
            Err(_) => {
                warn!(
                    event = "restore.bad_mode",
                    path = %rel_path,
                    mode = %mode,
                    "restore.bad_mode"
                );
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode, rel_path);
    }
}

#[cfg(unix)]
fn make_symlink(link_target: &str, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link_target, link)?;
    Ok(())
}

#[cfg(windows)]
fn make_symlink(link_target: &str, link: &Path) -> Result<()> {
    std::os::windows::fs::symlink_file(link_target, link)?;
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn make_symlink(link_target: &str, link: &Path) -> Result<()> {
    let _ = (link_target, link);
    Err(Error::SourceAccess {
        message: "symlinks are not supported on this platform".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_join_accepts_nested_relative_paths() {
        let root = Path::new("/restore/root");
        let joined = safe_join(root, "a/b/c.txt").unwrap();
        assert_eq!(joined, root.join("a/b/c.txt"));
    }

    #[test]
    fn safe_join_rejects_absolute_paths() {
        let err = safe_join(Path::new("/restore"), "/etc/passwd").unwrap_err();
        assert!(matches!(err, Error::PathSafety { .. }));
    }

    #[test]
    fn safe_join_rejects_escapes() {
        let root = Path::new("/restore");
        for rel in ["../../etc/passwd", "a/../../etc/passwd", "..", "a/.."] {
            let err = safe_join(root, rel).unwrap_err();
            assert!(matches!(err, Error::PathSafety { .. }), "path {rel}");
        }
    }

    #[test]
    fn safe_join_normalizes_internal_dotdot() {
        let root = Path::new("/restore");
        let joined = safe_join(root, "a/b/../c.txt").unwrap();
        assert_eq!(joined, root.join("a/c.txt"));
    }

    #[test]
    fn delete_is_idempotent_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let mut result = RestoreResult::default();
        let item = Item::delete("missing.txt");
        apply_item(&item, dir.path(), &mut result).unwrap();
        assert_eq!(result.removed, 1);
        assert_eq!(result.restored, 0);
    }

    #[test]
    fn submodule_items_are_skipped_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut result = RestoreResult::default();
        let item = Item {
            path: "vendor/lib".to_string(),
            change: Change::Upsert {
                payload: Payload::Submodule,
            },
        };
        apply_item(&item, dir.path(), &mut result).unwrap();
        assert_eq!(result.skipped, 1);
        assert!(!dir.path().join("vendor").exists());
    }

    #[test]
    fn rename_removes_the_old_path_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.txt"), b"stale").unwrap();

        let mut result = RestoreResult::default();
        let item = Item {
            path: "new.txt".to_string(),
            change: Change::Rename {
                old_path: "old.txt".to_string(),
                payload: Payload::File {
                    mode: "100644".to_string(),
                    content: b"fresh".to_vec(),
                    encoding: crate::compress::Encoding::None,
                },
            },
        };
        apply_item(&item, dir.path(), &mut result).unwrap();

        assert!(!dir.path().join("old.txt").exists());
        assert_eq!(std::fs::read(dir.path().join("new.txt")).unwrap(), b"fresh");
        assert_eq!(result.removed, 1);
        assert_eq!(result.restored, 1);
    }

    #[cfg(unix)]
    #[test]
    fn executable_mode_bits_are_restored() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let mut result = RestoreResult::default();
        let item = Item::upsert_file("run.sh", "100755", b"#!/bin/sh\n".to_vec());
        apply_item(&item, dir.path(), &mut result).unwrap();

        let mode = std::fs::metadata(dir.path().join("run.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_replaces_an_existing_entry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("link"), b"plain file").unwrap();

        let mut result = RestoreResult::default();
        let item = Item {
            path: "link".to_string(),
            change: Change::Upsert {
                payload: Payload::Symlink {
                    target: "target.txt".to_string(),
                },
            },
        };
        apply_item(&item, dir.path(), &mut result).unwrap();

        let read = std::fs::read_link(dir.path().join("link")).unwrap();
        assert_eq!(read, Path::new("target.txt"));
        assert_eq!(result.restored, 1);
    }
}
