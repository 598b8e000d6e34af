use std::path::Path;
use std::process::Command;

use crate::{Error, Result};

/// The well-known hash of git's empty tree, used as the diff base on an
/// unborn branch.
pub const EMPTY_TREE_HASH: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// All git access is a synchronous subprocess per call; git does not allow
/// concurrent index access within one pipeline run, so callers never
/// parallelize these.
fn run_git(root: &Path, args: &[&str]) -> Result<Vec<u8>> {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(args)
        .output()
        .map_err(|e| Error::SourceAccess {
            message: format!("failed to spawn git: {e}"),
        })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::SourceAccess {
            message: format!(
                "git {} failed: {}",
                args.first().unwrap_or(&"?"),
                stderr.trim()
            ),
        });
    }
    Ok(output.stdout)
}

pub fn head_revision(root: &Path) -> Option<String> {
    run_git(root, &["rev-parse", "--verify", "HEAD"])
        .ok()
        .map(|out| String::from_utf8_lossy(&out).trim().to_string())
        .filter(|rev| !rev.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub status: char,
    pub path: String,
    pub old_path: Option<String>,
}

/// Name-status diff of the index against HEAD (or the empty tree on an
/// unborn branch), with rename and copy detection.
pub fn staged_diff(root: &Path) -> Result<Vec<StatusEntry>> {
    let base = head_revision(root);
    let base_ref = base.as_deref().unwrap_or(EMPTY_TREE_HASH);
    let out = run_git(
        root,
        &[
            "diff",
            "--cached",
            "--name-status",
            "--find-renames",
            "--find-copies",
            base_ref,
        ],
    )?;
    parse_name_status(&String::from_utf8_lossy(&out))
}

fn parse_name_status(text: &str) -> Result<Vec<StatusEntry>> {
    let mut entries = Vec::new();
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        let mut cols = line.split('\t');
        // The status column may carry a similarity score, e.g. "R100".
        let status = cols
            .next()
            .and_then(|col| col.chars().next())
            .ok_or_else(|| Error::SourceAccess {
                message: format!("unparseable diff line: {line:?}"),
            })?;
        match status {
            'R' | 'C' => match (cols.next(), cols.next()) {
                (Some(old), Some(new)) => entries.push(StatusEntry {
                    status,
                    path: new.to_string(),
                    old_path: Some(old.to_string()),
                }),
                _ => {
                    return Err(Error::SourceAccess {
                        message: format!("rename/copy diff line missing paths: {line:?}"),
                    });
                }
            },
            _ => {
                let path = cols.next().ok_or_else(|| Error::SourceAccess {
                    message: format!("diff line missing path: {line:?}"),
                })?;
                entries.push(StatusEntry {
                    status,
                    path: path.to_string(),
                    old_path: None,
                });
            }
        }
    }
    Ok(entries)
}

/// Tracked mode bits of a staged path, e.g. "100644", "120000", "160000".
pub fn staged_mode(root: &Path, path: &str) -> Result<String> {
    let out = run_git(root, &["ls-files", "--stage", "--", path])?;
    let text = String::from_utf8_lossy(&out);
    let line = text.lines().next().ok_or_else(|| Error::SourceAccess {
        message: format!("no staged entry for {path}"),
    })?;
    let mode = line.split_whitespace().next().ok_or_else(|| Error::SourceAccess {
        message: format!("unparseable ls-files line: {line:?}"),
    })?;
    Ok(mode.to_string())
}

/// Raw staged blob bytes (stage 0) for a path.
pub fn staged_content(root: &Path, path: &str) -> Result<Vec<u8>> {
    run_git(root, &["show", &format!(":0:{path}")])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_statuses() {
        let entries = parse_name_status("A\tadded.txt\nM\tchanged.txt\nD\tremoved.txt\n").unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].status, 'A');
        assert_eq!(entries[0].path, "added.txt");
        assert_eq!(entries[2].status, 'D');
        assert!(entries[2].old_path.is_none());
    }

    #[test]
    fn parses_scored_renames_and_copies() {
        let entries = parse_name_status("R100\told.txt\tnew.txt\nC75\tsrc.txt\tcopy.txt\n").unwrap();
        assert_eq!(entries[0].status, 'R');
        assert_eq!(entries[0].path, "new.txt");
        assert_eq!(entries[0].old_path.as_deref(), Some("old.txt"));
        assert_eq!(entries[1].status, 'C');
        assert_eq!(entries[1].old_path.as_deref(), Some("src.txt"));
    }

    #[test]
    fn rename_missing_a_path_is_an_error() {
        let err = parse_name_status("R100\tonly-one.txt\n").unwrap_err();
        assert!(matches!(err, Error::SourceAccess { .. }));
    }

    #[test]
    fn blank_lines_are_skipped() {
        let entries = parse_name_status("\nA\ta.txt\n\n").unwrap();
        assert_eq!(entries.len(), 1);
    }
}
