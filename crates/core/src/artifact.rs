use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::Result;
use crate::envelope::Backup;
use crate::text;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteReport {
    pub size_bytes: u64,
}

/// Write a backup to disk as artifact text; encrypted iff a password is
/// supplied.
pub fn write_artifact(backup: &Backup, path: &Path, password: Option<&str>) -> Result<WriteReport> {
    let artifact_text = match password {
        Some(password) => text::encrypt_text(backup, password)?,
        None => text::encode_plain_text(backup)?,
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    write_atomic(path, artifact_text.as_bytes())?;
    debug!(
        event = "artifact.write",
        path = %path.display(),
        size_bytes = artifact_text.len() as u64,
        encrypted = password.is_some(),
        "artifact.write"
    );
    Ok(WriteReport {
        size_bytes: artifact_text.len() as u64,
    })
}

/// Read and decode an artifact file, auto-detecting its format. A missing
/// or unreadable file fails here, before any item is touched.
pub fn load_backup(path: &Path, password: Option<&str>) -> Result<Backup> {
    let artifact_text = std::fs::read_to_string(path)?;
    text::parse_backup_text(&artifact_text, password)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
