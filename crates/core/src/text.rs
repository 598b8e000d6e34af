use base64::Engine;
use serde::Deserialize;

use crate::compress::{self, ENVELOPE_QUALITY, Encoding};
use crate::crypto;
use crate::envelope::{self, Backup, BackupSource, LEGACY_FORMAT_VERSION, SourceMode};
use crate::item::{Item, ItemRecord};
use crate::{Error, Result};

/// Leading tag of a plain (compressed, unencrypted) artifact.
pub const PLAIN_PREFIX: &str = "SSP1:";

fn base64_engine() -> base64::engine::general_purpose::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

pub fn encode_plain_text(backup: &Backup) -> Result<String> {
    let packed = envelope::pack(backup)?;
    let compressed = compress::compress(&packed, Encoding::Brotli, ENVELOPE_QUALITY)?;
    Ok(format!("{PLAIN_PREFIX}{}", base64_engine().encode(compressed)))
}

pub fn decode_plain_text(text: &str) -> Result<Backup> {
    let trimmed = text.trim();
    let rest = trimmed.strip_prefix(PLAIN_PREFIX).unwrap_or(trimmed);
    let compressed = base64_engine()
        .decode(rest.as_bytes())
        .map_err(|e| Error::Format {
            message: format!("invalid artifact (bad base64): {e}"),
        })?;
    let packed = compress::decompress(&compressed, Encoding::Brotli)?;
    envelope::unpack(&packed)
}

pub fn encrypt_text(backup: &Backup, password: &str) -> Result<String> {
    let packed = envelope::pack(backup)?;
    let compressed = compress::compress(&packed, Encoding::Brotli, ENVELOPE_QUALITY)?;
    let sealed = crypto::seal(&compressed, password, true)?;
    Ok(base64_engine().encode(sealed))
}

pub fn decrypt_text(text: &str, password: &str) -> Result<Backup> {
    let bytes = base64_engine()
        .decode(text.trim().as_bytes())
        .map_err(|e| Error::Format {
            message: format!("invalid encrypted artifact (bad base64): {e}"),
        })?;
    let opened = crypto::open(&bytes, password)?;
    let packed = if opened.compressed {
        compress::decompress(&opened.plaintext, Encoding::Brotli)?
    } else {
        opened.plaintext
    };
    let mut backup = envelope::unpack(&packed)?;
    backup.encrypted = true;
    Ok(backup)
}

/// Detect encryption from the leading magic bytes alone; no password and no
/// full base64 decode needed.
pub fn is_encrypted_text(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.starts_with(PLAIN_PREFIX) || trimmed.starts_with('{') {
        return false;
    }
    // 8 base64 chars decode to the first 6 raw bytes, enough for the magic.
    let Some(head) = trimmed.as_bytes().get(..8) else {
        return false;
    };
    match base64_engine().decode(head) {
        Ok(bytes) => crypto::is_encrypted(&bytes),
        Err(_) => false,
    }
}

/// Unified reader: `SSP1:` prefix selects the plain path, a leading `{`
/// selects the legacy all-JSON layout, the encryption magic requires a
/// password, and anything else is treated as plain without a prefix.
pub fn parse_backup_text(text: &str, password: Option<&str>) -> Result<Backup> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(Error::Format {
            message: "artifact is empty".to_string(),
        });
    }
    if trimmed.starts_with(PLAIN_PREFIX) {
        return decode_plain_text(trimmed);
    }
    if trimmed.starts_with('{') {
        return decode_legacy_json(trimmed);
    }
    if is_encrypted_text(trimmed) {
        let password = password.ok_or_else(|| Error::Crypto {
            message: "artifact is encrypted: password required".to_string(),
        })?;
        return decrypt_text(trimmed, password);
    }
    decode_plain_text(trimmed)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyBackupV1 {
    format_version: u8,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    source_root: String,
    #[serde(default)]
    head: Option<String>,
    #[serde(default)]
    source: Option<LegacySourceV1>,
    #[serde(default)]
    items: Vec<ItemRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacySourceV1 {
    mode: String,
    #[serde(default)]
    root: String,
    #[serde(default)]
    excludes: Vec<String>,
}

/// Version-1 artifacts were a single JSON document with inline item
/// records. Read-only: the encoder always produces version 2.
fn decode_legacy_json(text: &str) -> Result<Backup> {
    let legacy: LegacyBackupV1 = serde_json::from_str(text).map_err(|e| Error::Format {
        message: format!("invalid legacy backup json: {e}"),
    })?;
    if legacy.format_version != LEGACY_FORMAT_VERSION {
        return Err(Error::Format {
            message: format!("unsupported legacy format version: {}", legacy.format_version),
        });
    }

    let source = match legacy.source {
        Some(source) => BackupSource {
            mode: SourceMode::from_str(&source.mode)?,
            root: if source.root.is_empty() {
                legacy.source_root.clone()
            } else {
                source.root
            },
            excludes: source.excludes,
        },
        None => BackupSource {
            mode: SourceMode::Index,
            root: legacy.source_root.clone(),
            excludes: Vec::new(),
        },
    };

    let mut items = Vec::with_capacity(legacy.items.len());
    for record in legacy.items {
        // Validate eagerly so a malformed record fails the decode, not the
        // restore halfway through.
        Item::from_record(record.clone())?;
        let blob = serde_json::to_vec(&record).map_err(|e| Error::Format {
            message: format!("legacy item re-encode failed: {e}"),
        })?;
        items.push(blob);
    }

    Ok(Backup {
        format_version: LEGACY_FORMAT_VERSION,
        created_at: legacy.created_at,
        source_root: legacy.source_root,
        head: legacy.head.filter(|h| !h.is_empty()),
        payload_encoding: Encoding::None,
        source,
        items,
        encrypted: false,
    })
}
