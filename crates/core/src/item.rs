use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::compress::{self, Encoding, ITEM_QUALITY};
use crate::{Error, Result};

pub const MODE_SYMLINK: &str = "120000";
pub const MODE_SUBMODULE: &str = "160000";
pub const MODE_REGULAR: &str = "100644";

/// One change record. The `change` variant carries exactly the fields its
/// kind requires, so restore never probes for optional fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub path: String,
    pub change: Change,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Upsert { payload: Payload },
    Delete,
    Rename { old_path: String, payload: Payload },
    Copy { old_path: String, payload: Payload },
}

impl Change {
    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Self::Upsert { payload } | Self::Rename { payload, .. } | Self::Copy { payload, .. } => {
                Some(payload)
            }
            Self::Delete => None,
        }
    }

    pub fn payload_mut(&mut self) -> Option<&mut Payload> {
        match self {
            Self::Upsert { payload } | Self::Rename { payload, .. } | Self::Copy { payload, .. } => {
                Some(payload)
            }
            Self::Delete => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Regular file. `content` holds the bytes as stored, i.e. already
    /// compressed when `encoding` says so.
    File {
        mode: String,
        content: Vec<u8>,
        encoding: Encoding,
    },
    Symlink { target: String },
    Submodule,
}

impl Item {
    pub fn upsert_file(path: impl Into<String>, mode: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            change: Change::Upsert {
                payload: Payload::File {
                    mode: mode.into(),
                    content,
                    encoding: Encoding::None,
                },
            },
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            change: Change::Delete,
        }
    }
}

/// Wire shape shared by per-item blobs (format version 2) and the legacy
/// all-JSON backup (format version 1). Field names match the historical
/// artifact format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ItemRecord {
    pub kind: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_submodule: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn b64() -> base64::engine::general_purpose::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

impl Item {
    pub(crate) fn to_record(&self) -> ItemRecord {
        let (kind, old_path, payload) = match &self.change {
            Change::Upsert { payload } => ("A", None, Some(payload)),
            Change::Delete => ("D", None, None),
            Change::Rename { old_path, payload } => ("R", Some(old_path.clone()), Some(payload)),
            Change::Copy { old_path, payload } => ("C", Some(old_path.clone()), Some(payload)),
        };

        let mut record = ItemRecord {
            kind: kind.to_string(),
            path: self.path.clone(),
            old_path,
            mode: None,
            is_submodule: false,
            symlink_target: None,
            content: None,
            content_encoding: None,
        };

        match payload {
            Some(Payload::File {
                mode,
                content,
                encoding,
            }) => {
                record.mode = Some(mode.clone());
                record.content = Some(b64().encode(content));
                record.content_encoding = Some(encoding.as_tag().to_string());
            }
            Some(Payload::Symlink { target }) => {
                record.mode = Some(MODE_SYMLINK.to_string());
                record.symlink_target = Some(target.clone());
            }
            Some(Payload::Submodule) => {
                record.mode = Some(MODE_SUBMODULE.to_string());
                record.is_submodule = true;
            }
            None => {}
        }

        record
    }

    pub(crate) fn from_record(record: ItemRecord) -> Result<Self> {
        if record.path.is_empty() {
            return Err(Error::Format {
                message: "item record has an empty path".to_string(),
            });
        }

        let change = match record.kind.as_str() {
            "D" => Change::Delete,
            "A" | "M" => Change::Upsert {
                payload: payload_from_record(&record)?,
            },
            "R" => Change::Rename {
                old_path: require_old_path(&record)?,
                payload: payload_from_record(&record)?,
            },
            "C" => Change::Copy {
                old_path: require_old_path(&record)?,
                payload: payload_from_record(&record)?,
            },
            other => {
                return Err(Error::Format {
                    message: format!("unknown item kind {other:?} for {}", record.path),
                });
            }
        };

        Ok(Self {
            path: record.path,
            change,
        })
    }
}

fn require_old_path(record: &ItemRecord) -> Result<String> {
    record.old_path.clone().ok_or_else(|| Error::Format {
        message: format!(
            "{} item {} is missing its old path",
            record.kind, record.path
        ),
    })
}

fn payload_from_record(record: &ItemRecord) -> Result<Payload> {
    let present = usize::from(record.is_submodule)
        + usize::from(record.symlink_target.is_some())
        + usize::from(record.content.is_some());
    if present != 1 {
        return Err(Error::Format {
            message: format!(
                "item {} must carry exactly one of submodule flag, symlink target, or content",
                record.path
            ),
        });
    }

    if record.is_submodule {
        return Ok(Payload::Submodule);
    }
    if let Some(target) = &record.symlink_target {
        return Ok(Payload::Symlink {
            target: target.clone(),
        });
    }

    let content_b64 = record.content.as_deref().unwrap_or("");
    let content = b64()
        .decode(content_b64.as_bytes())
        .map_err(|e| Error::Format {
            message: format!("item {} content is not valid base64: {e}", record.path),
        })?;
    let encoding = Encoding::from_tag(record.content_encoding.as_deref().unwrap_or(""))?;
    let mode = record
        .mode
        .clone()
        .unwrap_or_else(|| MODE_REGULAR.to_string());

    Ok(Payload::File {
        mode,
        content,
        encoding,
    })
}

/// Serialize one item into the opaque blob stored inside the binary
/// envelope: JSON record, then the backup's payload encoding.
pub(crate) fn encode_item(item: &Item, payload_encoding: Encoding) -> Result<Vec<u8>> {
    let record = item.to_record();
    let json = serde_json::to_vec(&record).map_err(|e| Error::Format {
        message: format!("item record encode failed: {e}"),
    })?;
    compress::compress(&json, payload_encoding, ITEM_QUALITY)
}

pub(crate) fn decode_item(bytes: &[u8], payload_encoding: Encoding) -> Result<Item> {
    let json = compress::decompress(bytes, payload_encoding)?;
    let record: ItemRecord = serde_json::from_slice(&json).map_err(|e| Error::Format {
        message: format!("invalid item record json: {e}"),
    })?;
    Item::from_record(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_item_blob_round_trip() {
        let item = Item::upsert_file("src/main.rs", "100644", b"fn main() {}".to_vec());
        let blob = encode_item(&item, Encoding::Brotli).unwrap();
        let decoded = decode_item(&blob, Encoding::Brotli).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn rename_round_trip_keeps_old_path() {
        let item = Item {
            path: "new.txt".to_string(),
            change: Change::Rename {
                old_path: "old.txt".to_string(),
                payload: Payload::File {
                    mode: "100644".to_string(),
                    content: b"x".to_vec(),
                    encoding: Encoding::None,
                },
            },
        };
        let blob = encode_item(&item, Encoding::Brotli).unwrap();
        assert_eq!(decode_item(&blob, Encoding::Brotli).unwrap(), item);
    }

    #[test]
    fn symlink_record_carries_the_mode_marker() {
        let item = Item {
            path: "link".to_string(),
            change: Change::Upsert {
                payload: Payload::Symlink {
                    target: "target.txt".to_string(),
                },
            },
        };
        let record = item.to_record();
        assert_eq!(record.mode.as_deref(), Some(MODE_SYMLINK));
        assert_eq!(Item::from_record(record).unwrap(), item);
    }

    #[test]
    fn modify_status_reads_as_upsert() {
        let record = ItemRecord {
            kind: "M".to_string(),
            path: "a.txt".to_string(),
            old_path: None,
            mode: Some("100644".to_string()),
            is_submodule: false,
            symlink_target: None,
            content: Some(b64().encode(b"hi")),
            content_encoding: None,
        };
        let item = Item::from_record(record).unwrap();
        assert!(matches!(item.change, Change::Upsert { .. }));
    }

    #[test]
    fn symlink_without_target_is_malformed() {
        let record = ItemRecord {
            kind: "A".to_string(),
            path: "link".to_string(),
            old_path: None,
            mode: Some(MODE_SYMLINK.to_string()),
            is_submodule: false,
            symlink_target: None,
            content: None,
            content_encoding: None,
        };
        let err = Item::from_record(record).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
    }

    #[test]
    fn rename_without_old_path_is_malformed() {
        let record = ItemRecord {
            kind: "R".to_string(),
            path: "new.txt".to_string(),
            old_path: None,
            mode: Some("100644".to_string()),
            is_submodule: false,
            symlink_target: None,
            content: Some(String::new()),
            content_encoding: None,
        };
        let err = Item::from_record(record).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
    }

    #[test]
    fn legacy_gzip_content_encoding_is_accepted() {
        let compressed = compress::compress(b"legacy bytes", Encoding::Gzip, 0).unwrap();
        let record = ItemRecord {
            kind: "A".to_string(),
            path: "old.dat".to_string(),
            old_path: None,
            mode: Some("100644".to_string()),
            is_submodule: false,
            symlink_target: None,
            content: Some(b64().encode(&compressed)),
            content_encoding: Some("gz".to_string()),
        };
        let item = Item::from_record(record).unwrap();
        match &item.change {
            Change::Upsert {
                payload: Payload::File { content, encoding, .. },
            } => {
                assert_eq!(*encoding, Encoding::Gzip);
                assert_eq!(
                    compress::decompress(content, *encoding).unwrap(),
                    b"legacy bytes"
                );
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }
}
