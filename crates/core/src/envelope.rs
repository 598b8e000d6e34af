use serde::Serialize;

use crate::compress::Encoding;
use crate::item::{self, Item};
use crate::{Error, Result};

pub const FORMAT_VERSION: u8 = 2;
pub const LEGACY_FORMAT_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    Index,
    Fs,
}

impl SourceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::Fs => "fs",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "index" => Ok(Self::Index),
            "fs" => Ok(Self::Fs),
            other => Err(Error::Format {
                message: format!("unknown source mode: {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSource {
    pub mode: SourceMode,
    pub root: String,
    pub excludes: Vec<String>,
}

/// A complete snapshot. `items` holds the per-item blobs in replay order;
/// they stay opaque here so metadata inspection never touches item payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct Backup {
    pub format_version: u8,
    pub created_at: String,
    pub source_root: String,
    pub head: Option<String>,
    pub payload_encoding: Encoding,
    pub source: BackupSource,
    pub items: Vec<Vec<u8>>,
    /// True when this value was read out of an encrypted artifact. Set by
    /// the text codec only; never serialized.
    pub encrypted: bool,
}

impl Backup {
    pub fn info(&self) -> BackupInfo {
        BackupInfo {
            format_version: self.format_version,
            created_at: self.created_at.clone(),
            source_root: self.source_root.clone(),
            head: self.head.clone(),
            payload_encoding: self.payload_encoding.as_tag().to_string(),
            source_mode: self.source.mode.as_str().to_string(),
            excludes: self.source.excludes.clone(),
            item_count: self.items.len() as u64,
            encrypted: self.encrypted,
        }
    }

    /// Decode every item blob, in replay order.
    pub fn decode_items(&self) -> Result<Vec<Item>> {
        self.items
            .iter()
            .map(|blob| item::decode_item(blob, self.payload_encoding))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub format_version: u8,
    pub created_at: String,
    pub source_root: String,
    pub head: Option<String>,
    pub payload_encoding: String,
    pub source_mode: String,
    pub excludes: Vec<String>,
    pub item_count: u64,
    pub encrypted: bool,
}

/// Pack a backup into the fixed binary layout (big-endian, length-prefixed):
/// `version:u8 | createdAt:str16 | sourceRoot:str16 | head:str16 |
/// payloadEncoding:str8 | sourceMode:str8 | sourceRoot2:str16 |
/// excludeCount:u16 [excludes:str16]* | itemCount:u32 [itemLen:u32 bytes]*`.
pub fn pack(backup: &Backup) -> Result<Vec<u8>> {
    if backup.format_version != FORMAT_VERSION {
        return Err(Error::Format {
            message: format!(
                "cannot pack format version {} (encoder supports {FORMAT_VERSION})",
                backup.format_version
            ),
        });
    }

    let mut out = Vec::new();
    out.push(backup.format_version);
    put_str16(&mut out, &backup.created_at)?;
    put_str16(&mut out, &backup.source_root)?;
    put_str16(&mut out, backup.head.as_deref().unwrap_or(""))?;
    put_str8(&mut out, backup.payload_encoding.as_tag())?;
    put_str8(&mut out, backup.source.mode.as_str())?;
    put_str16(&mut out, &backup.source.root)?;

    if backup.source.excludes.len() > u16::MAX as usize {
        return Err(Error::Format {
            message: format!("too many exclude patterns: {}", backup.source.excludes.len()),
        });
    }
    out.extend_from_slice(&(backup.source.excludes.len() as u16).to_be_bytes());
    for pattern in &backup.source.excludes {
        put_str16(&mut out, pattern)?;
    }

    if backup.items.len() > u32::MAX as usize {
        return Err(Error::Format {
            message: format!("too many items: {}", backup.items.len()),
        });
    }
    out.extend_from_slice(&(backup.items.len() as u32).to_be_bytes());
    for blob in &backup.items {
        if blob.len() > u32::MAX as usize {
            return Err(Error::Format {
                message: format!("item blob too large: {} bytes", blob.len()),
            });
        }
        out.extend_from_slice(&(blob.len() as u32).to_be_bytes());
        out.extend_from_slice(blob);
    }

    Ok(out)
}

pub fn unpack(bytes: &[u8]) -> Result<Backup> {
    let mut cursor = Cursor::new(bytes);

    let version = cursor.take_u8("format version")?;
    if version != FORMAT_VERSION {
        return Err(Error::Format {
            message: format!("unsupported envelope version: {version}"),
        });
    }

    let created_at = cursor.take_str16("createdAt")?;
    let source_root = cursor.take_str16("sourceRoot")?;
    let head = cursor.take_str16("head")?;
    let payload_encoding = Encoding::from_tag(&cursor.take_str8("payloadEncoding")?)?;
    let source_mode = SourceMode::from_str(&cursor.take_str8("sourceMode")?)?;
    let source_root2 = cursor.take_str16("source root")?;

    let exclude_count = cursor.take_u16("exclude count")?;
    let mut excludes = Vec::with_capacity(exclude_count as usize);
    for _ in 0..exclude_count {
        excludes.push(cursor.take_str16("exclude pattern")?);
    }

    let item_count = cursor.take_u32("item count")?;
    let mut items = Vec::with_capacity(item_count.min(4096) as usize);
    for _ in 0..item_count {
        let len = cursor.take_u32("item length")?;
        items.push(cursor.take(len as usize, "item bytes")?.to_vec());
    }

    cursor.expect_end()?;

    Ok(Backup {
        format_version: version,
        created_at,
        source_root,
        head: if head.is_empty() { None } else { Some(head) },
        payload_encoding,
        source: BackupSource {
            mode: source_mode,
            root: source_root2,
            excludes,
        },
        items,
        encrypted: false,
    })
}

fn put_str8(out: &mut Vec<u8>, s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() > u8::MAX as usize {
        return Err(Error::Format {
            message: format!("tag too long for u8 length prefix: {} bytes", bytes.len()),
        });
    }
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
    Ok(())
}

fn put_str16(out: &mut Vec<u8>, s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(Error::Format {
            message: format!("string too long for u16 length prefix: {} bytes", bytes.len()),
        });
    }
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.buf.len());
        match end {
            Some(end) => {
                let slice = &self.buf[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(Error::Format {
                message: format!("truncated envelope while reading {what}"),
            }),
        }
    }

    fn take_u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn take_u16(&mut self, what: &str) -> Result<u16> {
        let bytes = self.take(2, what)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn take_u32(&mut self, what: &str) -> Result<u32> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn take_str8(&mut self, what: &str) -> Result<String> {
        let len = self.take_u8(what)?;
        self.take_str(len as usize, what)
    }

    fn take_str16(&mut self, what: &str) -> Result<String> {
        let len = self.take_u16(what)?;
        self.take_str(len as usize, what)
    }

    fn take_str(&mut self, len: usize, what: &str) -> Result<String> {
        let bytes = self.take(len, what)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::Format {
            message: format!("{what} is not valid UTF-8"),
        })
    }

    fn expect_end(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(Error::Format {
                message: format!(
                    "trailing bytes after envelope: {} unread",
                    self.buf.len() - self.pos
                ),
            });
        }
        Ok(())
    }
}
