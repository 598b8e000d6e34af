use std::io::{Read, Write};

use crate::{Error, Result};

/// Quality for the outer envelope: favors ratio, runs once per artifact.
pub const ENVELOPE_QUALITY: u32 = 11;
/// Quality for per-item work, which may run on the worker pool.
pub const ITEM_QUALITY: u32 = 5;

const BROTLI_LG_WINDOW: u32 = 22;
const BROTLI_BUFFER: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Brotli,
    Gzip,
    None,
}

impl Encoding {
    pub fn as_tag(self) -> &'static str {
        match self {
            Self::Brotli => "br",
            Self::Gzip => "gz",
            Self::None => "none",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "br" => Ok(Self::Brotli),
            "gz" => Ok(Self::Gzip),
            "" | "none" => Ok(Self::None),
            other => Err(Error::Format {
                message: format!("unknown content encoding tag: {other}"),
            }),
        }
    }
}

pub fn compress(bytes: &[u8], encoding: Encoding, quality: u32) -> Result<Vec<u8>> {
    match encoding {
        Encoding::Brotli => {
            let mut out = Vec::new();
            {
                let mut writer =
                    brotli::CompressorWriter::new(&mut out, BROTLI_BUFFER, quality, BROTLI_LG_WINDOW);
                writer.write_all(bytes)?;
            }
            Ok(out)
        }
        Encoding::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(bytes)?;
            Ok(encoder.finish()?)
        }
        Encoding::None => Ok(bytes.to_vec()),
    }
}

pub fn decompress(bytes: &[u8], encoding: Encoding) -> Result<Vec<u8>> {
    match encoding {
        Encoding::Brotli => {
            let mut out = Vec::new();
            brotli::Decompressor::new(bytes, BROTLI_BUFFER)
                .read_to_end(&mut out)
                .map_err(|e| Error::Format {
                    message: format!("brotli payload decode failed: {e}"),
                })?;
            Ok(out)
        }
        Encoding::Gzip => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(bytes)
                .read_to_end(&mut out)
                .map_err(|e| Error::Format {
                    message: format!("gzip payload decode failed: {e}"),
                })?;
            Ok(out)
        }
        Encoding::None => Ok(bytes.to_vec()),
    }
}
