use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};

use crate::{Error, Result};

pub const MAGIC: [u8; 4] = *b"SSEC";
pub const ENVELOPE_VERSION: u8 = 1;
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;
pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// magic + version + flags + salt + nonce + tag.
pub const HEADER_LEN: usize = 4 + 1 + 1 + SALT_LEN + NONCE_LEN + TAG_LEN;

const ARTIFACT_AAD: &[u8] = b"stagesnap.artifact.v1";

// Fixed scrypt cost; changing any of these requires an envelope version bump.
const SCRYPT_LOG_N: u8 = 15;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

pub fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; 32]> {
    if password.is_empty() {
        return Err(Error::InvalidConfig {
            message: "password must not be empty".to_string(),
        });
    }

    let params =
        scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, 32).map_err(|e| Error::Crypto {
            message: format!("invalid scrypt parameters: {e}"),
        })?;
    let mut key = [0u8; 32];
    scrypt::scrypt(password.as_bytes(), salt, &params, &mut key).map_err(|e| Error::Crypto {
        message: format!("key derivation failed: {e}"),
    })?;
    Ok(key)
}

#[derive(Debug)]
pub struct Opened {
    pub plaintext: Vec<u8>,
    pub compressed: bool,
}

/// Encrypt `plaintext` under a password-derived key. Output layout:
/// `magic | version | flags | salt | nonce | tag | ciphertext`, with a fresh
/// random salt and nonce per call.
pub fn seal(plaintext: &[u8], password: &str, compressed: bool) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    getrandom::getrandom(&mut salt).map_err(|e| Error::Crypto {
        message: format!("getrandom failed: {e}"),
    })?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce_bytes).map_err(|e| Error::Crypto {
        message: format!("getrandom failed: {e}"),
    })?;

    let key = derive_key(password, &salt)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(nonce, ARTIFACT_AAD, &mut buffer)
        .map_err(|_| Error::Crypto {
            message: "encryption failed".to_string(),
        })?;

    let mut out = Vec::with_capacity(HEADER_LEN + buffer.len());
    out.extend_from_slice(&MAGIC);
    out.push(ENVELOPE_VERSION);
    out.push(if compressed { FLAG_COMPRESSED } else { 0 });
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&buffer);
    Ok(out)
}

/// Header-shape violations surface as `Format` before any key derivation;
/// a failed authentication (wrong password or tampering) is `Crypto`.
pub fn open(bytes: &[u8], password: &str) -> Result<Opened> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::Format {
            message: format!(
                "encrypted envelope too small: {} bytes (header needs {HEADER_LEN})",
                bytes.len()
            ),
        });
    }
    if bytes[..4] != MAGIC {
        return Err(Error::Format {
            message: "encrypted envelope magic mismatch".to_string(),
        });
    }
    let version = bytes[4];
    if version != ENVELOPE_VERSION {
        return Err(Error::Format {
            message: format!("unsupported encrypted envelope version: {version}"),
        });
    }
    let flags = bytes[5];
    let salt = &bytes[6..6 + SALT_LEN];
    let nonce = Nonce::from_slice(&bytes[6 + SALT_LEN..6 + SALT_LEN + NONCE_LEN]);
    let tag = Tag::from_slice(&bytes[6 + SALT_LEN + NONCE_LEN..HEADER_LEN]);

    let key = derive_key(password, salt)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));

    let mut buffer = bytes[HEADER_LEN..].to_vec();
    cipher
        .decrypt_in_place_detached(nonce, ARTIFACT_AAD, &mut buffer, tag)
        .map_err(|_| Error::Crypto {
            message: "decryption failed (wrong password or corrupted data)".to_string(),
        })?;

    Ok(Opened {
        plaintext: buffer,
        compressed: flags & FLAG_COMPRESSED != 0,
    })
}

pub fn is_encrypted(bytes: &[u8]) -> bool {
    bytes.len() >= MAGIC.len() && bytes[..MAGIC.len()] == MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let sealed = seal(b"snapshot payload", "hunter2", true).unwrap();
        assert!(is_encrypted(&sealed));

        let opened = open(&sealed, "hunter2").unwrap();
        assert_eq!(opened.plaintext, b"snapshot payload");
        assert!(opened.compressed);
    }

    #[test]
    fn wrong_password_is_a_crypto_error() {
        let sealed = seal(b"payload", "hunter2", false).unwrap();
        let err = open(&sealed, "wrong").unwrap_err();
        assert!(matches!(err, Error::Crypto { .. }));
    }

    #[test]
    fn every_ciphertext_byte_is_authenticated() {
        let sealed = seal(b"tamper target", "hunter2", false).unwrap();
        for i in HEADER_LEN..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[i] ^= 0x01;
            let err = open(&tampered, "hunter2").unwrap_err();
            assert!(matches!(err, Error::Crypto { .. }), "byte {i}");
        }
    }

    #[test]
    fn header_violations_are_format_errors() {
        let sealed = seal(b"payload", "hunter2", false).unwrap();

        let err = open(&sealed[..HEADER_LEN - 1], "hunter2").unwrap_err();
        assert!(matches!(err, Error::Format { .. }));

        let mut bad_magic = sealed.clone();
        bad_magic[0] = b'X';
        let err = open(&bad_magic, "hunter2").unwrap_err();
        assert!(matches!(err, Error::Format { .. }));

        let mut bad_version = sealed;
        bad_version[4] = 9;
        let err = open(&bad_version, "hunter2").unwrap_err();
        assert!(err.to_string().contains("unsupported encrypted envelope version"));
    }

    #[test]
    fn salts_and_nonces_are_fresh_per_seal() {
        let a = seal(b"same payload", "hunter2", false).unwrap();
        let b = seal(b"same payload", "hunter2", false).unwrap();
        assert_ne!(a[6..6 + SALT_LEN], b[6..6 + SALT_LEN]);
        assert_ne!(
            a[6 + SALT_LEN..6 + SALT_LEN + NONCE_LEN],
            b[6 + SALT_LEN..6 + SALT_LEN + NONCE_LEN]
        );
    }

    #[test]
    fn empty_password_is_rejected_before_any_work() {
        let err = derive_key("", &[0u8; SALT_LEN]).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }
}
