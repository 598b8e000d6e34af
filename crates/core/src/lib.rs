mod artifact;
mod collect;
mod compress;
mod crypto;
mod envelope;
mod error;
mod exclude;
mod git;
mod item;
mod progress;
mod restore;
mod text;

pub const APP_NAME: &str = "StageSnap";

pub use artifact::{WriteReport, load_backup, write_artifact};
pub use collect::{
    CollectConfig, CollectOptions, DEFAULT_BIG_FILE_BYTES, DEFAULT_ITEM_COUNT_THRESHOLD,
    DEFAULT_TOTAL_BYTES_THRESHOLD, Tuning, build_backup, build_backup_with,
};
pub use compress::Encoding;
pub use envelope::{
    Backup, BackupInfo, BackupSource, FORMAT_VERSION, LEGACY_FORMAT_VERSION, SourceMode, pack,
    unpack,
};
pub use error::{Error, Result};
pub use exclude::ExcludeMatcher;
pub use item::{Change, Item, MODE_SUBMODULE, MODE_SYMLINK, Payload};
pub use progress::{ItemProgress, ProgressSink};
pub use restore::{RestoreOptions, RestoreResult, restore_backup, restore_backup_with};
pub use text::{
    PLAIN_PREFIX, decode_plain_text, decrypt_text, encode_plain_text, encrypt_text,
    is_encrypted_text, parse_backup_text,
};
