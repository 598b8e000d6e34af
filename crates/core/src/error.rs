use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("malformed artifact: {message}")]
    Format { message: String },

    #[error("crypto error: {message}")]
    Crypto { message: String },

    #[error("unsafe item path: {message}")]
    PathSafety { message: String },

    #[error("source access failed: {message}")]
    SourceAccess { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported path (must be UTF-8): {path:?}")]
    NonUtf8Path { path: PathBuf },
}
