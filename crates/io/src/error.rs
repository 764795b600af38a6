use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{key}: blob truncated ({len} bytes)")]
    Truncated { key: String, len: usize },
    #[error("{key}: checksum mismatch")]
    Checksum { key: String },
    #[error("{key}: unknown encoding tag {tag:#04x}")]
    UnknownEncoding { key: String, tag: u8 },
    #[error("{key}: decode failed: {message}")]
    Decode { key: String, message: String },
    #[error("{key}: encode failed: {message}")]
    Encode { key: String, message: String },
    #[error("preview image: {0}")]
    Image(#[from] image::ImageError),
    #[error("document format version {found} is newer than supported {supported}")]
    Version { found: u32, supported: u32 },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// The record is present but its bytes do not decode. Storage itself
    /// is still usable.
    pub fn is_corrupt_record(&self) -> bool {
        matches!(
            self,
            StoreError::Truncated { .. }
                | StoreError::Checksum { .. }
                | StoreError::UnknownEncoding { .. }
                | StoreError::Decode { .. }
        )
    }
}
