#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttachmentError {
    #[error("attachment not found: {0}")]
    NotFound(String),
    #[error("attachment exceeds maximum size ({size} > {max} bytes)")]
    TooLarge { size: u64, max: u64 },
    #[error("attachment fetch failed: {0}")]
    Fetch(String),
    #[error("attachment I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for AttachmentError {
    fn from(err: std::io::Error) -> Self {
        AttachmentError::Io(err.to_string())
    }
}

pub type AttachmentResult<T> = Result<T, AttachmentError>;
