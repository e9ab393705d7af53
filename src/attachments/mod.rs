pub mod error;
pub mod manager;
pub mod mime;
pub mod source;

pub use error::{AttachmentError, AttachmentResult};
pub use manager::{AttachmentManager, AttachmentPolicy, DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_SIZE};
pub use source::{Attachment, AttachmentKind, ByteStream};
