//! Attachment handles.
//!
//! An [`Attachment`] is an `Arc` over one of three sources. Cloning is cheap
//! and clones share memoised metadata, so one attachment can be handed to
//! every service of a dispatch without re-reading or re-fetching it.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::io::AsyncReadExt;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;

use super::error::{AttachmentError, AttachmentResult};
use super::mime;

pub type ByteStream = BoxStream<'static, AttachmentResult<Bytes>>;

const DEFAULT_NAME: &str = "attachment";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    File,
    Http,
    Inline,
}

#[derive(Clone)]
pub struct Attachment {
    inner: Arc<Source>,
}

#[derive(Debug)]
enum Source {
    File(FileSource),
    Http(HttpSource),
    Inline(InlineSource),
}

#[derive(Debug)]
struct FileSource {
    path: PathBuf,
    name: String,
    max_size: u64,
    size: OnceCell<u64>,
    mime: OnceCell<String>,
}

#[derive(Debug)]
struct HttpSource {
    url: String,
    name: String,
    client: reqwest::Client,
    max_size: u64,
    fetch_timeout: Duration,
    content: OnceCell<Fetched>,
}

#[derive(Debug)]
struct Fetched {
    bytes: Bytes,
    mime: String,
}

#[derive(Debug)]
struct InlineSource {
    name: String,
    mime: String,
    bytes: Bytes,
}

impl Attachment {
    /// A file on the local filesystem. Existence is checked lazily; use
    /// [`AttachmentManager::add`](super::AttachmentManager::add) to validate up front.
    pub fn from_path(path: impl Into<PathBuf>, max_size: u64) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_NAME.to_string());
        Self::wrap(Source::File(FileSource {
            path,
            name,
            max_size,
            size: OnceCell::new(),
            mime: OnceCell::new(),
        }))
    }

    /// Remote content fetched on first use and cached afterwards.
    pub fn from_url(
        url: impl Into<String>,
        name: Option<&str>,
        client: reqwest::Client,
        max_size: u64,
        fetch_timeout: Duration,
    ) -> Self {
        let url = url.into();
        let name = name
            .map(str::to_string)
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| name_from_url(&url));
        Self::wrap(Source::Http(HttpSource {
            url,
            name,
            client,
            max_size,
            fetch_timeout,
            content: OnceCell::new(),
        }))
    }

    /// In-memory bytes. An empty `mime` is inferred from the name, then the content.
    pub fn from_bytes(bytes: impl Into<Bytes>, name: &str, mime: &str) -> Self {
        let bytes = bytes.into();
        let name = if name.trim().is_empty() { DEFAULT_NAME.to_string() } else { name.to_string() };
        let mime = if mime.trim().is_empty() {
            mime::from_extension(&name)
                .unwrap_or_else(|| mime::sniff(&bytes))
                .to_string()
        } else {
            mime.to_string()
        };
        Self::wrap(Source::Inline(InlineSource { name, mime, bytes }))
    }

    fn wrap(source: Source) -> Self {
        Self {
            inner: Arc::new(source),
        }
    }

    pub fn kind(&self) -> AttachmentKind {
        match self.inner.as_ref() {
            Source::File(_) => AttachmentKind::File,
            Source::Http(_) => AttachmentKind::Http,
            Source::Inline(_) => AttachmentKind::Inline,
        }
    }

    pub fn name(&self) -> &str {
        match self.inner.as_ref() {
            Source::File(file) => &file.name,
            Source::Http(http) => &http.name,
            Source::Inline(inline) => &inline.name,
        }
    }

    /// The filesystem path or remote URL backing this attachment.
    pub fn location(&self) -> Option<&str> {
        match self.inner.as_ref() {
            Source::File(file) => file.path.to_str(),
            Source::Http(http) => Some(http.url.as_str()),
            Source::Inline(_) => None,
        }
    }

    pub async fn exists(&self) -> bool {
        match self.inner.as_ref() {
            Source::File(file) => tokio::fs::metadata(&file.path)
                .await
                .map(|meta| meta.is_file())
                .unwrap_or(false),
            Source::Http(http) => http.fetch().await.is_ok(),
            Source::Inline(_) => true,
        }
    }

    pub async fn size(&self) -> AttachmentResult<u64> {
        match self.inner.as_ref() {
            Source::File(file) => file.size().await,
            Source::Http(http) => Ok(http.fetch().await?.bytes.len() as u64),
            Source::Inline(inline) => Ok(inline.bytes.len() as u64),
        }
    }

    pub async fn mime_type(&self) -> AttachmentResult<String> {
        match self.inner.as_ref() {
            Source::File(file) => file.mime().await,
            Source::Http(http) => Ok(http.fetch().await?.mime.clone()),
            Source::Inline(inline) => Ok(inline.mime.clone()),
        }
    }

    /// A fresh stream over the content. Each call starts from the beginning.
    pub async fn open(&self) -> AttachmentResult<ByteStream> {
        match self.inner.as_ref() {
            Source::File(file) => {
                file.check_size().await?;
                let handle = tokio::fs::File::open(&file.path)
                    .await
                    .map_err(|err| file.io_error(err))?;
                Ok(ReaderStream::new(handle.take(file.limit()))
                    .map(|chunk| chunk.map_err(AttachmentError::from))
                    .boxed())
            }
            Source::Http(http) => {
                let bytes = http.fetch().await?.bytes.clone();
                Ok(stream::once(async move { Ok(bytes) }).boxed())
            }
            Source::Inline(inline) => {
                let bytes = inline.bytes.clone();
                Ok(stream::once(async move { Ok(bytes) }).boxed())
            }
        }
    }

    /// The whole content in memory.
    pub async fn read(&self) -> AttachmentResult<Bytes> {
        match self.inner.as_ref() {
            Source::File(file) => file.read().await,
            Source::Http(http) => Ok(http.fetch().await?.bytes.clone()),
            Source::Inline(inline) => Ok(inline.bytes.clone()),
        }
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}

impl FileSource {
    fn io_error(&self, err: std::io::Error) -> AttachmentError {
        if err.kind() == std::io::ErrorKind::NotFound {
            AttachmentError::NotFound(self.path.display().to_string())
        } else {
            AttachmentError::Io(format!("{}: {err}", self.path.display()))
        }
    }

    fn limit(&self) -> u64 {
        if self.max_size == 0 { u64::MAX } else { self.max_size }
    }

    async fn size(&self) -> AttachmentResult<u64> {
        self.size
            .get_or_try_init(|| async {
                let meta = tokio::fs::metadata(&self.path)
                    .await
                    .map_err(|err| self.io_error(err))?;
                if !meta.is_file() {
                    return Err(AttachmentError::NotFound(self.path.display().to_string()));
                }
                Ok(meta.len())
            })
            .await
            .copied()
    }

    async fn check_size(&self) -> AttachmentResult<()> {
        let size = self.size().await?;
        if size > self.limit() {
            return Err(AttachmentError::TooLarge {
                size,
                max: self.max_size,
            });
        }
        Ok(())
    }

    async fn read(&self) -> AttachmentResult<Bytes> {
        self.check_size().await?;
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|err| self.io_error(err))?;
        // The file may have grown since metadata was taken.
        if bytes.len() as u64 > self.limit() {
            return Err(AttachmentError::TooLarge {
                size: bytes.len() as u64,
                max: self.max_size,
            });
        }
        Ok(Bytes::from(bytes))
    }

    async fn mime(&self) -> AttachmentResult<String> {
        self.mime
            .get_or_try_init(|| async {
                if let Some(mime) = mime::from_extension(&self.name) {
                    return Ok(mime.to_string());
                }
                let mut handle = tokio::fs::File::open(&self.path)
                    .await
                    .map_err(|err| self.io_error(err))?;
                let mut head = vec![0u8; mime::SNIFF_LEN];
                let mut filled = 0;
                while filled < head.len() {
                    let read = handle.read(&mut head[filled..]).await?;
                    if read == 0 {
                        break;
                    }
                    filled += read;
                }
                Ok(mime::sniff(&head[..filled]).to_string())
            })
            .await
            .cloned()
    }
}

impl HttpSource {
    async fn fetch(&self) -> AttachmentResult<&Fetched> {
        self.content
            .get_or_try_init(|| async {
                match tokio::time::timeout(self.fetch_timeout, self.download()).await {
                    Ok(result) => result,
                    Err(_) => Err(AttachmentError::Fetch(format!(
                        "{} timed out after {:?}",
                        self.url, self.fetch_timeout
                    ))),
                }
            })
            .await
    }

    async fn download(&self) -> AttachmentResult<Fetched> {
        let limit = if self.max_size == 0 { u64::MAX } else { self.max_size };
        let mut response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| AttachmentError::Fetch(format!("{}: {err}", self.url)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AttachmentError::Fetch(format!("{} returned {status}", self.url)));
        }
        if let Some(declared) = response.content_length()
            && declared > limit
        {
            return Err(AttachmentError::TooLarge {
                size: declared,
                max: self.max_size,
            });
        }
        let header_mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(mime::strip_params)
            .filter(|value| !value.is_empty());

        let mut buffer = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| AttachmentError::Fetch(format!("{}: {err}", self.url)))?
        {
            let total = (buffer.len() + chunk.len()) as u64;
            if total > limit {
                tracing::warn!(
                    event = "attachment_too_large",
                    url = %self.url,
                    received = total,
                    max = self.max_size,
                    "aborting attachment download"
                );
                return Err(AttachmentError::TooLarge {
                    size: total,
                    max: self.max_size,
                });
            }
            buffer.extend_from_slice(&chunk);
        }
        let bytes = buffer.freeze();
        let mime = header_mime.unwrap_or_else(|| mime::sniff(&bytes).to_string());
        tracing::debug!(
            event = "attachment_fetched",
            url = %self.url,
            size = bytes.len(),
            mime = %mime,
            "fetched remote attachment"
        );
        Ok(Fetched { bytes, mime })
    }
}

fn name_from_url(raw: &str) -> String {
    url::Url::parse(raw)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            urlencoding::decode(&segment)
                .map(|decoded| decoded.into_owned())
                .unwrap_or(segment)
        })
        .unwrap_or_else(|| DEFAULT_NAME.to_string())
}

pub(crate) fn is_remote(location: &str) -> bool {
    let lower = location.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str, content: &[u8]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("herald-attach-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn file_metadata_and_restartable_stream() {
        let path = temp_file("notes.txt", b"hello attachment");
        let attachment = Attachment::from_path(&path, 1024);
        assert_eq!(attachment.kind(), AttachmentKind::File);
        assert_eq!(attachment.name(), "notes.txt");
        assert!(attachment.exists().await);
        assert_eq!(attachment.size().await.unwrap(), 16);
        assert_eq!(attachment.mime_type().await.unwrap(), "text/plain");

        for _ in 0..2 {
            let chunks: Vec<_> = attachment.open().await.unwrap().collect().await;
            let joined: Vec<u8> = chunks
                .into_iter()
                .flat_map(|chunk| chunk.unwrap().to_vec())
                .collect();
            assert_eq!(joined, b"hello attachment");
        }
    }

    #[tokio::test]
    async fn file_without_extension_is_sniffed() {
        let path = temp_file("image", b"\x89PNG\r\n\x1a\nrest");
        let attachment = Attachment::from_path(&path, 0);
        assert_eq!(attachment.mime_type().await.unwrap(), "image/png");
    }

    #[tokio::test]
    async fn oversized_file_is_rejected_on_read() {
        let path = temp_file("big.bin", &[7u8; 64]);
        let attachment = Attachment::from_path(&path, 32);
        assert_eq!(
            attachment.read().await,
            Err(AttachmentError::TooLarge { size: 64, max: 32 })
        );
    }

    #[tokio::test]
    async fn missing_file_reports_not_found() {
        let attachment = Attachment::from_path("/definitely/not/here.txt", 0);
        assert!(!attachment.exists().await);
        assert!(matches!(attachment.size().await, Err(AttachmentError::NotFound(_))));
    }

    #[tokio::test]
    async fn inline_infers_mime_when_missing() {
        let attachment = Attachment::from_bytes(b"{\"ok\":true}".to_vec(), "", "");
        assert_eq!(attachment.name(), "attachment");
        assert_eq!(attachment.mime_type().await.unwrap(), "application/json");
        let attachment = Attachment::from_bytes(Bytes::from_static(b"x"), "a.csv", "");
        assert_eq!(attachment.mime_type().await.unwrap(), "text/csv");
        assert_eq!(attachment.read().await.unwrap(), Bytes::from_static(b"x"));
    }

    #[test]
    fn names_from_urls() {
        assert_eq!(name_from_url("https://example.com/files/report%201.pdf"), "report 1.pdf");
        assert_eq!(name_from_url("https://example.com/"), "attachment");
        assert_eq!(name_from_url("not a url"), "attachment");
        assert!(is_remote("HTTPS://example.com/a"));
        assert!(!is_remote("/tmp/a"));
    }
}
