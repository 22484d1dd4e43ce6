//! Input resolution: read a local file or download a URL into a [`Document`].
//!
//! A document is read exactly once and is immutable afterwards. Its kind is
//! *declared* by the file extension (falling back to content sniffing when
//! the extension says nothing) and then *verified* against the bytes, so a
//! `.pdf` that is really an HTML error page fails here with
//! `UnsupportedDocument` rather than deep inside pdfium.

use crate::error::Doc2TextError;
use image::ImageFormat;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Where a document came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentSource {
    Path(PathBuf),
    Url(String),
}

impl DocumentSource {
    /// Human-readable identifier used in errors and logs.
    pub fn display_name(&self) -> String {
        match self {
            DocumentSource::Path(p) => p.display().to_string(),
            DocumentSource::Url(u) => u.clone(),
        }
    }
}

/// The two document shapes the pipeline accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    /// A single raster image in the given container format.
    SingleImage(ImageFormat),
    /// A (possibly multi-page) PDF.
    Pdf,
}

/// An immutable byte source plus its verified kind.
#[derive(Debug, Clone)]
pub struct Document {
    source: DocumentSource,
    kind: DocumentKind,
    bytes: Vec<u8>,
}

impl Document {
    /// Read and classify a local file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Doc2TextError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(Doc2TextError::DocumentNotFound { path });
        }
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Doc2TextError::DocumentNotFound { path: path.clone() }
            } else {
                Doc2TextError::UnsupportedDocument {
                    source_name: path.display().to_string(),
                    detail: format!("unreadable: {e}"),
                }
            }
        })?;
        let declared = declared_kind(&path);
        debug!("Read {} bytes from {}", bytes.len(), path.display());
        Self::from_bytes(DocumentSource::Path(path), declared, bytes)
    }

    /// Build a document from bytes already in memory.
    ///
    /// `declared` is the kind the caller expects; `None` means "sniff it".
    pub fn from_bytes(
        source: DocumentSource,
        declared: Option<DocumentKind>,
        bytes: Vec<u8>,
    ) -> Result<Self, Doc2TextError> {
        let unsupported = |detail: String| Doc2TextError::UnsupportedDocument {
            source_name: source.display_name(),
            detail,
        };

        let kind = match declared.or_else(|| sniff_kind(&bytes)) {
            Some(DocumentKind::Pdf) => {
                if !bytes.starts_with(b"%PDF") {
                    let head: Vec<u8> = bytes.iter().take(4).copied().collect();
                    return Err(unsupported(format!(
                        "declared as PDF but first bytes are {head:?}"
                    )));
                }
                DocumentKind::Pdf
            }
            Some(DocumentKind::SingleImage(declared_fmt)) => {
                // Trust the bytes over the extension for the container, but
                // insist they really are an image.
                let fmt = image::guess_format(&bytes).map_err(|e| {
                    unsupported(format!("declared as {declared_fmt:?} image: {e}"))
                })?;
                DocumentKind::SingleImage(fmt)
            }
            None => {
                return Err(unsupported(
                    "neither a PDF nor a recognised image format".to_string(),
                ))
            }
        };

        Ok(Self {
            source,
            kind,
            bytes,
        })
    }

    /// Build a document whose declared kind comes from the source's file name.
    pub fn from_named_bytes(source: DocumentSource, bytes: Vec<u8>) -> Result<Self, Doc2TextError> {
        let declared = match &source {
            DocumentSource::Path(p) => declared_kind(p),
            DocumentSource::Url(u) => url_path(u).and_then(|name| declared_kind(Path::new(&name))),
        };
        Self::from_bytes(source, declared, bytes)
    }

    pub fn source(&self) -> &DocumentSource {
        &self.source
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Human-readable identifier used in errors and logs.
    pub fn name(&self) -> String {
        self.source.display_name()
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve a user-supplied path or URL into a [`Document`].
pub async fn resolve_document(input: &str, timeout_secs: u64) -> Result<Document, Doc2TextError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        Document::open(input).await
    }
}

/// Kind implied by the file extension, if any.
fn declared_kind(path: &Path) -> Option<DocumentKind> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if ext == "pdf" {
        return Some(DocumentKind::Pdf);
    }
    ImageFormat::from_extension(&ext).map(DocumentKind::SingleImage)
}

/// Kind implied by the leading bytes, if any.
fn sniff_kind(bytes: &[u8]) -> Option<DocumentKind> {
    if bytes.starts_with(b"%PDF") {
        return Some(DocumentKind::Pdf);
    }
    image::guess_format(bytes).ok().map(DocumentKind::SingleImage)
}

/// Download a URL into memory.
async fn download_url(url: &str, timeout_secs: u64) -> Result<Document, Doc2TextError> {
    info!("Downloading document from: {}", url);

    let failed = |reason: String| Doc2TextError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            failed(format!("timed out after {timeout_secs}s"))
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
    info!("Downloaded {} bytes", bytes.len());

    Document::from_named_bytes(DocumentSource::Url(url.to_string()), bytes.to_vec())
}

/// Last path segment of a URL, if it looks like a file name.
fn url_path(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    (!last.is_empty() && last.contains('.')).then(|| last.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgb, RgbImage};
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 3, Rgb([10, 20, 30])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        buf
    }

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.pdf"));
        assert!(is_url("http://example.com/doc.pdf"));
        assert!(!is_url("/tmp/doc.pdf"));
        assert!(!is_url("doc.pdf"));
        assert!(!is_url(""));
    }

    #[tokio::test]
    async fn missing_file_is_document_not_found() {
        let err = Document::open("/definitely/not/a/real/file.pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, Doc2TextError::DocumentNotFound { .. }));
    }

    #[tokio::test]
    async fn pdf_extension_with_html_body_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("statement.pdf");
        std::fs::write(&path, b"<html>not found</html>").unwrap();
        let err = Document::open(&path).await.unwrap_err();
        assert!(matches!(err, Doc2TextError::UnsupportedDocument { .. }));
    }

    #[tokio::test]
    async fn image_file_is_single_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receipt.png");
        std::fs::write(&path, png_bytes()).unwrap();
        let doc = Document::open(&path).await.unwrap();
        assert_eq!(doc.kind(), DocumentKind::SingleImage(ImageFormat::Png));
    }

    #[tokio::test]
    async fn unknown_extension_is_sniffed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.bin");
        std::fs::write(&path, b"%PDF-1.7\n...").unwrap();
        let doc = Document::open(&path).await.unwrap();
        assert_eq!(doc.kind(), DocumentKind::Pdf);
    }

    #[test]
    fn garbage_without_hint_is_unsupported() {
        let err = Document::from_bytes(
            DocumentSource::Path("x".into()),
            None,
            b"hello world".to_vec(),
        )
        .unwrap_err();
        assert!(matches!(err, Doc2TextError::UnsupportedDocument { .. }));
    }

    #[test]
    fn named_bytes_use_extension_then_verify() {
        let doc = Document::from_named_bytes(DocumentSource::Path("scan.png".into()), png_bytes())
            .unwrap();
        assert_eq!(doc.kind(), DocumentKind::SingleImage(ImageFormat::Png));

        let err = Document::from_named_bytes(
            DocumentSource::Url("https://example.com/r.pdf".into()),
            png_bytes(),
        )
        .unwrap_err();
        assert!(matches!(err, Doc2TextError::UnsupportedDocument { .. }));
    }

    #[test]
    fn url_path_extracts_file_name() {
        assert_eq!(
            url_path("https://example.com/files/receipt_4.pdf").as_deref(),
            Some("receipt_4.pdf")
        );
        assert_eq!(url_path("https://example.com/download"), None);
    }
}
