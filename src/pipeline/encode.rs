//! Media encoding: page images and image files → [`MediaReference`].
//!
//! Two transport forms exist:
//!
//! * **Local reference**: `file://<absolute-path>` pointing at a page that is
//!   already on disk. Cheap, but only valid for an engine that shares our
//!   filesystem, and only after the [`Sandbox`] guard has approved the path.
//!   The encoder never writes files itself; see
//!   [`crate::pipeline::render::save_pages`].
//! * **Inline**: `data:<mime>;base64,<bytes>`. Self-contained, so it is the
//!   only form a remote backend ever receives.
//!
//! Inline encoding is deterministic: the same pixels always produce the same
//! URI, which keeps tests reproducible and makes the output cacheable.

use crate::config::{EncodingMode, PageFormat};
use crate::error::Doc2TextError;
use crate::pipeline::render::PageImage;
use crate::pipeline::sandbox::Sandbox;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

/// MIME type used when neither the extension nor the bytes identify the image.
pub const DEFAULT_IMAGE_MIME: &str = "image/jpeg";

/// The transport form of one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaReference {
    kind: MediaKind,
    url: String,
    dimensions: Option<(u32, u32)>,
}

/// Which of the three reference shapes a [`MediaReference`] has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    LocalFileUrl,
    InlineDataUri,
    RemoteUrl,
}

impl MediaReference {
    /// Pass an `http(s)` image URL through untouched.
    pub fn remote(url: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::RemoteUrl,
            url: url.into(),
            dimensions: None,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// The URL exactly as it goes on the wire.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Pixel size, when known; used only for token estimates.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }

    fn with_dimensions(mut self, dims: Option<(u32, u32)>) -> Self {
        self.dimensions = dims;
        self
    }
}

/// Encode a rasterised page in the requested mode.
///
/// `LocalReference` requires the page to have been materialised on disk and
/// the file to pass `sandbox`; `Inline` serialises the pixels as `format`.
pub fn encode_page(
    page: &PageImage,
    mode: EncodingMode,
    format: PageFormat,
    sandbox: Option<&Sandbox>,
) -> Result<MediaReference, Doc2TextError> {
    let dims = Some((page.width, page.height));
    match mode {
        EncodingMode::LocalReference => {
            let path = page
                .path
                .as_deref()
                .ok_or(Doc2TextError::PageNotMaterialized { page: page.index })?;
            let sandbox = sandbox.ok_or_else(|| {
                Doc2TextError::InvalidConfig(
                    "local-reference encoding requires an allowed media root".into(),
                )
            })?;
            Ok(encode_local_file(path, sandbox)?.with_dimensions(dims))
        }
        EncodingMode::Inline => {
            let uri = inline_image(&page.image, format).map_err(|e| {
                Doc2TextError::EncodingFailed {
                    page: page.index,
                    detail: e.to_string(),
                }
            })?;
            debug!("Encoded page {} → {} bytes data URI", page.index, uri.len());
            Ok(MediaReference {
                kind: MediaKind::InlineDataUri,
                url: uri,
                dimensions: dims,
            })
        }
    }
}

/// Build a `file://` reference after the sandbox approves `path`.
pub fn encode_local_file(path: &Path, sandbox: &Sandbox) -> Result<MediaReference, Doc2TextError> {
    let resolved = sandbox.validate(path)?;
    // Percent-encodes spaces and other reserved bytes in the path.
    let url = reqwest::Url::from_file_path(&resolved).map_err(|()| {
        Doc2TextError::Internal(format!("cannot express '{}' as a file URL", resolved.display()))
    })?;
    Ok(MediaReference {
        kind: MediaKind::LocalFileUrl,
        url: url.into(),
        dimensions: image::image_dimensions(&resolved).ok(),
    })
}

/// Inline a standalone image file as a data URI.
///
/// The MIME type comes from the extension, then from the leading bytes, and
/// finally falls back to [`DEFAULT_IMAGE_MIME`].
pub async fn encode_image_file(path: &Path) -> Result<MediaReference, Doc2TextError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Doc2TextError::DocumentNotFound {
                path: path.to_path_buf(),
            }
        } else {
            Doc2TextError::UnsupportedDocument {
                source_name: path.display().to_string(),
                detail: format!("unreadable: {e}"),
            }
        }
    })?;

    let mime = ImageFormat::from_path(path)
        .or_else(|_| image::guess_format(&bytes))
        .map(|f| f.to_mime_type())
        .unwrap_or(DEFAULT_IMAGE_MIME);

    let dims = image::load_from_memory(&bytes)
        .ok()
        .map(|img| (img.width(), img.height()));

    Ok(MediaReference {
        kind: MediaKind::InlineDataUri,
        url: data_uri(mime, &bytes),
        dimensions: dims,
    })
}

/// Serialise pixels in `format` and wrap them in a data URI.
pub fn inline_image(img: &DynamicImage, format: PageFormat) -> Result<String, image::ImageError> {
    let mut buf = Vec::new();
    match format {
        // JPEG has no alpha channel; pdfium hands back RGBA bitmaps.
        PageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8())
            .write_to(&mut Cursor::new(&mut buf), format.image_format())?,
        PageFormat::Png => img.write_to(&mut Cursor::new(&mut buf), format.image_format())?,
    }
    Ok(data_uri(format.mime_type(), &buf))
}

fn data_uri(mime: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
}
