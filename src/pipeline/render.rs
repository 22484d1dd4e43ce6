//! Rasterisation: turn a [`Document`] into a bounded, ordered list of page images.
//!
//! ## Why a `PdfRenderer` trait?
//!
//! PDF rasterisation is an external capability ("PDF bytes → ordered raster
//! images"). [`PdfiumRenderer`] is the production implementation; tests and
//! embedders can plug in their own without touching page bounding, downscaling,
//! or ordering, which all live here.
//!
//! ## Why spawn_blocking?
//!
//! pdfium wraps a C++ library with thread-local state and is CPU-bound.
//! `tokio::task::spawn_blocking` keeps it off the async worker threads, along
//! with image decoding and the Lanczos downscale, and `tokio::time::timeout`
//! bounds how long the caller waits for all of it. A timed-out
//! render keeps running on its blocking thread until pdfium returns; the
//! caller simply stops waiting.

use crate::error::Doc2TextError;
use crate::config::PageFormat;
use crate::pipeline::input::{Document, DocumentKind};
use image::imageops::FilterType;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One rasterised page.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// 1-based page number, strictly increasing within a document.
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub image: DynamicImage,
    /// Set once the page has been written to disk by [`save_pages`].
    pub path: Option<PathBuf>,
}

impl PageImage {
    pub fn new(index: usize, image: DynamicImage) -> Self {
        Self {
            index,
            width: image.width(),
            height: image.height(),
            image,
            path: None,
        }
    }
}

/// Output of a [`PdfRenderer`]: the first pages of a PDF, in order.
#[derive(Debug)]
pub struct RenderedPdf {
    /// Page count of the whole document.
    pub total_pages: usize,
    /// Rendered pages `1..=min(total_pages, max_pages)`, in order.
    pub pages: Vec<DynamicImage>,
}

/// Converts PDF bytes into raster images.
///
/// Implementations must render pages in document order and must not render
/// more than `max_pages`.
pub trait PdfRenderer: Send + Sync {
    fn render(
        &self,
        bytes: &[u8],
        password: Option<&str>,
        max_pages: usize,
    ) -> Result<RenderedPdf, Doc2TextError>;
}

/// The rasterised document plus what was left out.
#[derive(Debug)]
pub struct RasterizedDocument {
    pub pages: Vec<PageImage>,
    pub total_pages: usize,
    /// Pages beyond `max_pages` that were not rendered.
    pub dropped_pages: usize,
}

/// Options for [`rasterize`].
#[derive(Debug, Clone)]
pub struct RasterOptions {
    pub max_pages: usize,
    pub target_max_dimension: Option<u32>,
    pub password: Option<String>,
    pub timeout_secs: u64,
}

/// Rasterise a document into at most `max_pages` pages.
///
/// Single images become a one-element list. Decoding, PDF rendering and
/// downscaling all run on the blocking pool under one `timeout_secs` bound;
/// pages past `max_pages` are dropped and counted in
/// [`RasterizedDocument::dropped_pages`].
pub async fn rasterize(
    document: &Document,
    options: &RasterOptions,
    renderer: Arc<dyn PdfRenderer>,
) -> Result<RasterizedDocument, Doc2TextError> {
    let bytes = document.bytes().to_vec();
    let name = document.name();
    let is_pdf = matches!(document.kind(), DocumentKind::Pdf);
    let opts = options.clone();

    let task = tokio::task::spawn_blocking(move || {
        let raster = if is_pdf {
            render_pdf(&bytes, &name, &opts, renderer.as_ref())?
        } else {
            decode_image(&bytes, &name)?
        };
        let pages = match opts.target_max_dimension {
            Some(bound) => raster
                .pages
                .into_iter()
                .map(|p| downscale(p, bound))
                .collect(),
            None => raster.pages,
        };
        Ok::<_, Doc2TextError>(RasterizedDocument { pages, ..raster })
    });

    tokio::time::timeout(Duration::from_secs(options.timeout_secs), task)
        .await
        .map_err(|_| Doc2TextError::RasterizationFailed {
            page: None,
            detail: format!("timed out after {}s", options.timeout_secs),
        })?
        .map_err(|e| Doc2TextError::Internal(format!("Render task panicked: {}", e)))?
}

fn decode_image(bytes: &[u8], name: &str) -> Result<RasterizedDocument, Doc2TextError> {
    let img = image::load_from_memory(bytes).map_err(|e| Doc2TextError::UnsupportedDocument {
        source_name: name.to_string(),
        detail: format!("image decode failed: {e}"),
    })?;
    Ok(RasterizedDocument {
        pages: vec![PageImage::new(1, img)],
        total_pages: 1,
        dropped_pages: 0,
    })
}

fn render_pdf(
    bytes: &[u8],
    name: &str,
    options: &RasterOptions,
    renderer: &dyn PdfRenderer,
) -> Result<RasterizedDocument, Doc2TextError> {
    let max_pages = options.max_pages;
    let rendered = renderer.render(bytes, options.password.as_deref(), max_pages)?;

    let mut images = rendered.pages;
    if images.len() > max_pages {
        warn!(
            "Renderer returned {} pages for max_pages={}; extra pages ignored",
            images.len(),
            max_pages
        );
        images.truncate(max_pages);
    }

    let dropped_pages = rendered.total_pages.saturating_sub(images.len());
    if dropped_pages > 0 {
        warn!(
            "{}: {} of {} pages dropped (max_pages={})",
            name, dropped_pages, rendered.total_pages, max_pages
        );
    }
    info!(
        "Rasterised {} of {} pages from {}",
        images.len(),
        rendered.total_pages,
        name
    );

    let pages = images
        .into_iter()
        .enumerate()
        .map(|(i, img)| PageImage::new(i + 1, img))
        .collect();

    Ok(RasterizedDocument {
        pages,
        total_pages: rendered.total_pages,
        dropped_pages,
    })
}

/// Shrink a page so its longer side equals `bound`, preserving aspect ratio.
///
/// Pages already within the bound are returned untouched.
pub fn downscale(page: PageImage, bound: u32) -> PageImage {
    if page.width <= bound && page.height <= bound {
        return page;
    }
    let resized = page.image.resize(bound, bound, FilterType::Lanczos3);
    debug!(
        "Page {}: downscaled {}x{} → {}x{}",
        page.index,
        page.width,
        page.height,
        resized.width(),
        resized.height()
    );
    PageImage {
        width: resized.width(),
        height: resized.height(),
        image: resized,
        ..page
    }
}

/// Write pages to `dir` as `page_<n>.<ext>` and record each file path.
///
/// Creates `dir` if needed. Existing files with the same names are replaced.
pub fn save_pages(
    pages: &mut [PageImage],
    dir: &Path,
    format: PageFormat,
) -> Result<(), Doc2TextError> {
    std::fs::create_dir_all(dir).map_err(|source| Doc2TextError::WriteFailed {
        path: dir.to_path_buf(),
        source,
    })?;

    for page in pages.iter_mut() {
        let path = dir.join(format!("page_{}.{}", page.index, format.extension()));
        let result = match format {
            // JPEG has no alpha channel; pdfium hands back RGBA bitmaps.
            PageFormat::Jpeg => DynamicImage::ImageRgb8(page.image.to_rgb8())
                .save_with_format(&path, format.image_format()),
            PageFormat::Png => page.image.save_with_format(&path, format.image_format()),
        };
        result.map_err(|e| Doc2TextError::EncodingFailed {
            page: page.index,
            detail: format!("saving {}: {e}", path.display()),
        })?;
        debug!("Saved page {} → {}", page.index, path.display());
        page.path = Some(path);
    }

    Ok(())
}

// ── pdfium ───────────────────────────────────────────────────────────────

/// [`PdfRenderer`] backed by the pdfium library.
#[derive(Debug, Clone)]
pub struct PdfiumRenderer {
    /// Directory holding the pdfium shared library; `None` uses the system library.
    pub library_dir: Option<PathBuf>,
    /// Longest rendered edge in pixels.
    pub max_pixels: u32,
}

impl PdfiumRenderer {
    pub fn new(max_pixels: u32) -> Self {
        Self {
            library_dir: std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from),
            max_pixels,
        }
    }

    fn bind(&self) -> Result<Pdfium, Doc2TextError> {
        let bindings = match &self.library_dir {
            Some(dir) => {
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir))
            }
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| Doc2TextError::RasterizationFailed {
            page: None,
            detail: format!(
                "could not load the pdfium library ({e:?}); set PDFIUM_LIB_PATH to the directory containing it"
            ),
        })?;
        Ok(Pdfium::new(bindings))
    }
}

impl PdfRenderer for PdfiumRenderer {
    fn render(
        &self,
        bytes: &[u8],
        password: Option<&str>,
        max_pages: usize,
    ) -> Result<RenderedPdf, Doc2TextError> {
        let pdfium = self.bind()?;

        let document = pdfium.load_pdf_from_byte_slice(bytes, password).map_err(|e| {
            let err_str = format!("{:?}", e);
            if err_str.contains("Password") || err_str.contains("password") {
                if password.is_some() {
                    Doc2TextError::WrongPassword {
                        source_name: "pdf".into(),
                    }
                } else {
                    Doc2TextError::PasswordRequired {
                        source_name: "pdf".into(),
                    }
                }
            } else {
                Doc2TextError::UnsupportedDocument {
                    source_name: "pdf".into(),
                    detail: err_str,
                }
            }
        })?;

        let pages = document.pages();
        let total_pages = pages.len() as usize;
        let wanted = total_pages.min(max_pages);
        debug!("PDF loaded: {} pages, rendering {}", total_pages, wanted);

        let render_config = PdfRenderConfig::new()
            .set_target_width(self.max_pixels as i32)
            .set_maximum_height(self.max_pixels as i32);

        let mut images = Vec::with_capacity(wanted);
        for idx in 0..wanted {
            let page = pages
                .get(idx as u16)
                .map_err(|e| Doc2TextError::RasterizationFailed {
                    page: Some(idx + 1),
                    detail: format!("{:?}", e),
                })?;

            let bitmap = page.render_with_config(&render_config).map_err(|e| {
                Doc2TextError::RasterizationFailed {
                    page: Some(idx + 1),
                    detail: format!("{:?}", e),
                }
            })?;

            let image = bitmap.as_image();
            debug!(
                "Rendered page {} → {}x{} px",
                idx + 1,
                image.width(),
                image.height()
            );
            images.push(image);
        }

        Ok(RenderedPdf {
            total_pages,
            pages: images,
        })
    }
}
