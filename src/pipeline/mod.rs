//! Pipeline stages for document extraction.
//!
//! Each submodule implements exactly one transformation step.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ encode (+ sandbox) ──▶ prompt ──▶ backend ──▶ postprocess
//! (path/URL) (pages)    (file:// | data:)     (messages)              (optional)
//! ```
//!
//! 1. [`input`]: read the document bytes once and decide its kind
//! 2. [`render`]: produce a bounded, ordered list of page images; PDF
//!    rendering runs in `spawn_blocking` because pdfium is not async-safe
//! 3. [`sandbox`]: refuse any local path outside the allowed media root
//! 4. [`encode`]: turn a page into a `file://` or `data:` reference
//! 5. [`prompt`]: build the ordered multimodal message list
//! 6. [`postprocess`]: optional cleanup of fenced model output

pub mod encode;
pub mod input;
pub mod postprocess;
pub mod prompt;
pub mod render;
pub mod sandbox;
