//! demark - lenient HTML to Markdown Extra conversion.
//!
//! A hand-written, forgiving HTML tokenizer feeds a stack-driven
//! Markdown emitter. Structure that Markdown can express (headings,
//! emphasis, links, images, code, blockquotes, lists, tables,
//! definition lists, footnotes, abbreviations, header IDs/classes)
//! comes out as Markdown Extra; anything else is either kept as
//! verbatim HTML or unwrapped, depending on configuration. Broken
//! markup never aborts a conversion; invalid tags degrade to literal
//! text.
//!
//! # Usage
//!
//! ```rust
//! use demark::{convert, ConversionOptions};
//!
//! let markdown = convert(
//!     "<h1>Title</h1><p>Some <em>text</em>.</p>",
//!     &ConversionOptions::default(),
//! )
//! .expect("conversion succeeds");
//! assert_eq!(markdown, "# Title\n\nSome *text*.");
//! ```
//!
//! The whole engine is synchronous and pure: one in-memory string in,
//! one Markdown string out, no I/O. Converters hold no per-document
//! state, so a single [`MarkdownConverter`] can serve many documents,
//! concurrently if the host wishes.

pub mod converter;
mod entities;
pub mod error;
mod extra;
pub mod tags;
pub mod tokenizer;
mod wrap;

pub use converter::{ConversionOptions, LinkPosition, MarkdownConverter, MIN_BODY_WIDTH};
pub use error::ConversionError;

/// Convert one complete HTML string to Markdown.
///
/// Shorthand for building a [`MarkdownConverter`] with `options` and
/// converting a single document.
pub fn convert(html: &str, options: &ConversionOptions) -> Result<String, ConversionError> {
    MarkdownConverter::with_options(options.clone()).convert(html)
}
