//! Error types for conversion operations

use thiserror::Error;

/// Errors that can occur during HTML to Markdown conversion.
///
/// Malformed tag syntax is *not* an error: the tokenizer escapes the
/// offending `<` and carries on. The variants here are structural
/// invariant violations inside the emitter, which abort the whole
/// `convert` call; there is no partial output.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// A tag handler broke an emission invariant (popped an empty
    /// buffer, unstacked from an empty per-tag attribute stack, ...).
    #[error("structural defect while converting <{tag}>: {detail}")]
    StructuralDefect { tag: String, detail: String },

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}
