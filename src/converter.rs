//! Markdown converter - transforms the token stream into Markdown.
//!
//! The converter consumes nodes from the [`Tokenizer`] one at a time
//! and drives a stack-based emitter. Its state is deliberately
//! explicit:
//!
//! - **output / buffer stack**: writes go to the live output unless a
//!   buffer is open; buffers capture content whose wrapping markup is
//!   not yet known (link text before the reference style is decided,
//!   table cells before column widths exist). Pushes and pops must
//!   balance by end of document.
//! - **indent string**: block handlers append an indent token on
//!   start and strip the same token on end (`"> "` for blockquotes,
//!   four spaces for list bodies).
//! - **pending line breaks**: handlers request "at least N blank
//!   lines before the next content"; requests max together and are
//!   flushed right before the next write.
//! - **per-tag attribute stacks**: nested open instances of a tag
//!   push their parsed attributes so the matching close can recover
//!   them without a tree.
//! - **skip-conversion mode**: subtrees that cannot be converted are
//!   re-serialized verbatim (when raw HTML is kept) or unwrapped.
//!
//! Conversion is a pure function of the input string and options; a
//! fresh [`Conversion`] is built per call and no state survives it.

use std::collections::HashMap;
use std::sync::OnceLock;

use log::{trace, warn};
use regex::{Captures, Regex};

use crate::entities;
use crate::error::ConversionError;
use crate::extra::{self, TableState};
use crate::tags;
use crate::tags::AttrRequirement;
use crate::tokenizer::{Attributes, Node, NodeKind, Tokenizer};
use crate::wrap;

/// Where reference-style link definitions are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkPosition {
    /// All definitions once, at the end of the document.
    #[default]
    AfterContent,
    /// Pending definitions after every top-level block.
    AfterParagraph,
    /// No definitions; links are written inline.
    Inline,
}

/// Body widths at or below this floor disable wrapping entirely.
pub const MIN_BODY_WIDTH: usize = 25;

/// Conversion options.
#[derive(Debug, Clone)]
pub struct ConversionOptions {
    /// Keep HTML tags which cannot be converted to Markdown; when off,
    /// unconvertible tags are unwrapped and their children still
    /// processed.
    pub keep_html: bool,
    /// Wrap output at this column; `None` (or any value at or below
    /// [`MIN_BODY_WIDTH`]) disables wrapping.
    pub body_width: Option<usize>,
    /// Placement of reference-style link definitions.
    pub link_position: LinkPosition,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            keep_html: true,
            body_width: None,
            link_position: LinkPosition::AfterContent,
        }
    }
}

/// Stateless conversion handle.
///
/// Holds only options; every [`convert`](MarkdownConverter::convert)
/// call builds an independent [`Conversion`], so one converter may be
/// shared across documents (and threads) freely.
pub struct MarkdownConverter {
    options: ConversionOptions,
}

impl MarkdownConverter {
    /// Create a converter with default options (keep HTML, no
    /// wrapping, link definitions after the content).
    pub fn new() -> Self {
        Self {
            options: ConversionOptions::default(),
        }
    }

    /// Create a converter with custom options.
    pub fn with_options(options: ConversionOptions) -> Self {
        Self { options }
    }

    /// Convert one complete HTML string to Markdown.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError`] when an emitter invariant is broken;
    /// malformed markup is not an error and degrades to literal text.
    pub fn convert(&self, html: &str) -> Result<String, ConversionError> {
        let prepared = strip_dropped_tags(html);
        let prepared = extra::rewrite_footnote_idioms(&prepared);
        Conversion::new(&self.options, prepared).run()
    }
}

impl Default for MarkdownConverter {
    fn default() -> Self {
        Self::new()
    }
}

/// A deduplicated link reference.
#[derive(Debug, Clone)]
pub(crate) struct Footnote {
    pub(crate) href: String,
    pub(crate) title: Option<String>,
    pub(crate) link_id: usize,
    pub(crate) emitted: bool,
}

/// Per-tag stack entry: the parsed attributes plus whatever the
/// handler recorded at open time for use at close time.
#[derive(Debug, Clone, Default)]
pub(crate) struct StackedAttrs {
    pub(crate) attrs: Attributes,
    pub(crate) css_selector: String,
    /// Running item counter for ordered lists.
    pub(crate) item_count: usize,
    /// Buffered inner text for abbreviations.
    pub(crate) text: String,
    /// Definition line already written (abbreviations).
    pub(crate) emitted: bool,
}

/// Per-document emitter state. Built fresh for every `convert` call.
pub(crate) struct Conversion {
    pub(crate) tokenizer: Tokenizer,
    pub(crate) keep_html: bool,
    body_width: Option<usize>,
    link_position: LinkPosition,
    pub(crate) output: String,
    buffers: Vec<String>,
    pub(crate) indent: String,
    line_breaks: usize,
    footnotes: Vec<Footnote>,
    pub(crate) tag_stacks: HashMap<String, Vec<StackedAttrs>>,
    not_converted: Vec<String>,
    skip_conversion: Option<String>,
    last_was_block_tag: bool,
    last_closed_tag: String,
    /// Indent suspended while a passthrough `<pre>` is open.
    saved_pre_indent: String,
    pub(crate) table: Option<TableState>,
    pub(crate) col: isize,
    pub(crate) row: usize,
}

impl Conversion {
    pub(crate) fn new(options: &ConversionOptions, html: String) -> Self {
        let mut tokenizer = Tokenizer::new(html);
        tokenizer.no_tags_in_code = true;
        Conversion {
            tokenizer,
            keep_html: options.keep_html,
            body_width: options.body_width.filter(|w| *w > MIN_BODY_WIDTH),
            link_position: options.link_position,
            output: String::new(),
            buffers: Vec::new(),
            indent: String::new(),
            line_breaks: 0,
            footnotes: Vec::new(),
            tag_stacks: HashMap::new(),
            not_converted: Vec::new(),
            skip_conversion: None,
            last_was_block_tag: false,
            last_closed_tag: String::new(),
            saved_pre_indent: String::new(),
            table: None,
            col: -1,
            row: 0,
        }
    }

    /// Main loop: pull nodes and dispatch until end of input.
    pub(crate) fn run(&mut self) -> Result<String, ConversionError> {
        while let Some(node) = self.tokenizer.next_node() {
            match node.kind {
                NodeKind::Doctype => {}
                NodeKind::Comment | NodeKind::ProcessingInstruction => {
                    if self.keep_html {
                        self.flush_line_breaks();
                        self.out(&node.raw, false);
                        self.set_line_breaks(2);
                    }
                }
                NodeKind::Text => self.handle_text(&node),
                NodeKind::Tag => self.handle_tag(&node)?,
            }
            self.last_was_block_tag =
                node.kind == NodeKind::Tag && node.is_start && node.is_block;
        }
        self.finish()
    }

    /// End-of-document pass: drain leaked buffers, restore escaped
    /// ampersands and angle brackets, trim, flush deferred references.
    fn finish(&mut self) -> Result<String, ConversionError> {
        if !self.buffers.is_empty() {
            warn!(
                "draining {} unbalanced output buffer(s) at end of document",
                self.buffers.len()
            );
            while let Some(buf) = self.buffers.pop() {
                self.out(&buf, false);
            }
        }
        self.output = self
            .output
            .replace("&gt;", ">")
            .replace("&lt;", "<")
            .replace("&amp;", "&");
        let trimmed = self.output.trim_end().len();
        self.output.truncate(trimmed);
        self.flush_footnotes();
        self.flush_deferred_abbreviations();
        Ok(std::mem::take(&mut self.output))
    }

    fn handle_tag(&mut self, node: &Node) -> Result<(), ConversionError> {
        if tags::is_ignored(&node.name) {
            return Ok(());
        }
        if node.is_start {
            self.flush_line_breaks();
        }
        if self.skip_conversion.is_some() {
            self.is_markdownable(node); // keeps the not-converted stack in step
            self.handle_tag_to_text(node);
            return Ok(());
        }
        if self.tokenizer.keep_whitespace() == 0 && node.is_block && node.is_start {
            self.tokenizer.trim_remaining_start();
        }
        if self.is_markdownable(node) {
            if node.is_block && node.is_start && !self.last_was_block_tag && !self.output.is_empty()
            {
                // separate a block start from preceding inline content
                let sep = format!("\n{}", self.indent);
                let target = match self.buffers.last_mut() {
                    Some(buf) => buf,
                    None => &mut self.output,
                };
                if !target.ends_with(&sep) {
                    target.push_str(&sep);
                }
            }
            self.dispatch(node)?;
            if self.link_position == LinkPosition::AfterParagraph
                && node.is_block
                && !node.is_start
                && self.tokenizer.open_tags().is_empty()
            {
                self.flush_footnotes();
            }
            if !node.is_start {
                self.last_closed_tag.clear();
                self.last_closed_tag.push_str(&node.name);
            }
        } else {
            self.handle_tag_to_text(node);
            self.last_closed_tag.clear();
        }
        Ok(())
    }

    /// Convertibility check for the current tag.
    ///
    /// Start tags are checked against the markdownable registry: every
    /// present attribute must be allowed (only enforced while raw HTML
    /// is kept) and every required attribute present. A failing start
    /// tag pushes a `tag::open-path` marker; the matching end tag pops
    /// it instead of re-checking, keeping start/end handling symmetric.
    fn is_markdownable(&mut self, node: &Node) -> bool {
        let Some(rules) = tags::attr_rules(&node.name) else {
            return false;
        };
        if node.is_start {
            let mut convertible = true;
            if self.keep_html {
                convertible = node
                    .attributes
                    .iter()
                    .all(|(name, _)| rules.iter().any(|r| r.name == name));
            }
            if convertible {
                convertible = rules
                    .iter()
                    .filter(|r| r.requirement == AttrRequirement::Required)
                    .all(|r| node.attributes.contains(r.name));
            }
            if !convertible {
                let key = self.tag_path_key(&node.name);
                self.not_converted.push(key);
            }
            convertible
        } else {
            let key = self.tag_path_key(&node.name);
            if self.not_converted.last() == Some(&key) {
                self.not_converted.pop();
                false
            } else {
                true
            }
        }
    }

    fn tag_path_key(&self, name: &str) -> String {
        format!("{}::{}", name, self.tokenizer.open_tags().join("/"))
    }

    /// Pass a non-convertible tag through verbatim (or drop it when raw
    /// HTML is not kept, requesting paragraph spacing for blocks).
    pub(crate) fn handle_tag_to_text(&mut self, node: &Node) {
        if !self.keep_html {
            if !node.is_start && node.is_block {
                self.set_line_breaks(2);
            }
            return;
        }
        if !node.is_empty {
            if node.is_start {
                if self.skip_conversion.is_none() {
                    let key = self.tag_path_key(&node.name);
                    trace!("entering verbatim passthrough at {key}");
                    self.skip_conversion = Some(key);
                }
            } else {
                let key = self.tag_path_key(&node.name);
                if self.skip_conversion.as_deref() == Some(key.as_str()) {
                    trace!("leaving verbatim passthrough at {key}");
                    self.skip_conversion = None;
                }
            }
        }
        if node.is_block {
            if node.is_start {
                if matches!(self.tokenizer.parent(), Some("ins") | Some("del")) {
                    // ins/del carrying block content render as blocks
                    self.out("\n", true);
                    self.apply_indent(node, "  ", true);
                }
                if node.name != "pre" {
                    let piece = format!("{}\n{}", node.raw, self.indent);
                    self.out(&piece, false);
                    if !node.is_empty {
                        self.apply_indent(node, "  ", true);
                    } else {
                        self.set_line_breaks(1);
                    }
                    self.tokenizer.trim_remaining_start();
                } else {
                    // don't indent inside passthrough <pre>
                    self.out(&node.raw, false);
                    self.saved_pre_indent = std::mem::take(&mut self.indent);
                }
            } else {
                if self.tokenizer.keep_whitespace() == 0 {
                    let trimmed = self.output.trim_end().len();
                    self.output.truncate(trimmed);
                }
                if node.name != "pre" {
                    self.apply_indent(node, "  ", true);
                    let piece = format!("\n{}{}", self.indent, node.raw);
                    self.out(&piece, false);
                } else {
                    self.out(&node.raw, false);
                    self.indent = std::mem::take(&mut self.saved_pre_indent);
                }
                if matches!(self.tokenizer.parent(), Some("ins") | Some("del")) {
                    self.out("\n", false);
                    self.apply_indent(node, "  ", true);
                }
                if node.name == "li" {
                    self.set_line_breaks(1);
                } else {
                    self.set_line_breaks(2);
                }
            }
        } else {
            self.out(&node.raw, false);
        }
        if matches!(node.name.as_str(), "code" | "pre") {
            // double-escape so the final cleanup leaves passthrough
            // code content entity-escaped
            if node.is_start {
                self.push_buffer();
            } else {
                let buf = self.buffers.pop().unwrap_or_else(|| {
                    warn!("passthrough <{}> closed without an open buffer", node.name);
                    String::new()
                });
                let escaped = buf.replace("&lt;", "&amp;lt;").replace("&gt;", "&amp;gt;");
                self.out(&escaped, false);
            }
        }
    }

    fn handle_text(&mut self, node: &Node) {
        let mut text = node.raw.clone();
        if self.tokenizer.has_parent("pre") && text.contains('\n') {
            let continuation = format!("\n{}", self.indent);
            text = text.replace('\n', &continuation);
        }
        if !self.tokenizer.has_parent("code") && !self.tokenizer.has_parent("pre") {
            text = entities::decode_entities(&text);
            if self.skip_conversion.is_none() {
                text = escape_markdown_text(&text);
            }
        } else {
            text = entities::decode_quote_entities(&text);
        }
        if !text.is_empty() {
            self.flush_line_breaks();
        }
        self.out(&text, false);
        self.last_closed_tag.clear();
    }

    /// Per-tag handler dispatch over the markdownable registry.
    fn dispatch(&mut self, node: &Node) -> Result<(), ConversionError> {
        match node.name.as_str() {
            "h1" => self.handle_heading(node, 1),
            "h2" => self.handle_heading(node, 2),
            "h3" => self.handle_heading(node, 3),
            "h4" => self.handle_heading(node, 4),
            "h5" => self.handle_heading(node, 5),
            "h6" => self.handle_heading(node, 6),
            "p" => {
                if !node.is_start {
                    self.set_line_breaks(2);
                }
                Ok(())
            }
            "em" | "i" => {
                self.out("*", true);
                Ok(())
            }
            "strong" | "b" => {
                self.out("**", true);
                Ok(())
            }
            "a" => self.handle_anchor(node),
            "img" => self.handle_image(node),
            "code" => self.handle_inline_code(node),
            "pre" => self.handle_pre(node),
            "blockquote" => {
                self.apply_indent(node, "> ", true);
                Ok(())
            }
            "ul" | "ol" => self.handle_list(node),
            "li" => self.handle_list_item(node),
            "hr" => self.handle_horizontal_rule(node),
            "br" => self.handle_line_break(node),
            "table" => self.handle_table(node),
            "tr" => self.handle_table_row(node),
            "td" => self.handle_table_cell(node),
            "th" => self.handle_table_header_cell(node),
            "dl" => self.handle_definition_list(node),
            "dt" => self.handle_definition_term(node),
            "dd" => self.handle_definition_description(node),
            "abbr" => self.handle_abbreviation(node),
            "fnref" => self.handle_footnote_ref(node),
            "fn" => self.handle_footnote_def(node),
            "footnotes" => self.handle_footnote_block(node),
            other => Err(ConversionError::Internal(format!(
                "no handler for markdownable tag <{other}>"
            ))),
        }
    }

    fn handle_heading(&mut self, node: &Node, level: usize) -> Result<(), ConversionError> {
        if node.is_start {
            let entry = StackedAttrs {
                attrs: node.attributes.clone(),
                css_selector: extra::css_selector_of(&node.attributes),
                ..Default::default()
            };
            self.stack(&node.name, entry);
            let marker = format!("{} ", "#".repeat(level));
            self.out(&marker, true);
        } else {
            let entry = self.unstack(&node.name)?;
            if !entry.css_selector.is_empty() {
                let suffix = format!(" {{{}}}", entry.css_selector);
                self.out(&suffix, false);
            }
            self.set_line_breaks(2);
        }
        Ok(())
    }

    fn handle_anchor(&mut self, node: &Node) -> Result<(), ConversionError> {
        if node.is_start {
            self.push_buffer();
            let mut attrs = node.attributes.clone();
            let href = entities::decode_entities(attrs.get("href").unwrap_or("").trim());
            attrs.set("href", href);
            if let Some(title) = node.attributes.get("title") {
                attrs.set("title", entities::decode_entities(title));
            }
            let entry = StackedAttrs {
                css_selector: extra::css_selector_of(&node.attributes),
                attrs,
                ..Default::default()
            };
            self.stack("a", entry);
        } else {
            let entry = self.unstack("a")?;
            let buffer = self.pop_buffer("a")?;
            let link = self.anchor_markdown(&entry, &buffer);
            self.out(&link, true);
        }
        Ok(())
    }

    fn anchor_markdown(&mut self, entry: &StackedAttrs, buffer: &str) -> String {
        let mut md = self.anchor_link_markdown(entry, buffer);
        if !entry.css_selector.is_empty() {
            md.push('{');
            md.push_str(&entry.css_selector);
            md.push('}');
        }
        md
    }

    fn anchor_link_markdown(&mut self, entry: &StackedAttrs, buffer: &str) -> String {
        let href = entry.attrs.get("href").unwrap_or("").to_string();
        let title = entry.attrs.get("title").map(str::to_string);

        if href.is_empty() && title.as_deref().unwrap_or("").is_empty() {
            // empty links exist in the wild; keep the text visible
            return format!("[{buffer}]()");
        }
        if buffer == href && title.as_deref().unwrap_or("").is_empty() {
            return format!("<{buffer}>");
        }

        let decoded = entities::decode_entities(buffer.trim());
        let mut href = href;
        if let Some(local) = href.strip_prefix("mailto:")
            && local == decoded
        {
            if title.is_none() {
                return format!("<{decoded}>");
            }
            href = format!("mailto:{decoded}");
        }

        if self.link_position == LinkPosition::Inline {
            return format!("[{buffer}]({})", link_reference(&href, title.as_deref()));
        }
        let id = self.register_footnote(&href, title.as_deref());
        format!("[{buffer}][{id}]")
    }

    fn handle_image(&mut self, node: &Node) -> Result<(), ConversionError> {
        if !node.is_start {
            return Ok(()); // images are empty tags
        }
        let title = node
            .attributes
            .get("title")
            .map(entities::decode_entities);
        let alt = node
            .attributes
            .get("alt")
            .map(entities::decode_entities)
            .unwrap_or_default();
        let src = node.attributes.get("src").unwrap_or("");

        if src.is_empty() {
            let spaced_title = match title.as_deref() {
                Some(t) if !t.is_empty() => format!(" {t} "),
                _ => String::new(),
            };
            let md = format!("![{alt}]({spaced_title})");
            self.out(&md, true);
            return Ok(());
        }
        let src = entities::decode_entities(src);

        let md = if self.link_position == LinkPosition::Inline {
            match title.as_deref() {
                Some(t) if !t.is_empty() => format!("![{alt}]({src} \"{t}\")"),
                _ => format!("![{alt}]({src})"),
            }
        } else {
            let id = self.register_footnote(&src, title.as_deref());
            format!("![{alt}][{id}]")
        };
        self.out(&md, true);
        Ok(())
    }

    fn handle_inline_code(&mut self, node: &Node) -> Result<(), ConversionError> {
        if self.tokenizer.has_parent("pre") {
            // code blocks inside <pre> are handled by the pre handler
            return Ok(());
        }
        if node.is_start {
            self.push_buffer();
        } else {
            let buffer = self.pop_buffer("code")?;
            let fence = "`".repeat(shortest_absent_backtick_run(&buffer));
            let padded = if buffer.starts_with('`') || buffer.ends_with('`') {
                format!(" {buffer} ")
            } else {
                buffer
            };
            let md = format!("{fence}{padded}{fence}");
            self.out(&md, true);
        }
        Ok(())
    }

    fn handle_pre(&mut self, node: &Node) -> Result<(), ConversionError> {
        if self.keep_html && node.is_start {
            // only <pre><code> maps to a Markdown code block
            static BARE_CODE: OnceLock<Regex> = OnceLock::new();
            let re = BARE_CODE
                .get_or_init(|| Regex::new(r"^\s*<code\s*>").expect("pre lookahead compiles"));
            if !re.is_match(self.tokenizer.remaining()) {
                self.handle_tag_to_text(node);
                return Ok(());
            }
        }
        self.apply_indent(node, "    ", true);
        if node.is_start {
            self.tokenizer.trim_remaining_start();
        } else {
            self.set_line_breaks(2);
        }
        Ok(())
    }

    fn handle_list(&mut self, node: &Node) -> Result<(), ConversionError> {
        if node.is_start {
            self.stack(
                &node.name,
                StackedAttrs {
                    attrs: node.attributes.clone(),
                    ..Default::default()
                },
            );
            if !self.keep_html && self.last_closed_tag == node.name {
                // comment separator keeps adjacent lists apart
                let sep = format!(
                    "\n{0}<!-- -->\n{0}\n{0}",
                    self.indent
                );
                self.out(&sep, false);
            }
        } else {
            self.unstack(&node.name)?;
            static BLOCK_FOLLOWS: OnceLock<Regex> = OnceLock::new();
            let re = BLOCK_FOLLOWS.get_or_init(|| {
                Regex::new(r"^\s*(?:</li\s*>\s*<li\s*>\s*)?<(?:p|blockquote)\s*>")
                    .expect("list lookahead compiles")
            });
            if self.tokenizer.parent() != Some("li") || re.is_match(self.tokenizer.remaining()) {
                // don't make renderers add unneeded paragraphs
                self.set_line_breaks(2);
            }
        }
        Ok(())
    }

    fn handle_list_item(&mut self, node: &Node) -> Result<(), ConversionError> {
        if self.tokenizer.parent() == Some("ol") {
            if node.is_start {
                let entry = self.stacked_top_mut("ol").ok_or_else(|| {
                    ConversionError::StructuralDefect {
                        tag: "ol".to_string(),
                        detail: "list item without a stacked list".to_string(),
                    }
                })?;
                entry.item_count += 1;
                let marker = format!("{}.", entry.item_count);
                let padded = format!(
                    "{marker}{}",
                    " ".repeat(4usize.saturating_sub(marker.len()))
                );
                self.out(&padded, true);
            }
            self.apply_indent(node, "    ", false);
        } else {
            if node.is_start {
                self.out("*   ", true);
            }
            self.apply_indent(node, "    ", false);
        }
        if !node.is_start {
            self.set_line_breaks(1);
        }
        Ok(())
    }

    fn handle_horizontal_rule(&mut self, node: &Node) -> Result<(), ConversionError> {
        if !node.is_start {
            return Ok(());
        }
        self.out("* * *", true);
        self.set_line_breaks(2);
        Ok(())
    }

    fn handle_line_break(&mut self, _node: &Node) -> Result<(), ConversionError> {
        let piece = format!("  \n{}", self.indent);
        self.out(&piece, true);
        self.tokenizer.trim_remaining_start();
        Ok(())
    }

    // ----- emitter primitives -----

    /// Append to the innermost open buffer, or the live output.
    ///
    /// With a body width configured, `nowrap` fragments are moved whole
    /// to a fresh indented line when they would overflow; wrapped
    /// writes re-flow at token boundaries.
    pub(crate) fn out(&mut self, put: &str, nowrap: bool) {
        if put.is_empty() {
            return;
        }
        if let Some(buf) = self.buffers.last_mut() {
            buf.push_str(put);
            return;
        }
        let width = match self.body_width {
            Some(w) if self.tokenizer.keep_whitespace() == 0 => w,
            _ => {
                self.output.push_str(put);
                return;
            }
        };
        if nowrap {
            let line_width = wrap::display_width(wrap::last_line(&self.output));
            if !put.starts_with('\n') && line_width + wrap::display_width(put) > width {
                self.output.push('\n');
                self.output.push_str(&self.indent);
            }
            self.output.push_str(put);
            return;
        }
        self.wrap_append(put, width);
    }

    /// Token-boundary wrapping: a token never splits, a single token
    /// longer than the width overflows uncut, continuation lines get
    /// the current indent.
    fn wrap_append(&mut self, put: &str, width: usize) {
        let indent_width = wrap::display_width(&self.indent);
        for (i, seg) in put.split('\n').enumerate() {
            if i > 0 {
                self.output.push('\n');
            }
            let mut line_len = wrap::display_width(wrap::last_line(&self.output));
            let mut first = true;
            let starts_spaced = seg.starts_with(' ');
            for word in seg.split_whitespace() {
                let word_len = wrap::display_width(word);
                let need_sep = if first {
                    starts_spaced && !self.output.is_empty() && !self.output.ends_with([' ', '\n'])
                } else {
                    true
                };
                let sep = usize::from(need_sep);
                if line_len + sep + word_len > width && line_len > indent_width {
                    while self.output.ends_with(' ') {
                        self.output.pop();
                    }
                    self.output.push('\n');
                    self.output.push_str(&self.indent);
                    line_len = indent_width;
                } else if need_sep {
                    self.output.push(' ');
                    line_len += 1;
                }
                self.output.push_str(word);
                line_len += word_len;
                first = false;
            }
            if seg.ends_with(' ') && !self.output.ends_with([' ', '\n']) {
                self.output.push(' ');
            }
        }
    }

    pub(crate) fn push_buffer(&mut self) {
        self.buffers.push(String::new());
    }

    pub(crate) fn pop_buffer(&mut self, tag: &str) -> Result<String, ConversionError> {
        self.buffers
            .pop()
            .ok_or_else(|| ConversionError::StructuralDefect {
                tag: tag.to_string(),
                detail: "popped an empty buffer stack".to_string(),
            })
    }

    /// Grow the indent (start tags) or strip the same token (end tags).
    pub(crate) fn apply_indent(&mut self, node: &Node, token: &str, emit: bool) {
        if node.is_start {
            self.indent.push_str(token);
            if emit {
                self.out(token, true);
            }
        } else {
            let new_len = self.indent.len().saturating_sub(token.len());
            self.indent.truncate(new_len);
        }
    }

    /// Request at least `n` blank lines before the next content.
    pub(crate) fn set_line_breaks(&mut self, n: usize) {
        if self.line_breaks < n {
            self.line_breaks = n;
        }
    }

    pub(crate) fn flush_line_breaks(&mut self) {
        if self.line_breaks > 0 && !self.output.is_empty() {
            let unit = format!("\n{}", self.indent);
            let breaks = unit.repeat(self.line_breaks);
            self.out(&breaks, true);
        }
        self.line_breaks = 0;
    }

    pub(crate) fn stack(&mut self, name: &str, entry: StackedAttrs) {
        self.tag_stacks.entry(name.to_string()).or_default().push(entry);
    }

    pub(crate) fn unstack(&mut self, name: &str) -> Result<StackedAttrs, ConversionError> {
        self.tag_stacks
            .get_mut(name)
            .and_then(Vec::pop)
            .ok_or_else(|| ConversionError::StructuralDefect {
                tag: name.to_string(),
                detail: "unstacked from an empty attribute stack".to_string(),
            })
    }

    pub(crate) fn stacked_top_mut(&mut self, name: &str) -> Option<&mut StackedAttrs> {
        self.tag_stacks.get_mut(name).and_then(|v| v.last_mut())
    }

    /// Dedup a link target into a numbered reference.
    pub(crate) fn register_footnote(&mut self, href: &str, title: Option<&str>) -> usize {
        if let Some(existing) = self
            .footnotes
            .iter()
            .find(|f| f.href == href && f.title.as_deref() == title)
        {
            return existing.link_id;
        }
        let link_id = self.footnotes.len() + 1;
        self.footnotes.push(Footnote {
            href: href.to_string(),
            title: title.map(str::to_string),
            link_id,
            emitted: false,
        });
        link_id
    }

    /// Write pending reference definitions, each exactly once, in
    /// assignment order.
    pub(crate) fn flush_footnotes(&mut self) {
        let mut first = true;
        for i in 0..self.footnotes.len() {
            if self.footnotes[i].emitted {
                continue;
            }
            self.footnotes[i].emitted = true;
            let line = format!(
                " [{}]: {}",
                self.footnotes[i].link_id,
                link_reference(
                    &self.footnotes[i].href,
                    self.footnotes[i].title.as_deref()
                )
            );
            if first {
                self.out("\n\n", true);
                first = false;
            } else {
                self.out("\n", true);
            }
            self.out(&line, true);
        }
    }
}

fn link_reference(href: &str, title: Option<&str>) -> String {
    match title {
        Some(t) => format!("{href} \"{t}\""),
        None => href.to_string(),
    }
}

/// Shortest backtick run length not occurring in `s`, for a fence that
/// cannot collide with the content.
fn shortest_absent_backtick_run(s: &str) -> usize {
    let mut present = Vec::new();
    let mut run = 0usize;
    for ch in s.chars() {
        if ch == '`' {
            run += 1;
        } else {
            if run > 0 {
                present.push(run);
            }
            run = 0;
        }
    }
    if run > 0 {
        present.push(run);
    }
    let mut len = 1;
    while present.contains(&len) {
        len += 1;
    }
    len
}

/// Delete the subtrees of dropped tags before tokenizing.
pub(crate) fn strip_dropped_tags(html: &str) -> String {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        tags::DROP_TAGS
            .iter()
            .map(|tag| {
                Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>"))
                    .expect("drop-tag pattern compiles")
            })
            .collect()
    });
    let mut out = html.to_string();
    for re in patterns {
        if re.is_match(&out) {
            out = re.replace_all(&out, "").into_owned();
        }
    }
    out
}

struct EscapeRules {
    strong_asterisk: Regex,
    em_asterisk: Regex,
    strong_underscore: Regex,
    em_underscore: Regex,
    horizontal_rules: [Regex; 3],
    backtick: Regex,
    link_paren: Regex,
    link_ref: Regex,
    header: Regex,
}

fn escape_rules() -> &'static EscapeRules {
    static RULES: OnceLock<EscapeRules> = OnceLock::new();
    RULES.get_or_init(|| {
        let compile = |p: &str| Regex::new(p).expect("escape pattern compiles");
        EscapeRules {
            strong_asterisk: compile(r"\*\*([^*]+)\*\*"),
            em_asterisk: compile(r"\*([^*]+)\*"),
            strong_underscore: compile(r"__([^_]+)__"),
            em_underscore: compile(r"_([^_]+)_"),
            horizontal_rules: [
                compile(r"-(?:[ ]{0,2}-){2,}"),
                compile(r"\*(?:[ ]{0,2}\*){2,}"),
                compile(r"_(?:[ ]{0,2}_){2,}"),
            ],
            backtick: compile("`"),
            link_paren: compile(r"\[(.+?)\](\s*\()"),
            link_ref: compile(r"\[(.+?)\](\s*)\[(.*?)\]"),
            header: compile(r"^#(#{0,5}) "),
        }
    })
}

/// Escape Markdown-significant runs in plain text so literal asterisks,
/// backticks, brackets and rule-like dashes survive rendering.
fn escape_markdown_text(text: &str) -> String {
    let rules = escape_rules();
    let mut t = replace_unescaped(&rules.strong_asterisk, text, |c| {
        Some(format!(r"\*\*{}\*\*", &c[1]))
    });
    t = replace_unescaped(&rules.em_asterisk, &t, |c| Some(format!(r"\*{}\*", &c[1])));
    t = replace_unescaped(&rules.strong_underscore, &t, |c| {
        let inner = &c[1];
        if inner.starts_with(' ') {
            None
        } else {
            Some(format!(r"\_\_{inner}\_\_"))
        }
    });
    t = replace_unescaped(&rules.em_underscore, &t, |c| {
        let inner = &c[1];
        if inner.starts_with(' ') {
            None
        } else {
            Some(format!(r"\_{inner}\_"))
        }
    });
    for re in &rules.horizontal_rules {
        t = replace_unescaped(re, &t, |c| Some(format!(r"\{}", &c[0])));
    }
    t = replace_unescaped(&rules.backtick, &t, |_| Some(r"\`".to_string()));
    t = replace_unescaped(&rules.link_paren, &t, |c| {
        Some(format!(r"\[{}\]{}", &c[1], &c[2]))
    });
    t = replace_unescaped(&rules.link_ref, &t, |c| {
        Some(format!(r"\[{}\]{}\[{}\]", &c[1], &c[2], &c[3]))
    });
    t = replace_unescaped(&rules.header, &t, |c| Some(format!(r"\#{} ", &c[1])));
    t
}

/// Regex replace skipping matches already preceded by a backslash; the
/// replacer may return `None` to leave a match untouched.
fn replace_unescaped(
    re: &Regex,
    text: &str,
    replacer: impl Fn(&Captures) -> Option<String>,
) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in re.captures_iter(text) {
        let m = caps.get(0).expect("whole-match group exists");
        if m.start() > 0 && text.as_bytes()[m.start() - 1] == b'\\' {
            continue;
        }
        let Some(replacement) = replacer(&caps) else {
            continue;
        };
        out.push_str(&text[last..m.start()]);
        out.push_str(&replacement);
        last = m.end();
    }
    out.push_str(&text[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert_html(html: &str) -> String {
        MarkdownConverter::new()
            .convert(html)
            .expect("conversion succeeds")
    }

    fn convert_with(html: &str, options: ConversionOptions) -> String {
        MarkdownConverter::with_options(options)
            .convert(html)
            .expect("conversion succeeds")
    }

    #[test]
    fn test_heading_conversion() {
        assert_eq!(convert_html("<h1>Main Title</h1>"), "# Main Title");
        assert_eq!(
            convert_html("<h1>Title</h1><h2>Subtitle</h2>"),
            "# Title\n\n## Subtitle"
        );
    }

    #[test]
    fn test_heading_selector_suffix() {
        assert_eq!(
            convert_html("<h2 id=\"x\" class=\"y\">Title</h2>"),
            "## Title {#x.y}"
        );
        assert_eq!(
            convert_html("<h3 class=\"a b\">T</h3>"),
            "### T {.a.b}"
        );
    }

    #[test]
    fn test_paragraph_separation() {
        assert_eq!(
            convert_html("<p>Hello</p><p>World</p>"),
            "Hello\n\nWorld"
        );
    }

    #[test]
    fn test_emphasis_and_strong() {
        assert_eq!(convert_html("<p><em>a</em> <strong>b</strong></p>"), "*a* **b**");
        assert_eq!(convert_html("<p><i>a</i> <b>b</b></p>"), "*a* **b**");
    }

    #[test]
    fn test_inline_code_fences() {
        assert_eq!(convert_html("<p><code>x + y</code></p>"), "`x + y`");
        // content containing a backtick gets a longer fence
        assert_eq!(convert_html("<p><code>a ` b</code></p>"), "``a ` b``");
        // leading backtick content is padded
        assert_eq!(convert_html("<p><code>`x</code></p>"), "`` `x ``");
    }

    #[test]
    fn test_code_preserves_markup_literally() {
        assert_eq!(
            convert_html("<p><code>&lt;em&gt;</code></p>"),
            "`<em>`"
        );
    }

    #[test]
    fn test_autolink() {
        assert_eq!(
            convert_html("<p><a href=\"http://example.com\">http://example.com</a></p>"),
            "<http://example.com>"
        );
        assert_eq!(
            convert_html("<p><a href=\"mailto:mail@example.com\">mail@example.com</a></p>"),
            "<mail@example.com>"
        );
    }

    #[test]
    fn test_reference_link_and_dedup() {
        let md = convert_html(
            "<p><a href=\"http://x.com\" title=\"T\">one</a> and \
             <a href=\"http://x.com\" title=\"T\">two</a></p>",
        );
        assert_eq!(
            md,
            "[one][1] and [two][1]\n\n [1]: http://x.com \"T\""
        );
    }

    #[test]
    fn test_distinct_links_get_distinct_ids() {
        let md = convert_html(
            "<p><a href=\"http://a.com\">a</a> <a href=\"http://b.com\">b</a></p>",
        );
        assert_eq!(
            md,
            "[a][1] [b][2]\n\n [1]: http://a.com\n [2]: http://b.com"
        );
    }

    #[test]
    fn test_inline_link_mode() {
        let options = ConversionOptions {
            link_position: LinkPosition::Inline,
            ..Default::default()
        };
        assert_eq!(
            convert_with("<p><a href=\"http://x.com\" title=\"T\">go</a></p>", options),
            "[go](http://x.com \"T\")"
        );
    }

    #[test]
    fn test_empty_link() {
        assert_eq!(convert_html("<p><a href=\"\">text</a></p>"), "[text]()");
    }

    #[test]
    fn test_image_reference_and_inline() {
        assert_eq!(
            convert_html("<p><img src=\"x.png\" alt=\"Pic\" /></p>"),
            "![Pic][1]\n\n [1]: x.png"
        );
        let options = ConversionOptions {
            link_position: LinkPosition::Inline,
            ..Default::default()
        };
        assert_eq!(
            convert_with("<p><img src=\"x.png\" alt=\"Pic\" title=\"t\" /></p>", options),
            "![Pic](x.png \"t\")"
        );
    }

    #[test]
    fn test_link_and_image_share_reference() {
        let md = convert_html(
            "<p><a href=\"x.png\">see</a> <img src=\"x.png\" alt=\"p\" /></p>",
        );
        assert_eq!(md, "[see][1] ![p][1]\n\n [1]: x.png");
    }

    #[test]
    fn test_blockquote() {
        assert_eq!(
            convert_html("<blockquote><p>a</p><p>b</p></blockquote>"),
            "> a\n> \n> b"
        );
    }

    #[test]
    fn test_unordered_list() {
        assert_eq!(
            convert_html("<ul><li>a</li><li>b</li></ul>"),
            "*   a\n*   b"
        );
    }

    #[test]
    fn test_ordered_list_marker_padding() {
        let items: String = (1..=10).map(|i| format!("<li>i{i}</li>")).collect();
        let md = convert_html(&format!("<ol>{items}</ol>"));
        assert!(md.starts_with("1.  i1\n"));
        assert!(md.ends_with("10. i10"));
    }

    #[test]
    fn test_nested_list() {
        assert_eq!(
            convert_html("<ul><li>a<ul><li>b</li></ul></li></ul>"),
            "*   a\n    *   b"
        );
    }

    #[test]
    fn test_horizontal_rule() {
        assert_eq!(convert_html("<p>a</p><hr /><p>b</p>"), "a\n\n* * *\n\nb");
    }

    #[test]
    fn test_line_break() {
        assert_eq!(convert_html("<p>a<br />\nb</p>"), "a  \nb");
    }

    #[test]
    fn test_pre_code_block() {
        assert_eq!(
            convert_html("<pre><code>let x = 1;\nlet y = 2;</code></pre>"),
            "    let x = 1;\n    let y = 2;"
        );
    }

    #[test]
    fn test_pre_code_keeps_angle_brackets() {
        assert_eq!(
            convert_html("<pre><code>if a &lt; b { }</code></pre>"),
            "    if a < b { }"
        );
    }

    #[test]
    fn test_text_escaping() {
        assert_eq!(convert_html("<p>*foo*</p>"), r"\*foo\*");
        assert_eq!(convert_html("<p>**bold**</p>"), r"\*\*bold\*\*");
        assert_eq!(convert_html("<p>a `tick`</p>"), r"a \`tick\`");
        assert_eq!(convert_html("<p># not a heading</p>"), r"\# not a heading");
        assert_eq!(convert_html("<p>[text] (url)</p>"), r"\[text\] (url)");
    }

    #[test]
    fn test_entity_roundtrip() {
        assert_eq!(convert_html("<p>a &lt; b</p>"), "a < b");
        assert_eq!(convert_html("<p>a < b</p>"), "a < b");
        assert_eq!(convert_html("<p>x &amp; y</p>"), "x & y");
    }

    #[test]
    fn test_keep_html_passthrough() {
        let md = convert_html("<div class=\"note\"><p>kept</p></div>");
        assert!(md.contains("<div class=\"note\">"));
        assert!(md.contains("<p>"));
        assert!(md.contains("kept"));
        assert!(md.contains("</div>"));
    }

    #[test]
    fn test_unconvertible_tags_unwrap_without_keep_html() {
        let options = ConversionOptions {
            keep_html: false,
            ..Default::default()
        };
        assert_eq!(convert_with("<div><p>x</p></div>", options.clone()), "x");
        assert_eq!(
            convert_with("<span style=\"x\">y</span>", options),
            "y"
        );
    }

    #[test]
    fn test_span_passthrough_keeps_inline_markup() {
        let md = convert_html("<p><span style=\"a\">y</span></p>");
        assert_eq!(md, "<span style=\"a\">y</span>");
    }

    #[test]
    fn test_dropped_tags_lose_their_content() {
        assert_eq!(
            convert_html("<p>a</p><script>var x = 1;</script><p>b</p>"),
            "a\n\nb"
        );
        assert_eq!(
            convert_html("<p>a</p><iframe src=\"x\">inner</iframe><p>b</p>"),
            "a\n\nb"
        );
    }

    #[test]
    fn test_comment_kept_and_dropped() {
        assert_eq!(convert_html("<p>a</p><!-- note --><p>b</p>"), "a\n\n<!-- note -->\n\nb");
        let options = ConversionOptions {
            keep_html: false,
            ..Default::default()
        };
        assert_eq!(convert_with("<p>a</p><!-- note --><p>b</p>", options), "a\n\nb");
    }

    #[test]
    fn test_body_width_wraps_at_token_boundaries() {
        let options = ConversionOptions {
            body_width: Some(30),
            ..Default::default()
        };
        let md = convert_with(
            "<p>aaaa bbbb cccc dddd eeee ffff gggg hhhh iiii jjjj</p>",
            options,
        );
        for line in md.lines() {
            assert!(line.chars().count() <= 30, "line too long: {line:?}");
        }
        let rejoined = md.replace('\n', " ");
        assert_eq!(rejoined, "aaaa bbbb cccc dddd eeee ffff gggg hhhh iiii jjjj");
    }

    #[test]
    fn test_width_floor_disables_wrapping() {
        let options = ConversionOptions {
            body_width: Some(10),
            ..Default::default()
        };
        let md = convert_with("<p>aaaa bbbb cccc dddd eeee</p>", options);
        assert_eq!(md, "aaaa bbbb cccc dddd eeee");
    }

    #[test]
    fn test_shortest_absent_backtick_run() {
        assert_eq!(shortest_absent_backtick_run("no ticks"), 1);
        assert_eq!(shortest_absent_backtick_run("a ` b"), 2);
        assert_eq!(shortest_absent_backtick_run("a `` b"), 1);
        assert_eq!(shortest_absent_backtick_run("a ` b `` c"), 3);
    }

    #[test]
    fn test_escape_skips_already_escaped() {
        assert_eq!(escape_markdown_text(r"\*foo\*"), r"\*foo\*");
    }

    #[test]
    fn test_doctype_discarded() {
        assert_eq!(convert_html("<!DOCTYPE html><p>x</p>"), "x");
    }

    #[test]
    fn test_malformed_markup_degrades_to_text() {
        assert_eq!(convert_html("<p>a < b</p>"), "a < b");
        assert_eq!(convert_html("<p>5 <> 4</p>"), "5 <> 4");
    }
}
