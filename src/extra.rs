//! Markdown Extra extensions.
//!
//! Tables, definition lists, footnotes, abbreviations and the
//! `{#id.class}` selector suffixes layered on top of the base
//! converter. Table conversion hinges on a structural lookahead over
//! the tokenizer's raw remainder: a table is only rendered as Markdown
//! when its upcoming markup is a single header row of `<th>` cells
//! (alignment attributes at most) followed by `<td>` rows whose
//! alignment is consistent with the header; anything else passes
//! through as HTML.
//!
//! Footnotes never appear as real HTML elements. A pre-pass rewrites
//! the superscript-link idiom and the trailing footnote list into
//! synthetic `<fnref>`, `<fn>` and `<footnotes>` elements which then
//! flow through the ordinary tag pipeline.

use std::sync::OnceLock;

use log::debug;
use regex::{Captures, Regex};

use crate::converter::{Conversion, StackedAttrs};
use crate::entities;
use crate::error::ConversionError;
use crate::tags;
use crate::tokenizer::{Attributes, Node};
use crate::wrap;

/// Column alignment, as declared by the header row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CellAlignment {
    /// No `align` attribute; renders like left but with a bare `---`
    /// separator.
    Default,
    Left,
    Right,
    Center,
}

/// Accumulated table content between `<table>` and `</table>`.
#[derive(Debug, Default)]
pub(crate) struct TableState {
    pub(crate) rows: Vec<Vec<String>>,
    pub(crate) col_widths: Vec<usize>,
    pub(crate) aligns: Vec<CellAlignment>,
}

fn parse_alignment(value: Option<&str>) -> CellAlignment {
    match value.map(str::to_ascii_lowercase).as_deref() {
        Some("left") => CellAlignment::Left,
        Some("right") => CellAlignment::Right,
        Some("center") => CellAlignment::Center,
        _ => CellAlignment::Default,
    }
}

/// Cell content may hold text and inline markup only; a `<` is
/// acceptable when it does not open a block element.
fn cell_content_pattern() -> String {
    let inline = tags::inline_tag_names().collect::<Vec<_>>().join("|");
    format!(r"(?:[^<]|<(?:{inline}|[^a-z]))+")
}

fn table_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let col = cell_content_pattern();
        Regex::new(&format!(
            r#"(?si)\A\s*(?:<thead\s*>)?\s*<tr\s*>\s*(?:<th(?:\s+align=(?:"(?:left|center|right)"|'(?:left|center|right)'))?\s*>\s*{col}\s*</th>\s*)+</tr>\s*(?:</thead>)?"#
        ))
        .expect("table header pattern compiles")
    })
}

fn th_align_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)<th(?:\s+align=(?:"(left|right|center)"|'(left|right|center)'))?\s*>"#)
            .expect("th alignment pattern compiles")
    })
}

impl Conversion {
    pub(crate) fn handle_table(&mut self, node: &Node) -> Result<(), ConversionError> {
        if node.is_start {
            if self.keep_html {
                match self.table_lookahead() {
                    Some(aligns) => {
                        self.table = Some(TableState {
                            aligns,
                            ..Default::default()
                        });
                        self.row = 0;
                    }
                    None => self.handle_tag_to_text(node),
                }
            } else {
                self.table = Some(TableState::default());
                self.row = 0;
            }
        } else {
            self.emit_table();
        }
        Ok(())
    }

    /// Decide convertibility by matching the raw unconsumed markup.
    fn table_lookahead(&mut self) -> Option<Vec<CellAlignment>> {
        let remaining = self.tokenizer.remaining();
        let header = table_header_re().find(remaining)?;

        let mut aligns = Vec::new();
        for caps in th_align_re().captures_iter(&remaining[..header.end()]) {
            let value = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str());
            aligns.push(parse_alignment(value));
        }

        // every data row must repeat the header's column layout; an
        // align attribute on a cell must agree with its column
        let col = cell_content_pattern();
        let mut cols_pattern = String::new();
        for align in &aligns {
            let attr = match align {
                CellAlignment::Right => r#"(?:\s+align=(?:"right"|'right'))?"#,
                CellAlignment::Center => r#"(?:\s+align=(?:"center"|'center'))?"#,
                CellAlignment::Left | CellAlignment::Default => {
                    r#"(?:\s+align=(?:"left"|'left'))?"#
                }
            };
            cols_pattern.push_str(&format!(r"<td{attr}\s*>\s*{col}\s*</td>\s*"));
        }
        let body_re = Regex::new(&format!(
            r"(?si)\A\s*(?:<tbody\s*>)?\s*(?:<tr\s*>\s*{cols_pattern}</tr>\s*)+(?:</tbody>)?\s*</table>"
        ))
        .expect("table body pattern compiles");

        if body_re.is_match(&remaining[header.end()..]) {
            debug!("table lookahead succeeded with {} column(s)", aligns.len());
            Some(aligns)
        } else {
            debug!("table lookahead failed, passing table through");
            None
        }
    }

    /// Build the Markdown table from the collected cells.
    fn emit_table(&mut self) {
        let Some(mut table) = self.table.take() else {
            return;
        };
        while table.aligns.len() < table.col_widths.len() {
            table.aligns.push(CellAlignment::Default);
        }

        let separator: Vec<String> = table
            .aligns
            .iter()
            .zip(&table.col_widths)
            .map(|(align, width)| {
                let (left, right) = match align {
                    CellAlignment::Left => (':', ' '),
                    CellAlignment::Center => (':', ':'),
                    CellAlignment::Right => (' ', ':'),
                    CellAlignment::Default => (' ', ' '),
                };
                format!("{left}{}{right}", "-".repeat(*width))
            })
            .collect();
        let separator = format!("|{}|", separator.join("|"));

        for row in &mut table.rows {
            for (col, content) in row.iter_mut().enumerate() {
                let width = table.col_widths.get(col).copied().unwrap_or(0);
                let align = table
                    .aligns
                    .get(col)
                    .copied()
                    .unwrap_or(CellAlignment::Default);
                *content = pad_cell(content, width, align);
            }
        }

        let mut lines = Vec::new();
        let mut rows = table.rows.into_iter();
        if let Some(header) = rows.next() {
            lines.push(format!("| {} |", header.join(" | ")));
        }
        lines.push(separator);
        for row in rows {
            lines.push(format!("| {} |", row.join(" | ")));
        }
        let joint = format!("\n{}", self.indent);
        let block = lines.join(joint.as_str());
        self.out(&block, true);
        self.set_line_breaks(2);
    }

    pub(crate) fn handle_table_row(&mut self, node: &Node) -> Result<(), ConversionError> {
        if node.is_start {
            self.col = -1;
        } else {
            self.row += 1;
        }
        Ok(())
    }

    pub(crate) fn handle_table_cell(&mut self, node: &Node) -> Result<(), ConversionError> {
        if self.table.is_none() {
            return Ok(());
        }
        if node.is_start {
            self.col += 1;
            let col = self.col.max(0) as usize;
            if let Some(table) = &mut self.table
                && table.col_widths.len() <= col
            {
                table.col_widths.resize(col + 1, 0);
            }
            self.push_buffer();
        } else {
            let content = self.pop_buffer(&node.name)?.trim().to_string();
            let width = wrap::display_width(&content);
            let col = self.col.max(0) as usize;
            let row = self.row;
            if let Some(table) = &mut self.table {
                if table.col_widths.len() <= col {
                    table.col_widths.resize(col + 1, 0);
                }
                table.col_widths[col] = table.col_widths[col].max(width);
                while table.rows.len() <= row {
                    table.rows.push(Vec::new());
                }
                while table.rows[row].len() <= col {
                    table.rows[row].push(String::new());
                }
                table.rows[row][col] = content;
            }
        }
        Ok(())
    }

    pub(crate) fn handle_table_header_cell(&mut self, node: &Node) -> Result<(), ConversionError> {
        // without the raw-HTML lookahead, alignments come from the
        // header row's attributes
        if !self.keep_html
            && node.is_start
            && self.row == 0
            && let Some(table) = &mut self.table
        {
            let expected = (self.col + 1).max(0) as usize;
            if table.aligns.len() == expected {
                table
                    .aligns
                    .push(parse_alignment(node.attributes.get("align")));
            }
        }
        self.handle_table_cell(node)
    }

    pub(crate) fn handle_definition_list(&mut self, node: &Node) -> Result<(), ConversionError> {
        if !node.is_start {
            self.set_line_breaks(2);
        }
        Ok(())
    }

    pub(crate) fn handle_definition_term(&mut self, node: &Node) -> Result<(), ConversionError> {
        if !node.is_start {
            self.set_line_breaks(1);
        }
        Ok(())
    }

    pub(crate) fn handle_definition_description(
        &mut self,
        node: &Node,
    ) -> Result<(), ConversionError> {
        if node.is_start {
            if self.tokenizer.remaining().trim_start().starts_with("<p>") {
                // a paragraph follows, give the marker its own line
                let piece = format!("\n{}", self.indent);
                self.out(&piece, false);
            } else if self.output.ends_with("\n\n") {
                self.output.pop();
            }
            self.out(":   ", true);
            self.apply_indent(node, "    ", false);
        } else {
            if self.tokenizer.remaining().trim_start().starts_with("<dt>") {
                self.set_line_breaks(2);
            } else {
                self.set_line_breaks(1);
            }
            self.apply_indent(node, "    ", false);
        }
        Ok(())
    }

    pub(crate) fn handle_footnote_ref(&mut self, node: &Node) -> Result<(), ConversionError> {
        let target = node.attributes.get("target").unwrap_or("").to_string();
        let md = format!("[^{target}]");
        self.out(&md, false);
        Ok(())
    }

    pub(crate) fn handle_footnote_def(&mut self, node: &Node) -> Result<(), ConversionError> {
        if node.is_start {
            let name = node.attributes.get("name").unwrap_or("").to_string();
            let md = format!("[^{name}]:");
            self.out(&md, false);
            self.set_line_breaks(1);
        } else {
            self.set_line_breaks(2);
        }
        self.apply_indent(node, "    ", true);
        Ok(())
    }

    pub(crate) fn handle_footnote_block(&mut self, node: &Node) -> Result<(), ConversionError> {
        if !node.is_start {
            self.set_line_breaks(2);
        }
        Ok(())
    }

    /// Abbreviations buffer their display text; the definition line is
    /// deferred to the end of the document, deduplicated by exact text.
    pub(crate) fn handle_abbreviation(&mut self, node: &Node) -> Result<(), ConversionError> {
        if node.is_start {
            self.stack(
                "abbr",
                StackedAttrs {
                    attrs: node.attributes.clone(),
                    ..Default::default()
                },
            );
            self.push_buffer();
        } else {
            let mut entry = self.unstack("abbr")?;
            entry.text = self.pop_buffer("abbr")?;
            let duplicate = self
                .tag_stacks
                .get("abbr")
                .is_some_and(|entries| entries.iter().any(|e| e.text == entry.text));
            let text = entry.text.clone();
            self.out(&text, false);
            if !duplicate {
                self.stack("abbr", entry);
            }
        }
        Ok(())
    }

    /// Write ` *[text]: title` lines for every abbreviation seen.
    pub(crate) fn flush_deferred_abbreviations(&mut self) {
        let Some(entries) = self.tag_stacks.get_mut("abbr") else {
            return;
        };
        let mut lines = Vec::new();
        for entry in entries.iter_mut() {
            if entry.emitted {
                continue;
            }
            entry.emitted = true;
            lines.push(format!(
                " *[{}]: {}",
                entry.text,
                entry.attrs.get("title").unwrap_or("")
            ));
        }
        if !lines.is_empty() {
            let block = format!("\n\n{}", lines.join("\n"));
            self.out(&block, false);
        }
    }
}

fn pad_cell(content: &str, width: usize, align: CellAlignment) -> String {
    let missing = width.saturating_sub(wrap::display_width(content));
    match align {
        CellAlignment::Right => format!("{}{content}", " ".repeat(missing)),
        CellAlignment::Center => {
            let left = missing / 2;
            let right = missing - left;
            format!("{}{content}{}", " ".repeat(left), " ".repeat(right))
        }
        CellAlignment::Left | CellAlignment::Default => {
            format!("{content}{}", " ".repeat(missing))
        }
    }
}

/// `{#id.class}` suffix for headings and links, from the tag's `id`
/// and `class` attributes.
pub(crate) fn css_selector_of(attrs: &Attributes) -> String {
    let mut selector = String::new();
    if let Some(id) = attrs.get("id") {
        selector.push('#');
        selector.push_str(&entities::decode_entities(id));
    }
    if let Some(class) = attrs.get("class") {
        let decoded = entities::decode_entities(class);
        let classes: Vec<&str> = decoded.split(' ').filter(|c| !c.is_empty()).collect();
        if !classes.is_empty() {
            selector.push('.');
            selector.push_str(&classes.join("."));
        }
    }
    selector
}

/// Rewrite the rendered-footnote HTML idiom into synthetic elements
/// before tokenizing.
///
/// `<sup id="fnref:x"><a href="#fn:x" rel="footnote">1</a></sup>`
/// becomes `<fnref target="x" />`; the trailing
/// `<div class="footnotes">` list becomes a `<footnotes>` block of
/// `<fn name="x">...</fn>` entries with the back-reference links
/// removed.
pub(crate) fn rewrite_footnote_idioms(html: &str) -> String {
    if !html.contains("footnote") {
        return html.to_string();
    }
    static SUP_RE: OnceLock<Regex> = OnceLock::new();
    let sup_re = SUP_RE.get_or_init(|| {
        Regex::new(
            r##"(?s)<sup id="fnref:([^"]+)">\s*<a href="#fn:([^"]+)" rel="footnote">\s*\d+\s*</a>\s*</sup>"##,
        )
        .expect("footnote reference pattern compiles")
    });
    let html = sup_re.replace_all(html, |caps: &Captures| {
        if caps[1] == caps[2] {
            format!(r#"<fnref target="{}" />"#, &caps[1])
        } else {
            caps[0].to_string()
        }
    });

    static DIV_RE: OnceLock<Regex> = OnceLock::new();
    let div_re = DIV_RE.get_or_init(|| {
        Regex::new(r#"(?s)<div class="footnotes">\s*<hr />\s*<ol>\s*(.+?)\s*</ol>\s*</div>"#)
            .expect("footnote block pattern compiles")
    });
    div_re
        .replace_all(&html, |caps: &Captures| footnote_block(&caps[1]))
        .into_owned()
}

fn footnote_block(inner: &str) -> String {
    static BACKREF_RE: OnceLock<Regex> = OnceLock::new();
    let backref_re = BACKREF_RE.get_or_init(|| {
        Regex::new(
            r##"(?s)\s*(?:&#160;\s*)?<a href="#fnref:[^"]+" rev="footnote"[^>]*>&#8617;</a>\s*"##,
        )
        .expect("footnote backref pattern compiles")
    });
    let fns = backref_re.replace_all(inner, "");

    static EMPTY_P_RE: OnceLock<Regex> = OnceLock::new();
    let empty_p_re =
        EMPTY_P_RE.get_or_init(|| Regex::new(r"(?s)<p>\s*</p>").expect("empty paragraph pattern"));
    let fns = empty_p_re.replace_all(&fns, "");

    let fns = fns.replace(r#"<li id="fn:"#, r#"<fn name=""#);
    let fns = format!("<footnotes>{fns}</footnotes>");

    static CLOSE_RE: OnceLock<Regex> = OnceLock::new();
    let close_re = CLOSE_RE
        .get_or_init(|| Regex::new(r"(?s)</li>\s*(<fn|</footnotes>)").expect("fn close pattern"));
    close_re.replace_all(&fns, "</fn>$1").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::{ConversionOptions, MarkdownConverter};
    use crate::tokenizer::Attributes;

    fn convert_html(html: &str) -> String {
        MarkdownConverter::new()
            .convert(html)
            .expect("conversion succeeds")
    }

    #[test]
    fn aligned_table_converts() {
        let md = convert_html(
            "<table><tr><th align=\"left\">A</th><th align=\"right\">B</th></tr>\
             <tr><td>1</td><td>22</td></tr></table>",
        );
        assert_eq!(md, "| A |  B |\n|:- | --:|\n| 1 | 22 |");
    }

    #[test]
    fn table_cells_pad_to_column_width() {
        let md = convert_html(
            "<table><tr><th>Name</th><th align=\"center\">N</th></tr>\
             <tr><td>ab</td><td>100</td></tr></table>",
        );
        assert_eq!(md, "| Name |  N  |\n| ---- |:---:|\n| ab   | 100 |");
    }

    #[test]
    fn inconsistent_table_passes_through() {
        // a td aligned against the header's declaration
        let html = "<table><tr><th align=\"left\">A</th></tr>\
                    <tr><td align=\"right\">1</td></tr></table>";
        let md = convert_html(html);
        assert!(md.contains("<table>"));
        assert!(md.contains("</table>"));
    }

    #[test]
    fn block_content_in_cells_passes_through() {
        let html = "<table><tr><th>A</th></tr><tr><td><p>x</p></td></tr></table>";
        let md = convert_html(html);
        assert!(md.contains("<table>"));
    }

    #[test]
    fn table_without_keep_html_skips_lookahead() {
        let options = ConversionOptions {
            keep_html: false,
            ..Default::default()
        };
        let md = MarkdownConverter::with_options(options)
            .convert(
                "<table><tr><th align=\"right\">A</th></tr><tr><td>1</td></tr></table>",
            )
            .expect("conversion succeeds");
        assert_eq!(md, "| A |\n| -:|\n| 1 |");
    }

    #[test]
    fn definition_list() {
        let md = convert_html("<dl><dt>Term</dt><dd>Definition</dd></dl>");
        assert_eq!(md, "Term\n:   Definition");
    }

    #[test]
    fn definition_list_with_two_terms() {
        let md = convert_html(
            "<dl><dt>a</dt><dd>first</dd><dt>b</dt><dd>second</dd></dl>",
        );
        assert_eq!(md, "a\n:   first\n\nb\n:   second");
    }

    #[test]
    fn abbreviation_definitions_deferred_and_deduped() {
        let md = convert_html(
            "<p><abbr title=\"Hypertext Markup Language\">HTML</abbr> is fun. \
             <abbr title=\"Hypertext Markup Language\">HTML</abbr>!</p>",
        );
        assert_eq!(
            md,
            "HTML is fun. HTML!\n\n *[HTML]: Hypertext Markup Language"
        );
    }

    #[test]
    fn footnote_idiom_round_trip() {
        let md = convert_html(
            "<p>Hi<sup id=\"fnref:1\"><a href=\"#fn:1\" rel=\"footnote\">1</a></sup></p>\
             <div class=\"footnotes\"><hr /><ol>\
             <li id=\"fn:1\"><p>Note text</p></li>\
             </ol></div>",
        );
        assert!(md.starts_with("Hi[^1]"));
        assert!(md.contains("[^1]:"));
        assert!(md.contains("Note text"));
    }

    #[test]
    fn footnote_backrefs_are_removed() {
        let rewritten = rewrite_footnote_idioms(
            "<div class=\"footnotes\"><hr /><ol>\
             <li id=\"fn:x\"><p>Body <a href=\"#fnref:x\" rev=\"footnote\">&#8617;</a></p></li>\
             </ol></div>",
        );
        assert!(rewritten.contains("<footnotes>"));
        assert!(rewritten.contains("<fn name=\"x\">"));
        assert!(rewritten.contains("</fn>"));
        assert!(!rewritten.contains("rev=\"footnote\""));
    }

    #[test]
    fn css_selector_shapes() {
        let mut attrs = Attributes::default();
        attrs.set("id", "x");
        attrs.set("class", "a b");
        assert_eq!(css_selector_of(&attrs), "#x.a.b");

        let mut only_class = Attributes::default();
        only_class.set("class", "note");
        assert_eq!(css_selector_of(&only_class), ".note");

        assert_eq!(css_selector_of(&Attributes::default()), "");
    }

    #[test]
    fn link_selector_suffix() {
        let md = convert_html(
            "<p><a href=\"http://x.com\" class=\"ext\">go</a></p>",
        );
        assert_eq!(md, "[go][1]{.ext}\n\n [1]: http://x.com");
    }
}
