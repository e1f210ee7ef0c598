//! Lenient HTML tokenizer.
//!
//! Turns a raw markup string into a sequence of discrete nodes: tags,
//! text, comments, doctypes and processing instructions. Invalid tag
//! syntax never aborts the scan; the offending `<` is escaped to
//! `&lt;` in place and scanning resumes, so arbitrarily broken markup
//! degrades to literal text.
//!
//! The tokenizer owns the open-tag stack and the preformatted depth.
//! An end tag only matches when it carries no attributes and closes the
//! innermost open tag; anything else is treated as invalid. Runs of
//! whitespace in text collapse to a single space outside preformatted
//! regions, and a single all-whitespace text node following a block
//! tag, comment or doctype is swallowed.
//!
//! Converter tag handlers may peek at and trim the unconsumed remainder
//! through [`Tokenizer::remaining`] and
//! [`Tokenizer::trim_remaining_start`]; the table lookahead depends on
//! this raw-string view.

use memchr::memchr;

use crate::tags;

/// Node discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Tag,
    Text,
    Comment,
    Doctype,
    ProcessingInstruction,
}

/// Insertion-ordered attribute map; setting an existing name replaces
/// its value (duplicates resolve last-wins).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    entries: Vec<(String, String)>,
}

impl Attributes {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// One tokenizer yield.
///
/// `raw` holds the verbatim source slice (whitespace-collapsed for text
/// outside preformatted regions; normalized to ` />` form for empty
/// tags). The tag fields are only meaningful when `kind` is
/// [`NodeKind::Tag`].
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub raw: String,
    pub name: String,
    pub attributes: Attributes,
    pub is_start: bool,
    pub is_empty: bool,
    pub is_block: bool,
}

impl Node {
    fn plain(kind: NodeKind, raw: String) -> Self {
        Node {
            kind,
            raw,
            name: String::new(),
            attributes: Attributes::default(),
            is_start: false,
            is_empty: false,
            is_block: false,
        }
    }
}

/// Streaming scanner over one in-memory document.
#[derive(Debug)]
pub struct Tokenizer {
    /// Unconsumed markup; nodes are cut off the front.
    html: String,
    open_tags: Vec<String>,
    /// Preformatted depth; >0 suppresses whitespace collapsing.
    keep_whitespace: usize,
    skip_whitespace: bool,
    /// Suppress HTML tags inside `code` containers.
    pub no_tags_in_code: bool,
    /// Start tag whose open-stack push is deferred to the next scan, so
    /// a consumer processing `<x>` still sees the enclosing tag as
    /// parent.
    pending_open: Option<String>,
}

impl Tokenizer {
    pub fn new(html: impl Into<String>) -> Self {
        Tokenizer {
            html: html.into(),
            open_tags: Vec::new(),
            keep_whitespace: 0,
            skip_whitespace: true,
            no_tags_in_code: false,
            pending_open: None,
        }
    }

    /// The unconsumed remainder of the document.
    pub fn remaining(&self) -> &str {
        &self.html
    }

    /// Trim leading whitespace off the remainder (used by handlers that
    /// must not let markup whitespace leak into their output).
    pub fn trim_remaining_start(&mut self) {
        let offset = self.html.len() - self.html.trim_start().len();
        if offset > 0 {
            self.html.drain(..offset);
        }
    }

    pub fn open_tags(&self) -> &[String] {
        &self.open_tags
    }

    /// Innermost open tag, if any.
    pub fn parent(&self) -> Option<&str> {
        self.open_tags.last().map(String::as_str)
    }

    /// Whether `name` is open anywhere on the stack, not only as the
    /// direct parent.
    pub fn has_parent(&self, name: &str) -> bool {
        self.open_tags.iter().any(|t| t == name)
    }

    pub fn keep_whitespace(&self) -> usize {
        self.keep_whitespace
    }

    /// Scan the next node, or `None` at end of input.
    pub fn next_node(&mut self) -> Option<Node> {
        loop {
            if self.html.is_empty() {
                return None;
            }
            if let Some(name) = self.pending_open.take() {
                if tags::is_preformatted(&name) {
                    self.keep_whitespace += 1;
                }
                self.open_tags.push(name);
            }

            if self.html.starts_with('<') {
                if self.html.starts_with("<?") {
                    let end = self.html.find('>').map_or(self.html.len(), |p| p + 1);
                    return Some(Node::plain(
                        NodeKind::ProcessingInstruction,
                        self.consume(end),
                    ));
                }
                if self.html.starts_with("<!--") {
                    // a missing --> falls back to the next '>'
                    let end = match self.html.find("-->") {
                        Some(p) => p + 3,
                        None => self.html.find('>').map_or(self.html.len(), |p| p + 1),
                    };
                    self.skip_whitespace = true;
                    return Some(Node::plain(NodeKind::Comment, self.consume(end)));
                }
                if self.html.starts_with("<!DOCTYPE") {
                    let end = self.html.find('>').map_or(self.html.len(), |p| p + 1);
                    self.skip_whitespace = true;
                    return Some(Node::plain(NodeKind::Doctype, self.consume(end)));
                }
                if self.html.starts_with("<![CDATA[") {
                    self.consume(9);
                    let (end, skip) = match self.html.find("]]>") {
                        Some(p) => (p, 3),
                        None => (self.html.len(), 0),
                    };
                    let mut payload = self.consume(end);
                    self.consume(skip);
                    if self.keep_whitespace == 0 {
                        payload = collapse_whitespace(&payload);
                    }
                    self.skip_whitespace = true;
                    return Some(Node::plain(NodeKind::Text, payload));
                }
                if let Some(node) = self.parse_tag() {
                    self.skip_whitespace = node.is_block;
                    if node.is_start && !node.is_empty {
                        self.pending_open = Some(node.name.clone());
                    }
                    return Some(node);
                }
                // parse_tag escaped the '<'; rescan as text
            }

            if self.keep_whitespace > 0 {
                self.skip_whitespace = false;
            }
            let end = memchr(b'<', self.html.as_bytes()).unwrap_or(self.html.len());
            let mut text = self.consume(end);
            if self.keep_whitespace == 0 {
                text = collapse_whitespace(&text);
            }
            if self.skip_whitespace && text == " " {
                continue;
            }
            self.skip_whitespace = false;
            return Some(Node::plain(NodeKind::Text, text));
        }
    }

    /// Parse one tag at the front of the remainder. On any failure the
    /// leading `<` is escaped to `&lt;` in place and `None` returned;
    /// the caller rescans as text.
    fn parse_tag(&mut self) -> Option<Node> {
        match self.try_parse_tag() {
            Some(node) => Some(node),
            None => {
                self.html.replace_range(0..1, "&lt;");
                None
            }
        }
    }

    fn try_parse_tag(&mut self) -> Option<Node> {
        let bytes = self.html.as_bytes();
        let len = bytes.len();

        let is_start = bytes.get(1) != Some(&b'/');
        let mut pos = if is_start { 1 } else { 2 };

        // tag name: letters, plus digits after the first letter
        let name_start = pos;
        while pos < len {
            let b = bytes[pos];
            if b.is_ascii_alphabetic() || (pos > name_start && b.is_ascii_digit()) {
                pos += 1;
            } else {
                break;
            }
        }
        let name = self.html[name_start..pos].to_ascii_lowercase();
        let is_block = tags::block_status(&name)?;

        if self.no_tags_in_code
            && self.parent() == Some("code")
            && !(name == "code" && !is_start)
        {
            // all markup inside <code> renders literally
            return None;
        }

        // attributes
        let mut is_empty = false;
        let mut attributes = Attributes::default();
        let mut curr_attrib = String::new();
        let mut closed = false;
        while pos < len {
            let b = bytes[pos];
            if b == b'>' {
                closed = true;
                break;
            }
            if b == b'/' && bytes.get(pos + 1) == Some(&b'>') {
                is_empty = true;
                closed = true;
                pos += 1;
                break;
            }
            if b.is_ascii_alphabetic() || b == b':' || b == b'-' {
                curr_attrib.push(b as char);
                pos += 1;
            } else if matches!(b, b' ' | b'\t' | b'\n' | b'\r') {
                // a bare name is a legacy boolean attribute
                if !curr_attrib.is_empty() {
                    let name = std::mem::take(&mut curr_attrib);
                    attributes.set(&name, name.clone());
                }
                pos += 1;
            } else if b == b'='
                && matches!(bytes.get(pos + 1), Some(b'"') | Some(b'\''))
                && !curr_attrib.is_empty()
            {
                let quote = bytes[pos + 1];
                pos += 2;
                let value_start = pos;
                while pos < len && bytes[pos] != quote {
                    pos += 1;
                }
                if pos == len {
                    // unterminated attribute value
                    return None;
                }
                let name = std::mem::take(&mut curr_attrib);
                attributes.set(&name, self.html[value_start..pos].to_string());
                pos += 1;
            } else {
                return None;
            }
        }
        if !closed {
            return None;
        }
        if !curr_attrib.is_empty() {
            let name = std::mem::take(&mut curr_attrib);
            attributes.set(&name, name.clone());
        }

        if !is_start {
            // end tags must carry no attributes and close the top of stack
            if !attributes.is_empty() || self.parent() != Some(name.as_str()) {
                return None;
            }
            self.open_tags.pop();
            if tags::is_preformatted(&name) {
                self.keep_whitespace = self.keep_whitespace.saturating_sub(1);
            }
        }

        pos += 1;
        let mut raw = self.consume(pos);
        let is_empty = is_empty || tags::is_empty_tag(&name);
        if is_empty {
            raw = normalize_empty_tag_raw(&raw);
        }

        Some(Node {
            kind: NodeKind::Tag,
            raw,
            name,
            attributes,
            is_start,
            is_empty,
            is_block,
        })
    }

    /// Cut `len` bytes off the front of the remainder.
    fn consume(&mut self, len: usize) -> String {
        let rest = self.html.split_off(len);
        std::mem::replace(&mut self.html, rest)
    }
}

/// Collapse every whitespace run to a single space.
fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_ws = false;
    for ch in s.chars() {
        if ch.is_whitespace() {
            if !in_ws {
                out.push(' ');
            }
            in_ws = true;
        } else {
            out.push(ch);
            in_ws = false;
        }
    }
    out
}

/// Rewrite an empty tag's raw form to end in ` />`.
fn normalize_empty_tag_raw(raw: &str) -> String {
    let body = raw
        .trim_end_matches('>')
        .trim_end()
        .trim_end_matches('/')
        .trim_end();
    format!("{body} />")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(html: &str) -> Vec<Node> {
        let mut t = Tokenizer::new(html);
        let mut out = Vec::new();
        while let Some(n) = t.next_node() {
            out.push(n);
        }
        out
    }

    #[test]
    fn scans_tags_and_text() {
        let ns = nodes("<p>Hello</p>");
        assert_eq!(ns.len(), 3);
        assert_eq!(ns[0].kind, NodeKind::Tag);
        assert_eq!(ns[0].name, "p");
        assert!(ns[0].is_start);
        assert_eq!(ns[1].raw, "Hello");
        assert!(!ns[2].is_start);
    }

    #[test]
    fn collapses_whitespace_outside_preformatted() {
        let ns = nodes("<p>a   b\n\tc</p>");
        assert_eq!(ns[1].raw, "a b c");
    }

    #[test]
    fn preserves_whitespace_inside_pre() {
        let ns = nodes("<pre>a   b\n  c</pre>");
        assert_eq!(ns[1].raw, "a   b\n  c");
    }

    #[test]
    fn swallows_single_space_after_block_tags() {
        let ns = nodes("<p>x</p> <p>y</p>");
        let texts: Vec<_> = ns
            .iter()
            .filter(|n| n.kind == NodeKind::Text)
            .map(|n| n.raw.as_str())
            .collect();
        assert_eq!(texts, vec!["x", "y"]);
    }

    #[test]
    fn parses_attributes_in_order_with_last_wins() {
        let ns = nodes("<a href=\"one\" title='t' href=\"two\">x</a>");
        assert_eq!(ns[0].attributes.get("href"), Some("two"));
        assert_eq!(ns[0].attributes.get("title"), Some("t"));
    }

    #[test]
    fn accepts_bare_boolean_attributes() {
        let ns = nodes("<input disabled />");
        assert_eq!(ns[0].attributes.get("disabled"), Some("disabled"));
        assert!(ns[0].is_empty);
    }

    #[test]
    fn escapes_invalid_tags_to_text() {
        let ns = nodes("a < b");
        assert_eq!(ns.len(), 2);
        assert_eq!(ns[0].raw, "a ");
        assert_eq!(ns[1].raw, "&lt; b");
    }

    #[test]
    fn unknown_tag_names_are_escaped() {
        let ns = nodes("<bogus>x</bogus>");
        assert!(ns.iter().all(|n| n.kind == NodeKind::Text));
    }

    #[test]
    fn end_tag_with_attributes_is_invalid() {
        let ns = nodes("<p>x</p class=\"y\">");
        let kinds: Vec<_> = ns.iter().map(|n| n.kind).collect();
        // the bad end tag degrades to text; <p> stays open
        assert_eq!(kinds[0], NodeKind::Tag);
        assert!(kinds[1..].iter().all(|k| *k == NodeKind::Text));
    }

    #[test]
    fn mismatched_end_tag_is_invalid() {
        let mut t = Tokenizer::new("<p><em>x</p>");
        let mut seen = Vec::new();
        while let Some(n) = t.next_node() {
            seen.push(n);
        }
        // </p> cannot close while <em> is innermost
        assert!(seen.iter().any(|n| n.raw.contains("&lt;") || n.raw.contains("</p")));
        assert_eq!(t.open_tags(), ["p", "em"]);
    }

    #[test]
    fn balanced_input_empties_the_stack() {
        let mut t = Tokenizer::new("<div><p>x</p></div>");
        while t.next_node().is_some() {}
        assert!(t.open_tags().is_empty());
    }

    #[test]
    fn normalizes_empty_tags() {
        assert_eq!(nodes("<br>")[0].raw, "<br />");
        assert_eq!(nodes("<hr   />")[0].raw, "<hr />");
        let img = &nodes("<img src=\"x.png\">")[0];
        assert!(img.is_empty);
        assert_eq!(img.raw, "<img src=\"x.png\" />");
    }

    #[test]
    fn comments_doctypes_and_pis() {
        let ns = nodes("<!DOCTYPE html><!-- note --><?xml version=\"1.0\"?>");
        assert_eq!(ns[0].kind, NodeKind::Doctype);
        assert_eq!(ns[1].kind, NodeKind::Comment);
        assert_eq!(ns[1].raw, "<!-- note -->");
        assert_eq!(ns[2].kind, NodeKind::ProcessingInstruction);
    }

    #[test]
    fn unterminated_comment_recovers_at_next_gt() {
        let ns = nodes("<!-- broken ><p>x</p>");
        assert_eq!(ns[0].kind, NodeKind::Comment);
        assert_eq!(ns[0].raw, "<!-- broken >");
        assert_eq!(ns[1].name, "p");
    }

    #[test]
    fn cdata_becomes_text() {
        let ns = nodes("<![CDATA[x < y]]>");
        assert_eq!(ns[0].kind, NodeKind::Text);
        assert_eq!(ns[0].raw, "x < y");
    }

    #[test]
    fn preformatted_depth_tracks_nesting() {
        let mut t = Tokenizer::new("<pre><code>x</code></pre>");
        t.next_node(); // <pre>
        t.next_node(); // <code> (pre pushed, depth 1)
        let text = t.next_node().unwrap(); // x (code pushed, depth 2)
        assert_eq!(t.keep_whitespace(), 2);
        assert_eq!(text.raw, "x");
        t.next_node(); // </code>
        assert_eq!(t.keep_whitespace(), 1);
        t.next_node(); // </pre>
        assert_eq!(t.keep_whitespace(), 0);
    }

    #[test]
    fn suppresses_tags_inside_code_when_asked() {
        let mut t = Tokenizer::new("<code><em>x</em></code>");
        t.no_tags_in_code = true;
        let mut raws = Vec::new();
        while let Some(n) = t.next_node() {
            raws.push((n.kind, n.raw));
        }
        assert_eq!(raws[0].0, NodeKind::Tag);
        // the inner tags degrade to literal text
        assert!(raws[1..raws.len() - 1]
            .iter()
            .all(|(k, _)| *k == NodeKind::Text));
        assert_eq!(raws.last().unwrap().0, NodeKind::Tag);
    }

    #[test]
    fn remaining_and_trim_are_exposed() {
        let mut t = Tokenizer::new("<p>   x</p>");
        t.next_node();
        assert_eq!(t.remaining(), "   x</p>");
        t.trim_remaining_start();
        assert_eq!(t.remaining(), "x</p>");
    }
}
