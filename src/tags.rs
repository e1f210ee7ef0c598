//! Static tag classification tables.
//!
//! Everything the engine knows about individual HTML tags lives here:
//! block/inline status, always-empty tags, preformatted containers, the
//! tags that are dropped wholesale or silently unwrapped, and the
//! "markdownable" registry mapping a tag to the attributes a Markdown
//! rendering can represent. The tables are plain `'static` data and can
//! be shared freely across concurrent conversions.

/// Whether an attribute must be present for the tag to be convertible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrRequirement {
    Required,
    Optional,
}

/// One entry of a tag's allowed-attribute list.
#[derive(Debug, Clone, Copy)]
pub struct AttrRule {
    pub name: &'static str,
    pub requirement: AttrRequirement,
}

const fn required(name: &'static str) -> AttrRule {
    AttrRule {
        name,
        requirement: AttrRequirement::Required,
    }
}

const fn optional(name: &'static str) -> AttrRule {
    AttrRule {
        name,
        requirement: AttrRequirement::Optional,
    }
}

/// Every tag the tokenizer accepts, with its block status.
///
/// A tag name absent from this registry fails tag parsing entirely and
/// is escaped back into literal text. `fnref`, `fn` and `footnotes` are
/// synthetic elements produced by the footnote pre-pass, never by real
/// documents.
const TAG_REGISTRY: &[(&str, bool)] = &[
    // block elements
    ("address", true),
    ("blockquote", true),
    ("center", true),
    ("dir", true),
    ("div", true),
    ("dl", true),
    ("fieldset", true),
    ("form", true),
    ("h1", true),
    ("h2", true),
    ("h3", true),
    ("h4", true),
    ("h5", true),
    ("h6", true),
    ("hr", true),
    ("isindex", true),
    ("menu", true),
    ("noframes", true),
    ("noscript", true),
    ("ol", true),
    ("p", true),
    ("pre", true),
    ("table", true),
    ("ul", true),
    // table internals and list items behave as blocks
    ("thead", true),
    ("tbody", true),
    ("tfoot", true),
    ("td", true),
    ("tr", true),
    ("th", true),
    ("li", true),
    ("dd", true),
    ("dt", true),
    // document scaffolding
    ("html", true),
    ("body", true),
    ("head", true),
    ("meta", true),
    ("link", true),
    ("style", true),
    ("title", true),
    // media tags render as blocks when they appear at all
    ("map", true),
    ("object", true),
    ("param", true),
    ("embed", true),
    ("area", true),
    // inline elements
    ("a", false),
    ("abbr", false),
    ("acronym", false),
    ("applet", false),
    ("b", false),
    ("basefont", false),
    ("bdo", false),
    ("big", false),
    ("br", false),
    ("button", false),
    ("cite", false),
    ("code", false),
    ("del", false),
    ("dfn", false),
    ("em", false),
    ("font", false),
    ("i", false),
    ("img", false),
    ("ins", false),
    ("input", false),
    ("iframe", false),
    ("kbd", false),
    ("label", false),
    ("q", false),
    ("samp", false),
    ("script", false),
    ("select", false),
    ("small", false),
    ("span", false),
    ("strong", false),
    ("sub", false),
    ("sup", false),
    ("textarea", false),
    ("tt", false),
    ("var", false),
    // synthetic footnote elements
    ("fnref", false),
    ("fn", true),
    ("footnotes", true),
];

/// Block status of a known tag: `Some(true)` block, `Some(false)`
/// inline, `None` unknown (tag parse must fail).
pub fn block_status(name: &str) -> Option<bool> {
    TAG_REGISTRY
        .iter()
        .find(|(tag, _)| *tag == name)
        .map(|(_, block)| *block)
}

/// Names of every inline tag in the registry, for the table lookahead's
/// cell-content pattern.
pub fn inline_tag_names() -> impl Iterator<Item = &'static str> {
    TAG_REGISTRY
        .iter()
        .filter(|(_, block)| !*block)
        .map(|(tag, _)| *tag)
}

/// Tags which are always empty (`<br />` and friends).
pub fn is_empty_tag(name: &str) -> bool {
    matches!(
        name,
        "br" | "hr" | "input" | "img" | "area" | "link" | "meta" | "param" | "fnref"
    )
}

/// Tags with preformatted content; whitespace is left untouched inside.
pub fn is_preformatted(name: &str) -> bool {
    matches!(name, "script" | "style" | "pre" | "code")
}

/// Tags whose subtree is deleted before tokenizing (contents not parsed).
pub const DROP_TAGS: &[&str] = &[
    "script", "head", "style", "form", "area", "object", "param", "iframe",
];

/// Tags skipped entirely while their children are still processed.
pub fn is_ignored(name: &str) -> bool {
    matches!(name, "html" | "body" | "thead" | "tbody" | "tfoot")
}

/// Allowed-attribute rules for each markdownable tag.
///
/// `Some(rules)` means the tag has a Markdown equivalent; the converter
/// additionally checks the rules against the attributes actually
/// present. `None` means no Markdown rendering exists and the tag is
/// passed through or unwrapped.
pub fn attr_rules(name: &str) -> Option<&'static [AttrRule]> {
    const NONE: &[AttrRule] = &[];
    const HEADING: &[AttrRule] = &[optional("id"), optional("class")];
    const ANCHOR: &[AttrRule] = &[
        required("href"),
        optional("title"),
        optional("id"),
        optional("class"),
    ];
    const IMAGE: &[AttrRule] = &[required("src"), optional("alt"), optional("title")];
    const CELL: &[AttrRule] = &[optional("align")];
    const ABBR: &[AttrRule] = &[required("title")];
    const FNREF: &[AttrRule] = &[required("target")];
    const FN: &[AttrRule] = &[required("name")];

    match name {
        "p" | "ul" | "ol" | "li" | "br" | "blockquote" | "code" | "pre" | "strong" | "b"
        | "em" | "i" | "hr" | "table" | "tr" | "dl" | "dt" | "dd" | "footnotes" => Some(NONE),
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => Some(HEADING),
        "a" => Some(ANCHOR),
        "img" => Some(IMAGE),
        "th" | "td" => Some(CELL),
        "abbr" => Some(ABBR),
        "fnref" => Some(FNREF),
        "fn" => Some(FN),
        _ => None,
    }
}
