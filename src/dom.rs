//! Lightweight probing of raw HTML with simple CSS selectors.
//!
//! Supports compound selectors (`tag`, `.class`, `#id`, `[attr]`,
//! `[attr=value]`) joined by the descendant combinator. Enough to recognise
//! job-board markup; not a conforming HTML parser.

use regex::Regex;
use std::sync::LazyLock;

static OPEN_TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([a-zA-Z][a-zA-Z0-9-]*)(\s[^>]*)?>").unwrap());

static ANY_TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(/?)([a-zA-Z][a-zA-Z0-9-]*)(?:\s[^>]*)?>").unwrap());

static ATTR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([a-zA-Z_:@][-a-zA-Z0-9_:.@]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+)))?"#)
        .unwrap()
});

static HIDDEN_BLOCK_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b.*?</script>|<style\b.*?</style>|<noscript\b.*?</noscript>|<!--.*?-->")
        .unwrap()
});

static LIST_ITEM_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<li\b[^>]*>").unwrap());

static TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

static WS_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<(String, Option<String>)>,
}

/// A parsed selector: compounds separated by whitespace (descendant).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    parts: Vec<Compound>,
}

impl Selector {
    pub fn parse(input: &str) -> Option<Self> {
        let mut parts = Vec::new();
        let mut rest = input.trim();
        while !rest.is_empty() {
            let (compound, tail) = parse_compound(rest)?;
            parts.push(compound);
            rest = tail.trim_start();
        }
        if parts.is_empty() { None } else { Some(Self { parts }) }
    }
}

fn parse_compound(input: &str) -> Option<(Compound, &str)> {
    let mut compound = Compound::default();
    let bytes = input.as_bytes();
    let mut i = 0;

    let ident_end = |from: usize| {
        input[from..]
            .find(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_'))
            .map_or(input.len(), |n| from + n)
    };

    if i < bytes.len() && (bytes[i].is_ascii_alphabetic() || bytes[i] == b'*') {
        let end = if bytes[i] == b'*' { 1 } else { ident_end(0) };
        let tag = &input[..end];
        if tag != "*" {
            compound.tag = Some(tag.to_ascii_lowercase());
        }
        i = end;
    }

    while i < bytes.len() {
        match bytes[i] {
            b'.' => {
                let end = ident_end(i + 1);
                if end == i + 1 {
                    return None;
                }
                compound.classes.push(input[i + 1..end].to_string());
                i = end;
            }
            b'#' => {
                let end = ident_end(i + 1);
                if end == i + 1 {
                    return None;
                }
                compound.id = Some(input[i + 1..end].to_string());
                i = end;
            }
            b'[' => {
                let close = input[i..].find(']')? + i;
                let body = &input[i + 1..close];
                let attr = match body.split_once('=') {
                    Some((name, value)) => {
                        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
                        (name.trim().to_ascii_lowercase(), Some(value.to_string()))
                    }
                    None => (body.trim().to_ascii_lowercase(), None),
                };
                compound.attrs.push(attr);
                i = close + 1;
            }
            c if c.is_ascii_whitespace() => break,
            _ => return None,
        }
    }

    if compound == Compound::default() && i == 0 {
        return None;
    }
    Some((compound, &input[i..]))
}

/// An element found in a document slice.
#[derive(Debug, Clone)]
pub struct Element<'a> {
    pub tag: String,
    attrs: Vec<(String, String)>,
    pub outer_start: usize,
    pub inner: &'a str,
}

impl Element<'_> {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        html_to_text(self.inner)
    }

    fn matches(&self, compound: &Compound) -> bool {
        if let Some(tag) = &compound.tag
            && tag != &self.tag
        {
            return false;
        }
        if let Some(id) = &compound.id
            && self.attr("id") != Some(id.as_str())
        {
            return false;
        }
        if !compound.classes.is_empty() {
            let classes: Vec<&str> = self.attr("class").unwrap_or_default().split_whitespace().collect();
            if !compound.classes.iter().all(|c| classes.contains(&c.as_str())) {
                return false;
            }
        }
        compound.attrs.iter().all(|(name, expected)| match (self.attr(name), expected) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(actual), Some(expected)) => actual == expected,
        })
    }
}

fn elements(html: &str) -> impl Iterator<Item = Element<'_>> {
    OPEN_TAG_REGEX.captures_iter(html).filter_map(move |caps| {
        let whole = caps.get(0)?;
        let tag = caps[1].to_ascii_lowercase();
        let raw_attrs = caps.get(2).map_or("", |m| m.as_str());
        let attrs = ATTR_REGEX
            .captures_iter(raw_attrs)
            .map(|a| {
                let value = a
                    .get(2)
                    .or_else(|| a.get(3))
                    .or_else(|| a.get(4))
                    .map_or(String::new(), |m| decode_entities(m.as_str()));
                (a[1].to_ascii_lowercase(), value)
            })
            .collect();

        let inner_start = whole.end();
        let self_closing = whole.as_str().ends_with("/>");
        let inner = if self_closing || VOID_ELEMENTS.contains(&tag.as_str()) {
            ""
        } else {
            &html[inner_start..closing_tag_offset(html, inner_start, &tag)]
        };

        Some(Element {
            tag,
            attrs,
            outer_start: whole.start(),
            inner,
        })
    })
}

fn closing_tag_offset(html: &str, from: usize, tag: &str) -> usize {
    let mut depth = 1usize;
    for caps in ANY_TAG_REGEX.captures_iter(&html[from..]) {
        if !caps[2].eq_ignore_ascii_case(tag) {
            continue;
        }
        let Some(whole) = caps.get(0) else { continue };
        if &caps[1] == "/" {
            depth -= 1;
            if depth == 0 {
                return from + whole.start();
            }
        } else if !whole.as_str().ends_with("/>") {
            depth += 1;
        }
    }
    html.len()
}

fn select_parts<'a>(html: &'a str, parts: &[Compound]) -> Option<Element<'a>> {
    let (first, rest) = parts.split_first()?;
    elements(html)
        .filter(|el| el.matches(first))
        .find_map(|el| if rest.is_empty() { Some(el) } else { select_parts(el.inner, rest) })
}

/// First element matching `selector`, in document order of the outermost part.
/// Markup inside `<script>`, `<style>` and comments is never matched.
pub fn select_first<'a>(html: &'a str, selector: &str) -> Option<Element<'a>> {
    let selector = Selector::parse(selector)?;
    let (first, rest) = selector.parts.split_first()?;
    let hidden: Vec<(usize, usize)> = HIDDEN_BLOCK_REGEX
        .find_iter(html)
        .map(|m| (m.start(), m.end()))
        .collect();

    elements(html)
        .filter(|el| !hidden.iter().any(|&(s, e)| el.outer_start >= s && el.outer_start < e))
        .filter(|el| el.matches(first))
        .find_map(|el| if rest.is_empty() { Some(el) } else { select_parts(el.inner, rest) })
}

pub fn matches(html: &str, selector: &str) -> bool {
    select_first(html, selector).is_some()
}

/// Non-empty text of the first matching element among `selectors`, with the
/// selector that produced it.
pub fn first_text<'s>(html: &str, selectors: &[&'s str]) -> Option<(String, &'s str)> {
    selectors.iter().find_map(|sel| {
        let el = select_first(html, sel)?;
        let text = match el.tag.as_str() {
            "meta" => collapse(el.attr("content").unwrap_or_default()),
            _ => el.text(),
        };
        (!text.is_empty()).then_some((text, *sel))
    })
}

/// Visible text of an HTML fragment with list items bulleted.
pub fn html_to_text(html: &str) -> String {
    let without_hidden = HIDDEN_BLOCK_REGEX.replace_all(html, " ");
    let bulleted = LIST_ITEM_REGEX.replace_all(&without_hidden, " • ");
    let plain = TAG_REGEX.replace_all(&bulleted, " ");
    collapse(&decode_entities(&plain))
}

fn collapse(s: &str) -> String {
    WS_REGEX.replace_all(s.trim(), " ").into_owned()
}

fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head>
        <meta property="og:site_name" content="Acme &amp; Co">
        <script>var x = "<h1>not me</h1>";</script>
      </head><body>
        <div class="posting-headline"><h2>Backend Engineer</h2></div>
        <div class="posting-categories"><span class="sort-by-location location">Berlin</span></div>
        <div id="content"><div class="section description">
          <p>Build <b>things</b>.</p><div><ul><li>Rust</li><li>SQL</li></ul></div>
        </div></div>
      </body></html>"#;

    #[test]
    fn test_parse_compound_selectors() {
        assert!(Selector::parse("h1.top-card-layout__title").is_some());
        assert!(Selector::parse(r#"[data-test="job-details"]"#).is_some());
        assert!(Selector::parse(".posting-headline h2").is_some());
        assert!(Selector::parse("").is_none());
        assert!(Selector::parse("a > b").is_none());
    }

    #[test]
    fn test_descendant_selector() {
        let el = select_first(PAGE, ".posting-headline h2").unwrap();
        assert_eq!(el.text(), "Backend Engineer");
        assert!(!matches(PAGE, ".posting-header h2"));
    }

    #[test]
    fn test_class_subset_and_attribute_match() {
        assert_eq!(select_first(PAGE, "span.location").unwrap().text(), "Berlin");
        let meta = select_first(PAGE, "meta[property=og:site_name]").unwrap();
        assert_eq!(meta.attr("content"), Some("Acme & Co"));
    }

    #[test]
    fn test_nested_same_tag_is_balanced() {
        let el = select_first(PAGE, "#content").unwrap();
        let text = el.text();
        assert!(text.starts_with("Build things ."), "{text}");
        assert!(text.contains("• Rust • SQL"), "{text}");
    }

    #[test]
    fn test_first_text_reads_meta_content() {
        let (text, sel) =
            first_text(PAGE, &[".missing", "meta[property=og:site_name]"]).unwrap();
        assert_eq!(text, "Acme & Co");
        assert_eq!(sel, "meta[property=og:site_name]");
    }

    #[test]
    fn test_markup_inside_script_is_ignored() {
        assert!(!matches(PAGE, "h1"));
    }

    #[test]
    fn test_html_to_text_drops_scripts() {
        let text = html_to_text(PAGE);
        assert!(!text.contains("not me"));
        assert!(text.contains("Backend Engineer"));
    }
}
