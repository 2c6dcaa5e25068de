//! Rich-text normalization into the canonical document tree.
//!
//! Source exports carry descriptions, notes and step texts as plain text,
//! HTML fragments, or already-serialized document JSON. Everything is
//! converted into one canonical node tree:
//!
//! ```json
//! {"type": "doc", "content": [
//!   {"type": "paragraph", "content": [
//!     {"type": "text", "text": "Click ", "marks": []},
//!     {"type": "text", "text": "Save", "marks": [{"type": "bold"}]}
//!   ]}
//! ]}
//! ```
//!
//! # Rules
//!
//! - `null`, empty and whitespace-only input normalizes to `None`.
//! - A canonical document passes through unchanged, unless it has no text
//!   content, in which case it normalizes to `None`.
//! - A string that parses as a canonical document is treated the same way.
//! - HTML is parsed headlessly (`scraper`) and mapped onto paragraphs,
//!   headings, lists, blockquotes, code blocks, rules and inline marks.
//! - Anything else is plain text: blank lines split paragraphs, single
//!   newlines become hard breaks.
//!
//! Conversions of string input are cached. The cache has a fixed capacity
//! and is cleared wholesale once full.

use scraper::{ElementRef, Html};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Default number of cached string conversions.
pub const DEFAULT_CACHE_CAPACITY: usize = 5_000;

/// Job-scoped normalizer with its conversion cache.
#[derive(Debug)]
pub struct RichTextNormalizer {
    cache: HashMap<String, Option<Value>>,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl Default for RichTextNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl RichTextNormalizer {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: HashMap::new(),
            capacity: capacity.max(1),
            hits: 0,
            misses: 0,
        }
    }

    /// Normalize any source value into a canonical document.
    pub fn normalize(&mut self, value: Option<&Value>) -> Option<Value> {
        match value? {
            Value::Null => None,
            Value::String(s) => self.normalize_str(s),
            Value::Bool(b) => from_plain(&b.to_string()),
            Value::Number(n) => from_plain(&n.to_string()),
            Value::Object(obj) => normalize_object(obj),
            Value::Array(items) => normalize_array(items),
        }
    }

    /// Normalize a string, consulting the cache first.
    pub fn normalize_str(&mut self, input: &str) -> Option<Value> {
        if input.trim().is_empty() {
            return None;
        }
        if let Some(cached) = self.cache.get(input) {
            self.hits += 1;
            return cached.clone();
        }
        self.misses += 1;
        let converted = convert_str(input);
        if self.cache.len() >= self.capacity {
            tracing::debug!(capacity = self.capacity, "rich-text cache full, clearing");
            self.cache.clear();
        }
        self.cache.insert(input.to_string(), converted.clone());
        converted
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// `(hits, misses)` since the normalizer was created.
    pub fn cache_stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

/// True for a `{"type": "doc", ...}` object.
pub fn is_canonical(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("doc")
        && value
            .get("content")
            .map(Value::is_array)
            .unwrap_or(true)
}

/// True when the tree contains any visible content.
pub fn has_content(node: &Value) -> bool {
    match node.get("type").and_then(Value::as_str) {
        Some("text") => node
            .get("text")
            .and_then(Value::as_str)
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false),
        Some("image") => true,
        _ => node
            .get("content")
            .and_then(Value::as_array)
            .map(|children| children.iter().any(has_content))
            .unwrap_or(false),
    }
}

fn keep_if_content(doc: Value) -> Option<Value> {
    if has_content(&doc) {
        Some(doc)
    } else {
        None
    }
}

fn normalize_object(obj: &Map<String, Value>) -> Option<Value> {
    let value = Value::Object(obj.clone());
    if is_canonical(&value) {
        return keep_if_content(value);
    }
    // A bare node (e.g. a single paragraph) gets wrapped into a document.
    if obj.get("type").and_then(Value::as_str).is_some() {
        return keep_if_content(doc(vec![value]));
    }
    from_plain(&value.to_string())
}

fn normalize_array(items: &[Value]) -> Option<Value> {
    let all_nodes = !items.is_empty()
        && items
            .iter()
            .all(|i| i.get("type").and_then(Value::as_str).is_some());
    if all_nodes {
        return keep_if_content(doc(items.to_vec()));
    }
    let joined = items
        .iter()
        .map(|i| match i {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n");
    from_plain(&joined)
}

fn convert_str(input: &str) -> Option<Value> {
    let trimmed = input.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
            match &parsed {
                Value::Object(obj) if obj.get("type").is_some() => return normalize_object(obj),
                Value::Array(items) if !items.is_empty() && items.iter().all(Value::is_object) => {
                    return normalize_array(items)
                }
                _ => {}
            }
        }
    }
    if looks_like_html(trimmed) {
        from_html(trimmed)
    } else {
        from_plain(trimmed)
    }
}

/// A `<` followed by a tag-ish character, with a closing `>` later on.
fn looks_like_html(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.iter().enumerate().any(|(i, b)| {
        *b == b'<'
            && bytes
                .get(i + 1)
                .map(|n| n.is_ascii_alphabetic() || *n == b'/' || *n == b'!')
                .unwrap_or(false)
            && s[i..].contains('>')
    })
}

fn doc(content: Vec<Value>) -> Value {
    json!({"type": "doc", "content": content})
}

fn text_node(text: &str, marks: &[Value]) -> Value {
    let mut node = json!({"type": "text", "text": text});
    if !marks.is_empty() {
        node["marks"] = Value::Array(marks.to_vec());
    }
    node
}

fn paragraph(inline: Vec<Value>) -> Value {
    if inline.is_empty() {
        json!({"type": "paragraph"})
    } else {
        json!({"type": "paragraph", "content": inline})
    }
}

/// Plain text → paragraphs split on blank lines, hard breaks within.
pub fn from_plain(text: &str) -> Option<Value> {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let paragraphs: Vec<Value> = normalized
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            let mut inline = Vec::new();
            for (i, line) in p.lines().enumerate() {
                if i > 0 {
                    inline.push(json!({"type": "hardBreak"}));
                }
                if !line.is_empty() {
                    inline.push(text_node(line, &[]));
                }
            }
            paragraph(inline)
        })
        .collect();
    if paragraphs.is_empty() {
        None
    } else {
        keep_if_content(doc(paragraphs))
    }
}

/// HTML fragment → canonical document.
pub fn from_html(html: &str) -> Option<Value> {
    let fragment = Html::parse_fragment(html);
    let blocks = blocks_from(fragment.root_element());
    if blocks.is_empty() {
        None
    } else {
        keep_if_content(doc(blocks))
    }
}

fn blocks_from(el: ElementRef<'_>) -> Vec<Value> {
    let mut blocks = Vec::new();
    let mut inline = Vec::new();

    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            push_text(&mut inline, text, &[]);
            continue;
        }
        let Some(child_el) = ElementRef::wrap(child) else {
            continue;
        };
        let name = child_el.value().name();
        match name {
            "p" => {
                flush_paragraph(&mut inline, &mut blocks);
                let content = inlines_from(child_el, &[]);
                if let Some(p) = finish_inline(content) {
                    blocks.push(paragraph(p));
                }
            }
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                flush_paragraph(&mut inline, &mut blocks);
                let level: u8 = name[1..].parse().unwrap_or(1);
                if let Some(content) = finish_inline(inlines_from(child_el, &[])) {
                    blocks.push(json!({
                        "type": "heading",
                        "attrs": {"level": level},
                        "content": content
                    }));
                }
            }
            "ul" | "ol" => {
                flush_paragraph(&mut inline, &mut blocks);
                blocks.push(list_from(child_el, name == "ol"));
            }
            "li" => {
                flush_paragraph(&mut inline, &mut blocks);
                blocks.extend(blocks_from(child_el));
            }
            "blockquote" => {
                flush_paragraph(&mut inline, &mut blocks);
                let inner = blocks_from(child_el);
                if !inner.is_empty() {
                    blocks.push(json!({"type": "blockquote", "content": inner}));
                }
            }
            "pre" => {
                flush_paragraph(&mut inline, &mut blocks);
                let code: String = child_el.text().collect();
                let code = code.trim_end_matches('\n');
                if code.trim().is_empty() {
                    continue;
                }
                blocks.push(json!({
                    "type": "codeBlock",
                    "content": [{"type": "text", "text": code}]
                }));
            }
            "hr" => {
                flush_paragraph(&mut inline, &mut blocks);
                blocks.push(json!({"type": "horizontalRule"}));
            }
            "img" => {
                flush_paragraph(&mut inline, &mut blocks);
                if let Some(src) = child_el.value().attr("src") {
                    blocks.push(json!({"type": "image", "attrs": {"src": src}}));
                }
            }
            "script" | "style" | "head" | "noscript" | "template" => {}
            "div" | "section" | "article" | "header" | "footer" | "main" | "body" | "html"
            | "table" | "thead" | "tbody" | "tfoot" | "tr" | "td" | "th" | "figure" => {
                flush_paragraph(&mut inline, &mut blocks);
                blocks.extend(blocks_from(child_el));
            }
            _ => inline.extend(inline_element(child_el, &[])),
        }
    }
    flush_paragraph(&mut inline, &mut blocks);
    blocks
}

fn list_from(el: ElementRef<'_>, ordered: bool) -> Value {
    let items: Vec<Value> = el
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|c| c.value().name() == "li")
        .map(|li| {
            let mut content = blocks_from(li);
            if content.is_empty() {
                content.push(paragraph(Vec::new()));
            }
            json!({"type": "listItem", "content": content})
        })
        .collect();
    if ordered {
        let start = el
            .value()
            .attr("start")
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(1);
        json!({"type": "orderedList", "attrs": {"start": start}, "content": items})
    } else {
        json!({"type": "bulletList", "content": items})
    }
}

fn inlines_from(el: ElementRef<'_>, marks: &[Value]) -> Vec<Value> {
    let mut out = Vec::new();
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            push_text(&mut out, text, marks);
        } else if let Some(child_el) = ElementRef::wrap(child) {
            out.extend(inline_element(child_el, marks));
        }
    }
    out
}

fn inline_element(el: ElementRef<'_>, marks: &[Value]) -> Vec<Value> {
    let mark = match el.value().name() {
        "br" => return vec![json!({"type": "hardBreak"})],
        "script" | "style" => return Vec::new(),
        "strong" | "b" => Some(json!({"type": "bold"})),
        "em" | "i" => Some(json!({"type": "italic"})),
        "s" | "strike" | "del" => Some(json!({"type": "strike"})),
        "u" | "ins" => Some(json!({"type": "underline"})),
        "code" | "kbd" | "tt" => Some(json!({"type": "code"})),
        "a" => el
            .value()
            .attr("href")
            .map(|href| json!({"type": "link", "attrs": {"href": href}})),
        _ => None,
    };
    match mark {
        Some(m) if !marks.contains(&m) => {
            let mut nested = marks.to_vec();
            nested.push(m);
            inlines_from(el, &nested)
        }
        _ => inlines_from(el, marks),
    }
}

/// Append a text node with collapsed whitespace.
fn push_text(out: &mut Vec<Value>, raw: &str, marks: &[Value]) {
    let mut collapsed = String::with_capacity(raw.len());
    let mut in_space = false;
    for c in raw.chars() {
        if c.is_whitespace() {
            if !in_space {
                collapsed.push(' ');
            }
            in_space = true;
        } else {
            collapsed.push(c);
            in_space = false;
        }
    }
    if !collapsed.is_empty() {
        out.push(text_node(&collapsed, marks));
    }
}

/// Trim the edges of an inline run and drop empty text nodes.
/// Returns `None` when nothing visible is left.
fn finish_inline(mut inline: Vec<Value>) -> Option<Vec<Value>> {
    if let Some(first) = inline.iter_mut().find(|n| n["type"] == "text") {
        let trimmed = first["text"].as_str().unwrap_or("").trim_start().to_string();
        first["text"] = Value::String(trimmed);
    }
    if let Some(last) = inline.iter_mut().rev().find(|n| n["type"] == "text") {
        let trimmed = last["text"].as_str().unwrap_or("").trim_end().to_string();
        last["text"] = Value::String(trimmed);
    }
    inline.retain(|n| n["type"] != "text" || n["text"].as_str().map(|t| !t.is_empty()).unwrap_or(false));
    while inline.last().map(|n| n["type"] == "hardBreak").unwrap_or(false) {
        inline.pop();
    }
    if inline.iter().any(|n| n["type"] == "text") {
        Some(inline)
    } else {
        None
    }
}

fn flush_paragraph(inline: &mut Vec<Value>, blocks: &mut Vec<Value>) {
    if inline.is_empty() {
        return;
    }
    if let Some(content) = finish_inline(std::mem::take(inline)) {
        blocks.push(paragraph(content));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize(v: Value) -> Option<Value> {
        RichTextNormalizer::default().normalize(Some(&v))
    }

    #[test]
    fn null_and_empty_are_none() {
        let mut n = RichTextNormalizer::default();
        assert_eq!(n.normalize(None), None);
        assert_eq!(n.normalize(Some(&Value::Null)), None);
        assert_eq!(n.normalize(Some(&json!(""))), None);
        assert_eq!(n.normalize(Some(&json!("   \n  "))), None);
    }

    #[test]
    fn empty_canonical_doc_is_none() {
        assert_eq!(normalize(json!({"type": "doc", "content": []})), None);
        assert_eq!(
            normalize(json!({"type": "doc", "content": [{"type": "paragraph"}]})),
            None
        );
        assert_eq!(normalize(json!(r#"{"type":"doc","content":[]}"#)), None);
    }

    #[test]
    fn non_empty_canonical_doc_passes_through_unchanged() {
        let d = json!({"type": "doc", "content": [
            {"type": "paragraph", "content": [{"type": "text", "text": "hello"}]}
        ]});
        assert_eq!(normalize(d.clone()), Some(d.clone()));
        assert_eq!(normalize(Value::String(d.to_string())), Some(d));
    }

    #[test]
    fn plain_text_paragraphs_and_breaks() {
        let d = normalize(json!("first line\nsecond line\n\nnext paragraph")).unwrap();
        let content = d["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content[0]["content"][1]["type"], "hardBreak");
        assert_eq!(content[1]["content"][0]["text"], "next paragraph");
    }

    #[test]
    fn html_marks_lists_and_headings() {
        let d = normalize(json!(
            "<h2>Setup</h2><p>Click <b>Save</b> then <a href=\"https://x.test\">open</a></p>\
             <ul><li>one</li><li><em>two</em></li></ul><pre>cargo test\n</pre>"
        ))
        .unwrap();
        let content = d["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], "heading");
        assert_eq!(content[0]["attrs"]["level"], 2);
        let p = &content[1]["content"];
        assert_eq!(p[0]["text"], "Click ");
        assert_eq!(p[1]["text"], "Save");
        assert_eq!(p[1]["marks"][0]["type"], "bold");
        assert_eq!(p[3]["marks"][0]["attrs"]["href"], "https://x.test");
        assert_eq!(content[2]["type"], "bulletList");
        assert_eq!(content[2]["content"].as_array().unwrap().len(), 2);
        assert_eq!(
            content[2]["content"][1]["content"][0]["content"][0]["marks"][0]["type"],
            "italic"
        );
        assert_eq!(content[3]["type"], "codeBlock");
        assert_eq!(content[3]["content"][0]["text"], "cargo test");
    }

    #[test]
    fn bare_inline_html_becomes_paragraph() {
        let d = normalize(json!("line one<br>line <i>two</i>")).unwrap();
        let p = &d["content"][0];
        assert_eq!(p["type"], "paragraph");
        assert_eq!(p["content"][1]["type"], "hardBreak");
    }

    #[test]
    fn html_without_text_is_none() {
        assert_eq!(normalize(json!("<p> </p><div><br></div>")), None);
    }

    #[test]
    fn less_than_in_plain_text_is_not_html() {
        let d = normalize(json!("a < b and c > d")).unwrap();
        assert_eq!(d["content"][0]["content"][0]["text"], "a < b and c > d");
    }

    #[test]
    fn cache_is_cleared_wholesale_when_full() {
        let mut n = RichTextNormalizer::new(2);
        n.normalize_str("a");
        n.normalize_str("b");
        assert_eq!(n.cache_len(), 2);
        n.normalize_str("a");
        assert_eq!(n.cache_stats(), (1, 2));
        n.normalize_str("c");
        assert_eq!(n.cache_len(), 1);
    }
}
