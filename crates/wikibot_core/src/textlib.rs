use std::ops::Range;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Serialize;

use crate::namespace::{NS_CATEGORY, NamespaceMap};
use crate::title::Title;

/// Markup regions `replace_except` can leave untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    Comment,
    Nowiki,
    Pre,
    SyntaxHighlight,
    Math,
    IncludeOnly,
    Ref,
    Gallery,
    Template,
    Link,
    ExternalLink,
    Table,
    Heading,
}

/// Parts the parser never renders as markup.
pub const DISABLED_PARTS: &[Exception] = &[
    Exception::Comment,
    Exception::IncludeOnly,
    Exception::Nowiki,
    Exception::Pre,
    Exception::SyntaxHighlight,
];

static COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?(?:-->|\z)").expect("valid comment regex"));
static EXTERNAL_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[(?:https?:)?//[^\]\s]+[^\]]*\]").expect("valid external link regex")
});
static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^=+[^\n]+?=+[ \t]*$").expect("valid heading regex"));
static REDIRECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\A\s*#\s*(?:REDIRECT|WEITERLEITUNG|REDIRECTION|REDIRECCIÓN|RINVIA|PATRZ|DOORVERWIJZING|ПЕРЕНАПРАВЛЕНИЕ)\s*:?\s*\[\[\s*([^\]\|\n]+?)\s*(?:\|[^\]]*)?\]\]",
    )
    .expect("valid redirect regex")
});
static WIKILINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[\s*([^\[\]\|\n]+?)\s*(?:\|([^\[\]]*))?\]\]").expect("valid link regex")
});

fn tag_regex(tag: &str) -> Regex {
    Regex::new(&format!(
        r"(?is)<{tag}(?:\s[^>]*)?/>|<{tag}(?:\s[^>]*)?>.*?(?:</{tag}\s*>|\z)"
    ))
    .expect("valid tag regex")
}

static TAGS: LazyLock<Vec<(Exception, Regex)>> = LazyLock::new(|| {
    vec![
        (Exception::Nowiki, tag_regex("nowiki")),
        (Exception::Pre, tag_regex("pre")),
        (Exception::SyntaxHighlight, tag_regex("(?:syntaxhighlight|source)")),
        (Exception::Math, tag_regex("math")),
        (Exception::IncludeOnly, tag_regex("includeonly")),
        (Exception::Ref, tag_regex("ref")),
        (Exception::Gallery, tag_regex("gallery")),
    ]
});

/// Byte ranges of balanced `open`..`close` pairs, outermost only.
fn balanced_spans(text: &str, open: &str, close: &str) -> Vec<Range<usize>> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut depth_starts = Vec::new();
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index..].starts_with(open.as_bytes()) {
            depth_starts.push(index);
            index += open.len();
        } else if bytes[index..].starts_with(close.as_bytes()) {
            if let Some(start) = depth_starts.pop()
                && depth_starts.is_empty()
            {
                spans.push(start..index + close.len());
            }
            index += close.len();
        } else {
            index += 1;
        }
    }
    spans
}

fn table_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut offset = 0usize;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with("{|") {
            if depth == 0 {
                start = offset;
            }
            depth += 1;
        } else if trimmed.starts_with("|}") && depth > 0 {
            depth -= 1;
            if depth == 0 {
                spans.push(start..offset + line.len());
            }
        }
        offset += line.len();
    }
    if depth > 0 {
        spans.push(start..text.len());
    }
    spans
}

fn exception_spans(text: &str, exceptions: &[Exception]) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    for exception in exceptions {
        match exception {
            Exception::Comment => spans.extend(COMMENT.find_iter(text).map(|found| found.range())),
            Exception::Template => spans.extend(balanced_spans(text, "{{", "}}")),
            Exception::Link => spans.extend(balanced_spans(text, "[[", "]]")),
            Exception::ExternalLink => {
                spans.extend(EXTERNAL_LINK.find_iter(text).map(|found| found.range()))
            }
            Exception::Table => spans.extend(table_spans(text)),
            Exception::Heading => spans.extend(HEADING.find_iter(text).map(|found| found.range())),
            tag => {
                if let Some((_, regex)) = TAGS.iter().find(|(kind, _)| kind == tag) {
                    spans.extend(regex.find_iter(text).map(|found| found.range()));
                }
            }
        }
    }
    spans.sort_by_key(|span| span.start);
    spans
}

fn overlaps(spans: &[Range<usize>], range: &Range<usize>) -> bool {
    spans
        .iter()
        .any(|span| span.start < range.end && range.start < span.end)
}

/// Strip the given markup regions from `text`.
pub fn remove_parts(text: &str, parts: &[Exception]) -> String {
    let mut output = String::with_capacity(text.len());
    let mut cursor = 0;
    for span in exception_spans(text, parts) {
        if span.start < cursor {
            cursor = cursor.max(span.end);
            continue;
        }
        output.push_str(&text[cursor..span.start]);
        cursor = span.end;
    }
    output.push_str(&text[cursor.min(text.len())..]);
    output
}

pub fn remove_disabled_parts(text: &str) -> String {
    remove_parts(text, DISABLED_PARTS)
}

/// Replace matches of `pattern` outside the `exceptions` regions, at most
/// `max` of them. `replacement` may reference groups as `$1` or `${name}`.
pub fn replace_except(
    text: &str,
    pattern: &Regex,
    replacement: &str,
    exceptions: &[Exception],
    max: Option<usize>,
) -> String {
    replace_except_with(text, pattern, exceptions, max, |captures| {
        let mut expanded = String::new();
        captures.expand(replacement, &mut expanded);
        expanded
    })
}

pub fn replace_except_with<F>(
    text: &str,
    pattern: &Regex,
    exceptions: &[Exception],
    max: Option<usize>,
    mut replace: F,
) -> String
where
    F: FnMut(&Captures<'_>) -> String,
{
    let protected = exception_spans(text, exceptions);
    let mut output = String::with_capacity(text.len());
    let mut cursor = 0;
    let mut replaced = 0usize;
    for captures in pattern.captures_iter(text) {
        if max.is_some_and(|max| replaced >= max) {
            break;
        }
        let Some(whole) = captures.get(0) else {
            continue;
        };
        if overlaps(&protected, &whole.range()) {
            continue;
        }
        output.push_str(&text[cursor..whole.start()]);
        output.push_str(&replace(&captures));
        cursor = whole.end();
        replaced += 1;
    }
    output.push_str(&text[cursor..]);
    output
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryLink {
    pub title: Title,
    pub sort_key: Option<String>,
}

impl CategoryLink {
    pub fn new(title: Title, sort_key: Option<&str>) -> Self {
        Self {
            title,
            sort_key: sort_key.map(ToString::to_string),
        }
    }

    pub fn to_wikitext(&self) -> String {
        match &self.sort_key {
            Some(key) => format!("[[{}|{key}]]", self.title.full_title()),
            None => format!("[[{}]]", self.title.full_title()),
        }
    }
}

fn prefix_pattern(prefixes: &[String]) -> String {
    let alternatives = prefixes
        .iter()
        .filter(|prefix| !prefix.is_empty())
        .map(|prefix| {
            regex::escape(prefix)
                .split(' ')
                .collect::<Vec<_>>()
                .join("[ _]+")
        })
        .collect::<Vec<_>>();
    format!("(?:{})", alternatives.join("|"))
}

fn category_regex(namespaces: &NamespaceMap) -> Option<Regex> {
    let pattern = format!(
        r"(?i)\[\[[ _]*{}[ _]*:[ _]*([^\[\]\|\n]+?)[ _]*(?:\|([^\[\]\n]*))?\]\]",
        prefix_pattern(&namespaces.category_prefixes())
    );
    Regex::new(&pattern).ok()
}

/// Regex fragment matching `name` the way titles compare: first letter
/// case-insensitive, spaces and underscores interchangeable.
fn title_text_pattern(name: &str) -> String {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return String::new();
    };
    let head = if first.to_lowercase().eq(first.to_uppercase()) {
        regex::escape(&first.to_string())
    } else {
        format!(
            "[{}{}]",
            regex::escape(&first.to_uppercase().to_string()),
            regex::escape(&first.to_lowercase().to_string())
        )
    };
    let tail = regex::escape(chars.as_str())
        .split(' ')
        .collect::<Vec<_>>()
        .join("[ _]+");
    format!("{head}{tail}")
}

fn single_category_regex(namespaces: &NamespaceMap, category: &Title) -> Option<Regex> {
    let prefixes = prefix_pattern(&namespaces.category_prefixes());
    let pattern = format!(
        r"\[\[[ _]*(?i:{prefixes})[ _]*:[ _]*{}[ _]*(\|[^\[\]\n]*)?\]\]",
        title_text_pattern(category.text())
    );
    Regex::new(&pattern).ok()
}

/// Category links outside comments and nowiki sections, in order.
pub fn category_links(text: &str, namespaces: &NamespaceMap) -> Vec<CategoryLink> {
    let Some(regex) = category_regex(namespaces) else {
        return Vec::new();
    };
    let protected = exception_spans(text, DISABLED_PARTS);
    let mut links = Vec::new();
    for captures in regex.captures_iter(text) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        if overlaps(&protected, &whole.range()) {
            continue;
        }
        let name = captures.get(1).map(|found| found.as_str()).unwrap_or_default();
        let Ok(title) = Title::parse(&format!("Category:{name}"), namespaces) else {
            continue;
        };
        if title.namespace() != NS_CATEGORY {
            continue;
        }
        let sort_key = captures.get(2).map(|found| found.as_str().to_string());
        links.push(CategoryLink { title, sort_key });
    }
    links
}

/// Remove matches of `pattern`, dropping lines left empty by the removal.
fn drop_link_lines(text: &str, pattern: &Regex) -> String {
    let removed = replace_except(text, pattern, "", DISABLED_PARTS, None);
    // Links never span lines, so both sides split into the same lines.
    text.split('\n')
        .zip(removed.split('\n'))
        .filter_map(|(before, after)| {
            if before == after {
                Some(after)
            } else if after.trim().is_empty() {
                None
            } else {
                Some(after.trim_end())
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn remove_category_links(text: &str, namespaces: &NamespaceMap) -> String {
    match category_regex(namespaces) {
        Some(regex) => drop_link_lines(text, &regex),
        None => text.to_string(),
    }
}

/// Drop every category link and append `links` as a block at the end.
pub fn replace_category_links(
    text: &str,
    links: &[CategoryLink],
    namespaces: &NamespaceMap,
) -> String {
    let body = remove_category_links(text, namespaces);
    let body = body.trim_end();
    if links.is_empty() {
        return body.to_string();
    }
    if body.is_empty() {
        return category_format(links);
    }
    format!("{body}\n\n{}", category_format(links))
}

/// Swap `old` for `new` where it appears, keeping its sort key. With no `new`
/// the link is removed. If `new` is already present the old link is dropped
/// instead of duplicating it.
pub fn replace_category_in_place(
    text: &str,
    old: &Title,
    new: Option<&Title>,
    namespaces: &NamespaceMap,
) -> String {
    let Some(old_pattern) = single_category_regex(namespaces, old) else {
        return text.to_string();
    };
    let Some(new) = new else {
        return drop_link_lines(text, &old_pattern);
    };
    let already_present = category_links(text, namespaces)
        .iter()
        .any(|link| &link.title == new);
    if already_present {
        return drop_link_lines(text, &old_pattern);
    }
    let new_title = new.full_title();
    replace_except_with(text, &old_pattern, DISABLED_PARTS, None, |captures| {
        let sort_key = captures.get(1).map(|found| found.as_str()).unwrap_or_default();
        format!("[[{new_title}{sort_key}]]")
    })
}

/// Add a category link after the existing ones, or at the end. Unchanged if
/// the page is already in the category.
pub fn add_category(
    text: &str,
    category: &Title,
    sort_key: Option<&str>,
    namespaces: &NamespaceMap,
) -> String {
    let existing = category_links(text, namespaces);
    if existing.iter().any(|link| &link.title == category) {
        return text.to_string();
    }
    let link = CategoryLink::new(category.clone(), sort_key).to_wikitext();

    let protected = exception_spans(text, DISABLED_PARTS);
    let last_end = category_regex(namespaces).and_then(|regex| {
        regex
            .find_iter(text)
            .filter(|found| !overlaps(&protected, &found.range()))
            .map(|found| found.end())
            .last()
    });
    match last_end {
        Some(end) => format!("{}\n{link}{}", &text[..end], &text[end..]),
        None => {
            let body = text.trim_end();
            if body.is_empty() {
                link
            } else {
                format!("{body}\n\n{link}")
            }
        }
    }
}

pub fn category_format(links: &[CategoryLink]) -> String {
    links
        .iter()
        .map(CategoryLink::to_wikitext)
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Template {
    pub name: String,
    /// Parameters in order; positional ones are keyed `"1"`, `"2"`, ...
    pub params: Vec<(String, String)>,
}

impl Template {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

/// Split on `|` at nesting depth zero.
fn split_top_level(inner: &str) -> Vec<&str> {
    let bytes = inner.as_bytes();
    let mut pieces = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index..].starts_with(b"{{") || bytes[index..].starts_with(b"[[") {
            depth += 1;
            index += 2;
            continue;
        }
        if bytes[index..].starts_with(b"}}") || bytes[index..].starts_with(b"]]") {
            depth = (depth - 1).max(0);
            index += 2;
            continue;
        }
        if bytes[index] == b'|' && depth == 0 {
            pieces.push(&inner[start..index]);
            start = index + 1;
        }
        index += 1;
    }
    pieces.push(&inner[start..]);
    pieces
}

/// Templates in document order, nested ones after their container. Parser
/// functions (`{{#if:...}}`) and template parameters (`{{{1}}}`) are skipped.
pub fn extract_templates(text: &str) -> Vec<Template> {
    let cleaned = remove_disabled_parts(text);
    let mut templates = Vec::new();
    collect_templates(&cleaned, &mut templates);
    templates
}

fn collect_templates(text: &str, templates: &mut Vec<Template>) {
    for span in balanced_spans(text, "{{", "}}") {
        let inner = &text[span.start + 2..span.end - 2];
        let pieces = split_top_level(inner);
        let name = pieces[0].trim();
        let is_template = !name.is_empty() && !name.starts_with('#') && !name.starts_with('{');
        if is_template {
            let mut params = Vec::new();
            let mut position = 0usize;
            for piece in &pieces[1..] {
                match piece.split_once('=') {
                    Some((key, value)) if !key.contains("{{") && !key.contains("[[") => {
                        params.push((key.trim().to_string(), value.trim().to_string()));
                    }
                    _ => {
                        position += 1;
                        params.push((position.to_string(), piece.to_string()));
                    }
                }
            }
            templates.push(Template {
                name: name.replace('_', " "),
                params,
            });
        }
        collect_templates(inner, templates);
    }
}

/// Render a template call. Positional parameters stay unnamed while they
/// are consecutive.
pub fn glue_template(name: &str, params: &[(String, String)]) -> String {
    let mut output = format!("{{{{{name}");
    let mut expected = 1usize;
    for (key, value) in params {
        output.push('|');
        if key == &expected.to_string() && !value.contains('=') {
            expected += 1;
        } else {
            output.push_str(key);
            output.push('=');
        }
        output.push_str(value);
    }
    output.push_str("}}");
    output
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WikiLink {
    pub target: String,
    pub label: Option<String>,
}

/// Internal links outside disabled parts. Category and file links are
/// included; callers filter by namespace.
pub fn parse_links(text: &str) -> Vec<WikiLink> {
    let protected = exception_spans(text, DISABLED_PARTS);
    WIKILINK
        .captures_iter(text)
        .filter(|captures| {
            captures
                .get(0)
                .is_some_and(|whole| !overlaps(&protected, &whole.range()))
        })
        .filter_map(|captures| {
            let target = captures.get(1)?.as_str().trim().to_string();
            Some(WikiLink {
                target,
                label: captures.get(2).map(|found| found.as_str().to_string()),
            })
        })
        .collect()
}

/// Target of a `#REDIRECT [[...]]` line at the start of `text`.
pub fn redirect_target(text: &str) -> Option<String> {
    REDIRECT
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|found| found.as_str().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Position {
    Top,
    /// End of the content, above a trailing block of category links.
    #[default]
    Bottom,
    /// Above the first category link anywhere in the text.
    BeforeCategories,
}

/// Byte offset of the line starting the block of category links, blank
/// lines and comments that ends the text, if there is one.
fn trailing_category_block(text: &str, namespaces: &NamespaceMap) -> Option<usize> {
    let regex = category_regex(namespaces)?;
    let mut offsets = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        offsets.push((offset, line));
        offset += line.len();
    }
    let mut block_start = None;
    for (start, line) in offsets.into_iter().rev() {
        let rest = regex.replace_all(&remove_parts(line, &[Exception::Comment]), "").to_string();
        if !rest.trim().is_empty() {
            break;
        }
        if regex.is_match(line) {
            block_start = Some(start);
        }
    }
    block_start
}

fn insert_at_line(text: &str, line_start: usize, addition: &str) -> String {
    let head = text[..line_start].trim_end();
    let tail = &text[line_start..];
    if head.is_empty() {
        format!("{addition}\n\n{tail}")
    } else {
        format!("{head}\n{addition}\n\n{tail}")
    }
}

pub fn add_text(text: &str, addition: &str, position: Position, namespaces: &NamespaceMap) -> String {
    let addition = addition.trim_matches('\n');
    match position {
        Position::Top => {
            if text.is_empty() {
                addition.to_string()
            } else {
                format!("{addition}\n{text}")
            }
        }
        Position::Bottom => match trailing_category_block(text, namespaces) {
            Some(start) => insert_at_line(text, start, addition),
            None => {
                let body = text.trim_end();
                if body.is_empty() {
                    addition.to_string()
                } else {
                    format!("{body}\n{addition}")
                }
            }
        },
        Position::BeforeCategories => {
            let protected = exception_spans(text, DISABLED_PARTS);
            let first = category_regex(namespaces).and_then(|regex| {
                regex
                    .find_iter(text)
                    .find(|found| !overlaps(&protected, &found.range()))
                    .map(|found| found.start())
            });
            match first {
                Some(start) => {
                    let line_start = text[..start].rfind('\n').map(|index| index + 1).unwrap_or(0);
                    insert_at_line(text, line_start, addition)
                }
                None => add_text(text, addition, Position::Bottom, namespaces),
            }
        }
    }
}
