use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::PageTransform;
use crate::citoid::{CitationMetadata, CitoidClient};
use crate::error::Result;
use crate::page::Page;
use crate::site::Site;
use crate::textlib::{self, DISABLED_PARTS};

const MAX_TITLE_CHARS: usize = 200;

static BARE_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)<ref(?P<attrs>[^>/]*)>\s*\[?\s*(?P<url>https?://[^\[\]<>"\s]+?)\s*\]?\s*</ref>"#,
    )
    .expect("valid bare reference regex")
});

static FULL_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<ref(?P<attrs>[^>/]*)>(?P<content>.*?)</ref>")
        .expect("valid reference regex")
});

static REF_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bname\s*=\s*(?:"(?P<dq>[^"]+)"|'(?P<sq>[^']+)'|(?P<bare>[^\s"'/>]+))"#)
        .expect("valid reference name regex")
});

static AUTOGENERATED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^autogenerated(\d+)$").expect("valid autogenerated name regex")
});

/// Titles that describe an error or login page rather than the cited work.
static BAD_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)^\W*$",
        r"|^(test|untitled|home|index|error|redirect(ing)?)\W*$",
        r"|\b(403|404|410|500)\b",
        r"|\b(page|file|article|document)\s+(not\s+found|unavailable|has\s+(been\s+)?(moved|removed))",
        r"|\bnot\s+found\b",
        r"|\b(log|sign)\s*(in|on)\b",
        r"|\bregist(er|ration)\b",
        r"|\baccess\s+denied\b",
        r"|\bsubscribe\b",
        r"|\bjust\s+a\s+moment\b",
        r"|\bdomain\s+(is\s+)?for\s+sale\b",
    ))
    .expect("valid bad title regex")
});

/// Where citation metadata comes from.
pub trait CitationSource {
    fn lookup(&mut self, url: &str) -> Result<Option<CitationMetadata>>;
}

impl CitationSource for CitoidClient {
    fn lookup(&mut self, url: &str) -> Result<Option<CitationMetadata>> {
        self.metadata(url)
    }
}

/// Whitespace collapsed, cut to 200 characters, and wiki markup escaped.
pub fn clean_title(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut title = collapsed.chars().take(MAX_TITLE_CHARS).collect::<String>();
    if collapsed.chars().count() > MAX_TITLE_CHARS {
        title = title.trim_end().to_string();
        title.push_str("...");
    }
    title
        .replace('|', "&#124;")
        .replace('[', "&#91;")
        .replace(']', "&#93;")
        .replace("{{", "&#123;&#123;")
        .replace("}}", "&#125;&#125;")
}

pub fn is_bad_title(title: &str, url: &str) -> bool {
    let trimmed = title.trim();
    BAD_TITLE.is_match(trimmed) || trimmed.eq_ignore_ascii_case(url.trim())
}

fn cite_web(url: &str, metadata: &CitationMetadata, title: &str, access_date: Option<&str>) -> String {
    let mut params = vec![
        ("url".to_string(), url.to_string()),
        ("title".to_string(), title.to_string()),
    ];
    if let Some(website) = &metadata.website {
        params.push(("website".to_string(), clean_title(website)));
    }
    if let Some(date) = &metadata.date {
        params.push(("date".to_string(), date.clone()));
    }
    if let Some(accessed) = access_date.or(metadata.access_date.as_deref()) {
        params.push(("access-date".to_string(), accessed.to_string()));
    }
    let body = params
        .iter()
        .map(|(key, value)| format!(" |{key}={value}"))
        .collect::<String>();
    format!("{{{{cite web{body}}}}}")
}

fn ref_name(attrs: &str) -> Option<String> {
    REF_NAME.captures(attrs).and_then(|captures| {
        captures
            .name("dq")
            .or_else(|| captures.name("sq"))
            .or_else(|| captures.name("bare"))
            .map(|found| found.as_str().trim().to_string())
    })
}

/// Attributes other than `name` (such as `group`) make a reference unsafe to
/// merge.
fn only_name_attr(attrs: &str) -> bool {
    REF_NAME.replace(attrs, "").trim().is_empty()
}

/// Collapses references with identical content into one named reference
/// followed by `<ref name="..." />` reuses.
pub fn merge_duplicate_refs(text: &str) -> String {
    let protected = textlib::remove_parts(text, DISABLED_PARTS);
    let mut groups: BTreeMap<String, Vec<Option<String>>> = BTreeMap::new();
    let mut used_names = BTreeSet::new();
    for captures in FULL_REF.captures_iter(&protected) {
        let attrs = captures.name("attrs").map_or("", |found| found.as_str());
        let content = captures.name("content").map_or("", |found| found.as_str()).trim();
        let name = ref_name(attrs);
        if let Some(name) = &name {
            used_names.insert(name.clone());
        }
        if content.is_empty() || !only_name_attr(attrs) {
            continue;
        }
        groups.entry(content.to_string()).or_default().push(name);
    }
    for captures in REF_NAME.captures_iter(&protected) {
        if let Some(found) = captures
            .name("dq")
            .or_else(|| captures.name("sq"))
            .or_else(|| captures.name("bare"))
        {
            used_names.insert(found.as_str().trim().to_string());
        }
    }

    let mut next_number = used_names
        .iter()
        .filter_map(|name| AUTOGENERATED.captures(name))
        .filter_map(|captures| captures.get(1)?.as_str().parse::<usize>().ok())
        .max()
        .unwrap_or(0)
        + 1;

    let mut assigned: BTreeMap<String, String> = BTreeMap::new();
    for (content, names) in &groups {
        if names.len() < 2 {
            continue;
        }
        let distinct = names.iter().flatten().collect::<BTreeSet<_>>();
        let name = match distinct.len() {
            0 => {
                let name = format!("autogenerated{next_number}");
                next_number += 1;
                name
            }
            1 => distinct.into_iter().next().cloned().unwrap_or_default(),
            _ => continue,
        };
        assigned.insert(content.clone(), name);
    }
    if assigned.is_empty() {
        return text.to_string();
    }

    let mut first_seen = BTreeSet::new();
    textlib::replace_except_with(text, &FULL_REF, DISABLED_PARTS, None, |captures: &Captures| {
        let whole = captures.get(0).map_or("", |found| found.as_str()).to_string();
        let attrs = captures.name("attrs").map_or("", |found| found.as_str());
        let content = captures.name("content").map_or("", |found| found.as_str()).trim();
        let Some(name) = assigned.get(content) else {
            return whole;
        };
        if !only_name_attr(attrs) {
            return whole;
        }
        if first_seen.insert(name.clone()) {
            format!("<ref name=\"{name}\">{content}</ref>")
        } else {
            format!("<ref name=\"{name}\" />")
        }
    })
}

/// The reference-fixing transform.
pub struct RefLinks<S: CitationSource> {
    source: S,
    access_date: Option<String>,
    cache: BTreeMap<String, Option<CitationMetadata>>,
}

impl<S: CitationSource> RefLinks<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            access_date: None,
            cache: BTreeMap::new(),
        }
    }

    /// Date written as `access-date`, instead of the one the source reports.
    pub fn with_access_date(mut self, date: &str) -> Self {
        self.access_date = Some(date.to_string());
        self
    }

    fn metadata(&mut self, url: &str) -> Option<CitationMetadata> {
        if let Some(cached) = self.cache.get(url) {
            return cached.clone();
        }
        let found = match self.source.lookup(url) {
            Ok(found) => found,
            Err(error) => {
                tracing::warn!(url, %error, "citation lookup failed");
                None
            }
        };
        self.cache.insert(url.to_string(), found.clone());
        found
    }

    /// Rewrites bare references in `text`; returns the new text and how many
    /// references were converted.
    pub fn convert(&mut self, text: &str) -> (String, usize) {
        let urls = BARE_REF
            .captures_iter(text)
            .filter_map(|captures| captures.name("url").map(|found| found.as_str().to_string()))
            .collect::<BTreeSet<_>>();
        let mut citations = BTreeMap::new();
        for url in urls {
            let Some(metadata) = self.metadata(&url) else {
                continue;
            };
            let Some(raw_title) = metadata.title.as_deref() else {
                tracing::debug!(url = url.as_str(), "no title for reference");
                continue;
            };
            if is_bad_title(raw_title, &url) {
                tracing::info!(url = url.as_str(), title = raw_title, "skipping blacklisted title");
                continue;
            }
            let title = clean_title(raw_title);
            let citation = cite_web(&url, &metadata, &title, self.access_date.as_deref());
            citations.insert(url, citation);
        }

        let mut converted = 0;
        let updated = textlib::replace_except_with(
            text,
            &BARE_REF,
            DISABLED_PARTS,
            None,
            |captures: &Captures| {
                let whole = captures.get(0).map_or("", |found| found.as_str()).to_string();
                let url = captures.name("url").map_or("", |found| found.as_str());
                let attrs = captures.name("attrs").map_or("", |found| found.as_str());
                match citations.get(url) {
                    Some(citation) => {
                        converted += 1;
                        format!("<ref{attrs}>{citation}</ref>")
                    }
                    None => whole,
                }
            },
        );
        (updated, converted)
    }
}

impl<S: CitationSource> PageTransform for RefLinks<S> {
    fn summary(&self) -> String {
        "Filling in bare references".to_string()
    }

    fn transform(&mut self, _site: &mut Site, page: &mut Page, text: &str) -> Result<Option<String>> {
        let (converted_text, converted) = self.convert(text);
        let merged = merge_duplicate_refs(&converted_text);
        tracing::debug!(title = %page.title(), converted, "references processed");
        Ok((merged != text).then_some(merged))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::error::WikiError;
    use crate::testing::{MockTransport, mock_site};

    #[derive(Default)]
    struct FakeSource {
        titles: HashMap<String, String>,
        lookups: usize,
    }

    impl CitationSource for FakeSource {
        fn lookup(&mut self, url: &str) -> Result<Option<CitationMetadata>> {
            self.lookups += 1;
            if url.contains("broken") {
                return Err(WikiError::HttpStatus {
                    status: 500,
                    url: url.to_string(),
                });
            }
            Ok(self.titles.get(url).map(|title| CitationMetadata {
                title: Some(title.clone()),
                website: Some("Example".to_string()),
                date: Some("2020-05-01".to_string()),
                access_date: None,
                url: Some(url.to_string()),
            }))
        }
    }

    fn source(entries: &[(&str, &str)]) -> FakeSource {
        FakeSource {
            titles: entries
                .iter()
                .map(|(url, title)| (url.to_string(), title.to_string()))
                .collect(),
            lookups: 0,
        }
    }

    #[test]
    fn clean_title_escapes_and_truncates() {
        assert_eq!(clean_title("  A |\n title [x] "), "A &#124; title &#91;x&#93;");
        let long = "word ".repeat(60);
        let cleaned = clean_title(&long);
        assert!(cleaned.ends_with("..."));
        assert!(cleaned.chars().count() <= MAX_TITLE_CHARS + 3);
    }

    #[test]
    fn bad_titles_are_detected() {
        assert!(is_bad_title("404 Not Found", "https://x.test"));
        assert!(is_bad_title("Log in to continue", "https://x.test"));
        assert!(is_bad_title("https://x.test/a", "https://x.test/a"));
        assert!(!is_bad_title("Rust 1.80 released", "https://x.test"));
    }

    #[test]
    fn converts_bare_refs_and_skips_failures() {
        let mut reflinks = RefLinks::new(source(&[
            ("https://example.org/a", "Article A"),
            ("https://example.org/missing", "Page not found"),
        ]))
        .with_access_date("2026-10-17");
        let text = "One.<ref>https://example.org/a</ref> Two.<ref>[https://example.org/missing]</ref> \
                    Three.<ref>https://broken.test/x</ref> <!-- <ref>https://example.org/a</ref> -->";
        let (updated, converted) = reflinks.convert(text);
        assert_eq!(converted, 1);
        assert!(updated.contains(
            "<ref>{{cite web |url=https://example.org/a |title=Article A |website=Example |date=2020-05-01 |access-date=2026-10-17}}</ref>"
        ));
        assert!(updated.contains("<ref>[https://example.org/missing]</ref>"));
        assert!(updated.contains("<ref>https://broken.test/x</ref>"));
        assert!(updated.contains("<!-- <ref>https://example.org/a</ref> -->"));
        assert_eq!(reflinks.source.lookups, 3);
    }

    #[test]
    fn duplicates_get_autogenerated_names() {
        let text = "A<ref>Same</ref> B<ref>Same</ref> C<ref name=\"autogenerated1\">Other</ref>";
        assert_eq!(
            merge_duplicate_refs(text),
            "A<ref name=\"autogenerated2\">Same</ref> B<ref name=\"autogenerated2\" /> C<ref name=\"autogenerated1\">Other</ref>"
        );
    }

    #[test]
    fn duplicates_reuse_existing_name() {
        let text = "A<ref name=smith>Smith 2001</ref> B<ref>Smith 2001</ref>";
        assert_eq!(
            merge_duplicate_refs(text),
            "A<ref name=\"smith\">Smith 2001</ref> B<ref name=\"smith\" />"
        );
        let grouped = "A<ref group=n>Note</ref> B<ref group=n>Note</ref>";
        assert_eq!(merge_duplicate_refs(grouped), grouped);
    }

    #[test]
    fn transform_reports_no_change_for_clean_pages() {
        let transport = MockTransport::new();
        let mut site = mock_site(&transport);
        let mut page = site.page("Alpha").expect("page");
        let mut reflinks = RefLinks::new(source(&[]));
        let result = reflinks
            .transform(&mut site, &mut page, "No references here.")
            .expect("transform");
        assert_eq!(result, None);
        assert_eq!(transport.requests().len(), 0);
    }
}
