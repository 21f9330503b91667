pub mod add_text;
pub mod category;
pub mod reflinks;

use anyhow::{Context, Result};
use serde::Serialize;
use similar::TextDiff;

use crate::error::{self, WikiError};
use crate::namespace::{NS_CATEGORY, NS_MAIN};
use crate::page::{Page, SaveOptions};
use crate::site::{MemberType, RedirectFilter, Site};
use crate::title::Title;

#[derive(Debug, Clone, Default)]
pub struct BotOptions {
    /// Compute changes and diffs but never save.
    pub dry_run: bool,
    /// Overrides the transform's own summary.
    pub summary: Option<String>,
    /// Prepended to every edit summary.
    pub summary_prefix: Option<String>,
    pub minor: bool,
    /// Stop after this many pages.
    pub limit: Option<usize>,
    pub show_diff: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageSource {
    Titles(Vec<String>),
    /// Members of a category; `recurse` descends that many subcategory
    /// levels.
    Category {
        name: String,
        recurse: Option<usize>,
    },
    Search {
        query: String,
        namespaces: Vec<i32>,
    },
    LinksTo(String),
    TransclusionsOf(String),
    Prefix {
        prefix: String,
        namespace: i32,
    },
}

/// Titles a source yields, in order and without duplicates.
pub fn resolve_pages(
    site: &mut Site,
    source: &PageSource,
    limit: Option<usize>,
) -> error::Result<Vec<Title>> {
    let titles = match source {
        PageSource::Titles(raw) => raw
            .iter()
            .map(|title| site.parse_title(title))
            .collect::<error::Result<Vec<_>>>()?,
        PageSource::Category { name, recurse } => {
            let category = site.category(name)?;
            let mut categories = vec![category.title().clone()];
            if let Some(depth) = recurse {
                categories.extend(category.subcategories(site, *depth)?);
            }
            let mut titles = Vec::new();
            for current in categories {
                let members = site.category_members(
                    &current,
                    &[MemberType::Page, MemberType::File],
                    &[],
                    limit.map(|limit| limit.saturating_sub(titles.len())),
                )?;
                titles.extend(members);
                if limit.is_some_and(|limit| titles.len() >= limit) {
                    break;
                }
            }
            titles
        }
        PageSource::Search { query, namespaces } => site
            .search(query, namespaces, limit)?
            .iter()
            .map(|hit| site.parse_title(&hit.title))
            .collect::<error::Result<Vec<_>>>()?,
        PageSource::LinksTo(target) => {
            let target = site.parse_title(target)?;
            site.backlinks(&target, RedirectFilter::All, &[], limit)?
        }
        PageSource::TransclusionsOf(template) => {
            let template = site.parse_title(template)?;
            let template = if template.namespace() == NS_MAIN {
                site.parse_title(&format!("Template:{}", template.text()))?
            } else {
                template
            };
            site.embedded_in(&template, &[], limit)?
        }
        PageSource::Prefix { prefix, namespace } => site.prefix_index(prefix, *namespace, limit)?,
    };

    let mut seen = std::collections::BTreeSet::new();
    let mut unique = titles
        .into_iter()
        .filter(|title| seen.insert(title.clone()))
        .collect::<Vec<_>>();
    if let Some(limit) = limit {
        unique.truncate(limit);
    }
    Ok(unique)
}

/// One rewrite applied page by page by [`run_bot`].
pub trait PageTransform {
    fn summary(&self) -> String;

    /// New text for `page`, or `None` to leave it alone.
    fn transform(&mut self, site: &mut Site, page: &mut Page, text: &str)
    -> error::Result<Option<String>>;

    /// Whether missing pages are created from empty text instead of skipped.
    fn create_missing(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PageStatus {
    Saved { revid: Option<i64> },
    /// Changed, but not saved because of a dry run.
    WouldSave,
    Unchanged,
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageOutcome {
    pub title: String,
    #[serde(flatten)]
    pub status: PageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BotReport {
    pub processed: usize,
    pub saved: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub outcomes: Vec<PageOutcome>,
}

impl BotReport {
    fn record(&mut self, title: &Title, status: PageStatus, diff: Option<String>) {
        self.processed += 1;
        match &status {
            PageStatus::Saved { .. } | PageStatus::WouldSave => self.saved += 1,
            PageStatus::Unchanged => self.unchanged += 1,
            PageStatus::Skipped { .. } => self.skipped += 1,
        }
        self.outcomes.push(PageOutcome {
            title: title.full_title(),
            status,
            diff,
        });
    }

    /// Titles that were saved, or would have been in a dry run.
    pub fn changed_titles(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|outcome| {
                matches!(
                    outcome.status,
                    PageStatus::Saved { .. } | PageStatus::WouldSave
                )
            })
            .map(|outcome| outcome.title.as_str())
    }
}

/// Errors that end work on one page but not the run.
fn is_page_level(error: &WikiError) -> bool {
    matches!(
        error,
        WikiError::NoPage(_)
            | WikiError::LockedPage { .. }
            | WikiError::EditConflict(_)
            | WikiError::PageDeletedConflict(_)
            | WikiError::SpamBlacklist { .. }
            | WikiError::AbuseFilter { .. }
            | WikiError::IsRedirectPage(_)
    )
}

pub fn unified_diff(title: &str, old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(title, title)
        .to_string()
}

pub fn run_bot(
    site: &mut Site,
    titles: &[Title],
    transform: &mut dyn PageTransform,
    options: &BotOptions,
) -> Result<BotReport> {
    let mut summary = options
        .summary
        .clone()
        .unwrap_or_else(|| transform.summary());
    if let Some(prefix) = options.summary_prefix.as_deref().filter(|prefix| !prefix.is_empty()) {
        summary = format!("{prefix} {summary}");
    }
    let save_options = SaveOptions {
        minor: options.minor,
        bot: true,
        ..SaveOptions::default()
    };
    let mut report = BotReport::default();

    for title in titles {
        if options.limit.is_some_and(|limit| report.processed >= limit) {
            tracing::info!(limit = ?options.limit, "page limit reached");
            break;
        }
        let mut page = Page::new(title.clone());
        let text = match page.get(site, false) {
            Ok(text) => text,
            Err(WikiError::NoPage(_)) if transform.create_missing() => String::new(),
            Err(error) if is_page_level(&error) => {
                tracing::warn!(title = %title, %error, "skipping page");
                report.record(title, PageStatus::Skipped { reason: error.to_string() }, None);
                continue;
            }
            Err(error) => {
                return Err(error).with_context(|| format!("failed to load [[{title}]]"));
            }
        };

        let new_text = match transform.transform(site, &mut page, &text) {
            Ok(Some(new_text)) if new_text != text => new_text,
            Ok(_) => {
                tracing::debug!(title = %title, "no changes");
                report.record(title, PageStatus::Unchanged, None);
                continue;
            }
            Err(error) if is_page_level(&error) => {
                tracing::warn!(title = %title, %error, "skipping page");
                report.record(title, PageStatus::Skipped { reason: error.to_string() }, None);
                continue;
            }
            Err(error) => {
                return Err(error).with_context(|| format!("failed to transform [[{title}]]"));
            }
        };

        let full_title = title.full_title();
        let diff = unified_diff(&full_title, &text, &new_text);
        if options.show_diff {
            tracing::info!(title = full_title.as_str(), "diff:\n{diff}");
        }
        let diff = (options.show_diff || options.dry_run).then_some(diff);

        if options.dry_run {
            tracing::info!(title = full_title.as_str(), "dry run, not saving");
            report.record(title, PageStatus::WouldSave, diff);
            continue;
        }
        match page.save(site, &new_text, &summary, &save_options) {
            Ok(result) if result.nochange => report.record(title, PageStatus::Unchanged, diff),
            Ok(result) => {
                tracing::info!(title = full_title.as_str(), revid = ?result.new_revid, "saved");
                report.record(title, PageStatus::Saved { revid: result.new_revid }, diff);
            }
            Err(error) if is_page_level(&error) => {
                tracing::warn!(title = full_title.as_str(), %error, "save failed");
                report.record(title, PageStatus::Skipped { reason: error.to_string() }, diff);
            }
            Err(error) => {
                return Err(error).with_context(|| format!("failed to save [[{full_title}]]"));
            }
        }
    }

    tracing::info!(
        processed = report.processed,
        saved = report.saved,
        skipped = report.skipped,
        "bot run finished"
    );
    Ok(report)
}

/// Category members of every type, for scripts that recategorize.
pub(crate) fn all_members(site: &mut Site, category: &Title) -> error::Result<Vec<Title>> {
    site.category_members(
        category,
        &[MemberType::Page, MemberType::Subcat, MemberType::File],
        &[],
        None,
    )
}

pub(crate) fn category_title(site: &Site, name: &str) -> error::Result<Title> {
    let title = site.parse_title(name)?;
    if title.namespace() == NS_CATEGORY {
        return Ok(title);
    }
    site.parse_title(&format!("Category:{}", title.full_title()))
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::testing::{MockTransport, mock_site};

    struct Append(&'static str);

    impl PageTransform for Append {
        fn summary(&self) -> String {
            "append".to_string()
        }

        fn transform(
            &mut self,
            _site: &mut Site,
            _page: &mut Page,
            text: &str,
        ) -> error::Result<Option<String>> {
            if text.ends_with(self.0) {
                return Ok(None);
            }
            Ok(Some(format!("{text}{}", self.0)))
        }
    }

    fn page_response(title: &str, text: &str) -> Value {
        json!({"curtimestamp": "2026-01-01T00:00:00Z", "query": {"pages": [{
            "pageid": 1, "ns": 0, "title": title, "lastrevid": 5,
            "revisions": [{"revid": 5, "parentid": 4, "timestamp": "2025-12-01T00:00:00Z",
                "slots": {"main": {"content": text}}}]
        }]}})
    }

    #[test]
    fn dry_run_records_diff_without_saving() {
        let transport = MockTransport::new();
        transport.push_json(page_response("Alpha", "Hello"));
        transport.push_json(page_response("Beta", "Hello!"));
        let mut site = mock_site(&transport);
        let titles = vec![
            site.parse_title("Alpha").expect("title"),
            site.parse_title("Beta").expect("title"),
        ];
        let options = BotOptions {
            dry_run: true,
            ..BotOptions::default()
        };
        let report = run_bot(&mut site, &titles, &mut Append("!"), &options).expect("run");
        assert_eq!(report.saved, 1);
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.outcomes[0].status, PageStatus::WouldSave);
        let diff = report.outcomes[0].diff.as_deref().expect("diff");
        assert!(diff.contains("-Hello"));
        assert!(diff.contains("+Hello!"));
        assert_eq!(transport.requests().len(), 2);
    }

    #[test]
    fn page_level_errors_do_not_abort() {
        let transport = MockTransport::new();
        transport.push_json(json!({"query": {"pages": [{"ns": 0, "title": "Gone", "missing": true}]}}));
        transport.push_json(page_response("Locked", "x"));
        transport.push_json(json!({"query": {"tokens": {"csrftoken": "t+\\"}}}));
        transport.push_json(json!({"error": {"code": "protectedpage", "info": "protected"}}));
        let mut site = mock_site(&transport);
        let titles = vec![
            site.parse_title("Gone").expect("title"),
            site.parse_title("Locked").expect("title"),
        ];
        let report = run_bot(&mut site, &titles, &mut Append("!"), &BotOptions::default())
            .expect("run");
        assert_eq!(report.skipped, 2);
        assert!(matches!(report.outcomes[1].status, PageStatus::Skipped { ref reason } if reason.contains("locked")));
    }

    #[test]
    fn other_errors_abort_the_run() {
        let transport = MockTransport::new();
        transport.push_json(json!({"error": {"code": "internal_api_error_Exception", "info": "boom"}}));
        let mut site = mock_site(&transport);
        let titles = vec![site.parse_title("Alpha").expect("title")];
        let error = run_bot(&mut site, &titles, &mut Append("!"), &BotOptions::default())
            .expect_err("abort");
        assert!(error.to_string().contains("Alpha"));
    }

    #[test]
    fn saves_and_honors_limit() {
        let transport = MockTransport::new();
        transport.push_json(page_response("Alpha", "Hello"));
        transport.push_json(json!({"query": {"tokens": {"csrftoken": "t+\\"}}}));
        transport.push_json(json!({"edit": {"result": "Success", "pageid": 1, "title": "Alpha",
            "oldrevid": 5, "newrevid": 6, "newtimestamp": "2026-01-01T00:00:01Z"}}));
        let mut site = mock_site(&transport);
        let titles = vec![
            site.parse_title("Alpha").expect("title"),
            site.parse_title("Beta").expect("title"),
        ];
        let options = BotOptions {
            limit: Some(1),
            summary: Some("custom".to_string()),
            summary_prefix: Some("Bot:".to_string()),
            ..BotOptions::default()
        };
        let report = run_bot(&mut site, &titles, &mut Append("!"), &options).expect("run");
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].status, PageStatus::Saved { revid: Some(6) });
        let edit = transport.request(2);
        assert_eq!(edit.param("summary"), Some("Bot: custom"));
        assert_eq!(edit.param("text"), Some("Hello!"));
        assert_eq!(edit.param("nocreate"), Some("1"));
    }

    #[test]
    fn resolve_category_recursively_dedupes() {
        let transport = MockTransport::new();
        transport.push_json(json!({"query": {"categorymembers": [{"ns": 14, "title": "Category:Sub"}]}}));
        transport.push_json(json!({"query": {"categorymembers": [{"ns": 0, "title": "Alpha"}]}}));
        transport.push_json(json!({"query": {"categorymembers": [
            {"ns": 0, "title": "Alpha"}, {"ns": 0, "title": "Beta"}]}}));
        let mut site = mock_site(&transport);
        let titles = resolve_pages(
            &mut site,
            &PageSource::Category {
                name: "Top".to_string(),
                recurse: Some(0),
            },
            None,
        )
        .expect("titles");
        let names = titles.iter().map(Title::full_title).collect::<Vec<_>>();
        assert_eq!(names, vec!["Alpha", "Beta"]);
        assert_eq!(transport.request(1).param("cmtitle"), Some("Category:Top"));
        assert_eq!(transport.request(2).param("cmtitle"), Some("Category:Sub"));
    }
}
