use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::{QueryGenerator, Request};
use crate::error::{Result, WikiError};
use crate::site::{EditOptions, EditResult, MoveOptions, RedirectFilter, Site};
use crate::textlib;
use crate::title::Title;

const LOAD_BATCH: usize = 50;
const MAX_REDIRECT_HOPS: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Revision {
    pub revid: i64,
    pub parentid: i64,
    pub timestamp: String,
    pub user: Option<String>,
    pub comment: Option<String>,
    pub minor: bool,
    pub size: u64,
    pub sha1: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Protection {
    pub action: String,
    pub level: String,
    pub expiry: String,
}

#[derive(Debug, Clone, Default)]
struct PageState {
    pageid: Option<i64>,
    missing: bool,
    redirect: bool,
    content_model: Option<String>,
    touched: Option<String>,
    length: u64,
    protection: Vec<Protection>,
    latest: Option<Revision>,
    start_timestamp: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    pub minor: bool,
    pub bot: bool,
    pub watchlist: Option<String>,
    pub tags: Vec<String>,
    /// Ignore the loaded state and neither force create nor nocreate.
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct Page {
    title: Title,
    state: Option<PageState>,
}

impl Page {
    pub fn new(title: Title) -> Self {
        Self {
            title,
            state: None,
        }
    }

    pub fn title(&self) -> &Title {
        &self.title
    }

    pub fn is_loaded(&self) -> bool {
        self.state.is_some()
    }

    fn loaded_text(&self) -> Option<&str> {
        self.state
            .as_ref()
            .and_then(|state| state.latest.as_ref())
            .and_then(|revision| revision.text.as_deref())
    }

    fn ensure_loaded(&mut self, site: &mut Site, with_text: bool) -> Result<&PageState> {
        let needs_text = with_text && self.loaded_text().is_none() && !self.is_missing_loaded();
        if self.state.is_none() || needs_text {
            site.load_pages(std::slice::from_mut(self), with_text)?;
        }
        self.state
            .as_ref()
            .ok_or_else(|| WikiError::Unexpected(format!("no state loaded for [[{}]]", self.title)))
    }

    fn is_missing_loaded(&self) -> bool {
        self.state.as_ref().is_some_and(|state| state.missing)
    }

    pub fn reload(&mut self, site: &mut Site) -> Result<()> {
        self.state = None;
        site.load_pages(std::slice::from_mut(self), true)
    }

    pub fn exists(&mut self, site: &mut Site) -> Result<bool> {
        Ok(!self.ensure_loaded(site, false)?.missing)
    }

    pub fn pageid(&mut self, site: &mut Site) -> Result<Option<i64>> {
        Ok(self.ensure_loaded(site, false)?.pageid)
    }

    pub fn is_redirect(&mut self, site: &mut Site) -> Result<bool> {
        Ok(self.ensure_loaded(site, false)?.redirect)
    }

    pub fn protection(&mut self, site: &mut Site) -> Result<Vec<Protection>> {
        Ok(self.ensure_loaded(site, false)?.protection.clone())
    }

    pub fn content_model(&mut self, site: &mut Site) -> Result<Option<String>> {
        Ok(self.ensure_loaded(site, false)?.content_model.clone())
    }

    /// Page text, following neither redirects nor errors on them. Fails with
    /// `NoPage` when the page does not exist.
    pub fn get(&mut self, site: &mut Site, allow_redirect: bool) -> Result<String> {
        let state = self.ensure_loaded(site, true)?;
        if state.missing {
            return Err(WikiError::NoPage(self.title.full_title()));
        }
        if state.redirect && !allow_redirect {
            return Err(WikiError::IsRedirectPage(self.title.full_title()));
        }
        Ok(self.loaded_text().unwrap_or_default().to_string())
    }

    /// Current text of an existing page, redirects included.
    pub fn text(&mut self, site: &mut Site) -> Result<String> {
        self.get(site, true)
    }

    pub fn latest_revision(&mut self, site: &mut Site) -> Result<Revision> {
        let state = self.ensure_loaded(site, true)?;
        let (missing, latest) = (state.missing, state.latest.clone());
        if missing {
            return Err(WikiError::NoPage(self.title.full_title()));
        }
        latest.ok_or_else(|| WikiError::Unexpected(format!("no revision for [[{}]]", self.title)))
    }

    pub fn touched(&mut self, site: &mut Site) -> Result<Option<String>> {
        Ok(self.ensure_loaded(site, false)?.touched.clone())
    }

    /// Page size in bytes as reported by the server.
    pub fn length(&mut self, site: &mut Site) -> Result<u64> {
        Ok(self.ensure_loaded(site, false)?.length)
    }

    /// Direct redirect target, keeping any section fragment.
    pub fn redirect_target(&mut self, site: &mut Site) -> Result<Title> {
        if !self.ensure_loaded(site, true)?.redirect {
            return Err(WikiError::IsNotRedirectPage(self.title.full_title()));
        }
        let text = self.get(site, true)?;
        let raw = textlib::redirect_target(&text)
            .ok_or_else(|| WikiError::IsNotRedirectPage(self.title.full_title()))?;
        let target = site.parse_title(&raw)?;
        if target.without_fragment() == self.title.without_fragment() {
            return Err(WikiError::CircularRedirect(self.title.full_title()));
        }
        Ok(target)
    }

    /// Follow a redirect chain to its end, failing on loops or long chains.
    pub fn final_redirect_target(&mut self, site: &mut Site) -> Result<Title> {
        let mut seen = BTreeSet::from([self.title.without_fragment().full_title()]);
        let mut target = self.redirect_target(site)?;
        for _ in 0..MAX_REDIRECT_HOPS {
            if !seen.insert(target.without_fragment().full_title()) {
                return Err(WikiError::CircularRedirect(target.full_title()));
            }
            let mut next_page = Page::new(target.without_fragment());
            match next_page.redirect_target(site) {
                Ok(next) => target = next,
                Err(WikiError::IsNotRedirectPage(_)) => return Ok(target),
                Err(error) => return Err(error),
            }
        }
        Err(WikiError::CircularRedirect(format!(
            "{} (more than {MAX_REDIRECT_HOPS} hops)",
            self.title
        )))
    }

    /// Revision history, newest first.
    pub fn revisions(
        &self,
        site: &mut Site,
        limit: Option<usize>,
        with_content: bool,
    ) -> Result<Vec<Revision>> {
        let rvprop = if with_content {
            "ids|timestamp|user|comment|flags|size|sha1|content"
        } else {
            "ids|timestamp|user|comment|flags|size|sha1"
        };
        let page_limit = limit
            .map(|limit| limit.min(if with_content { 50 } else { 500 }).to_string())
            .unwrap_or_else(|| "max".to_string());
        let request = Request::query()
            .set("titles", self.title.full_title())
            .set("prop", "revisions")
            .set("rvprop", rvprop)
            .set("rvslots", "main")
            .set("rvlimit", page_limit);
        let mut generator = QueryGenerator::pages(request, None);
        let mut revisions = Vec::new();
        'batches: while let Some(batch) = generator.next_batch(site.api_mut())? {
            for page in batch {
                if page.get("missing").is_some() {
                    return Err(WikiError::NoPage(self.title.full_title()));
                }
                for raw in page.get("revisions").and_then(Value::as_array).into_iter().flatten() {
                    revisions.push(parse_revision(raw)?);
                    if limit.is_some_and(|limit| revisions.len() >= limit) {
                        break 'batches;
                    }
                }
            }
        }
        Ok(revisions)
    }

    fn prop_titles(&self, site: &mut Site, prop: &str, extra: Request) -> Result<Vec<Title>> {
        let prefix = match prop {
            "categories" => "cl",
            "templates" => "tl",
            "links" => "pl",
            _ => "",
        };
        let request = extra
            .set("titles", self.title.full_title())
            .set("prop", prop)
            .set(&format!("{prefix}limit"), "max");
        let pages = QueryGenerator::pages(request, None).collect(site.api_mut())?;
        let mut titles = Vec::new();
        for page in &pages {
            for item in page.get(prop).and_then(Value::as_array).into_iter().flatten() {
                titles.push(site.title_of(item)?);
            }
        }
        Ok(titles)
    }

    pub fn categories(&self, site: &mut Site, include_hidden: bool) -> Result<Vec<Title>> {
        let extra = if include_hidden {
            Request::query()
        } else {
            Request::query().set("clshow", "!hidden")
        };
        self.prop_titles(site, "categories", extra)
    }

    pub fn templates(&self, site: &mut Site) -> Result<Vec<Title>> {
        self.prop_titles(site, "templates", Request::query())
    }

    pub fn links(&self, site: &mut Site, namespaces: &[i32]) -> Result<Vec<Title>> {
        let extra = Request::query()
            .set_list("plnamespace", namespaces.iter().map(ToString::to_string));
        self.prop_titles(site, "links", extra)
    }

    /// Interlanguage links as `(language code, title)` pairs.
    pub fn langlinks(&self, site: &mut Site) -> Result<Vec<(String, String)>> {
        let request = Request::query()
            .set("titles", self.title.full_title())
            .set("prop", "langlinks")
            .set("lllimit", "max");
        let pages = QueryGenerator::pages(request, None).collect(site.api_mut())?;
        let mut links = Vec::new();
        for page in &pages {
            for item in page.get("langlinks").and_then(Value::as_array).into_iter().flatten() {
                let lang = item.get("lang").and_then(Value::as_str);
                let title = item
                    .get("title")
                    .or_else(|| item.get("*"))
                    .and_then(Value::as_str);
                if let (Some(lang), Some(title)) = (lang, title) {
                    links.push((lang.to_string(), title.to_string()));
                }
            }
        }
        Ok(links)
    }

    pub fn backlinks(
        &self,
        site: &mut Site,
        filter: RedirectFilter,
        namespaces: &[i32],
        limit: Option<usize>,
    ) -> Result<Vec<Title>> {
        site.backlinks(&self.title, filter, namespaces, limit)
    }

    pub fn embedded_in(
        &self,
        site: &mut Site,
        namespaces: &[i32],
        limit: Option<usize>,
    ) -> Result<Vec<Title>> {
        site.embedded_in(&self.title, namespaces, limit)
    }

    /// Save `new_text`. Conflicts with edits or deletions made since the
    /// page was loaded are reported, not overwritten.
    pub fn save(
        &mut self,
        site: &mut Site,
        new_text: &str,
        summary: &str,
        options: &SaveOptions,
    ) -> Result<EditResult> {
        let state = self.ensure_loaded(site, true)?.clone();
        if !state.missing && self.loaded_text() == Some(new_text) {
            tracing::info!(title = %self.title, "no changes to save");
            return Ok(EditResult {
                title: self.title.full_title(),
                pageid: state.pageid,
                old_revid: state.latest.as_ref().map(|revision| revision.revid),
                new_revid: None,
                new_timestamp: None,
                nochange: true,
            });
        }

        let edit = EditOptions {
            minor: options.minor,
            bot: options.bot,
            nocreate: !options.force && !state.missing,
            createonly: !options.force && state.missing,
            basetimestamp: state.latest.as_ref().map(|revision| revision.timestamp.clone()),
            starttimestamp: state.start_timestamp.clone(),
            watchlist: options.watchlist.clone(),
            tags: options.tags.clone(),
            ..EditOptions::default()
        };
        let result = match site.edit(&self.title, new_text, summary, &edit) {
            // A nocreate edit of a page deleted since load reports missingtitle.
            Err(WikiError::NoPage(_)) if edit.nocreate => {
                Err(WikiError::PageDeletedConflict(self.title.full_title()))
            }
            other => other,
        }?;

        if let Some(state) = self.state.as_mut() {
            state.missing = false;
            state.pageid = result.pageid.or(state.pageid);
            if let Some(revid) = result.new_revid {
                state.latest = Some(Revision {
                    revid,
                    parentid: result.old_revid.unwrap_or_default(),
                    timestamp: result.new_timestamp.clone().unwrap_or_default(),
                    user: None,
                    comment: Some(summary.to_string()),
                    minor: options.minor,
                    size: new_text.len() as u64,
                    sha1: None,
                    text: Some(new_text.to_string()),
                });
            }
        }
        Ok(result)
    }

    /// Null edit: re-save the current text without creating a revision.
    pub fn touch(&mut self, site: &mut Site) -> Result<()> {
        let text = self.get(site, true)?;
        let options = EditOptions {
            nocreate: true,
            ..EditOptions::default()
        };
        site.edit(&self.title, &text, "", &options)?;
        Ok(())
    }

    pub fn purge(&self, site: &mut Site) -> Result<bool> {
        Ok(site.purge(std::slice::from_ref(&self.title))? > 0)
    }

    pub fn move_to(
        &mut self,
        site: &mut Site,
        target: &Title,
        reason: &str,
        options: &MoveOptions,
    ) -> Result<Page> {
        let moved = site.move_page(&self.title, target, reason, options)?;
        self.state = None;
        Ok(Page::new(moved))
    }

    pub fn delete(&mut self, site: &mut Site, reason: &str) -> Result<()> {
        site.delete_page(&self.title, reason)?;
        self.state = None;
        Ok(())
    }

    pub fn protect(
        &mut self,
        site: &mut Site,
        protections: &[(String, String)],
        expiry: &str,
        reason: &str,
    ) -> Result<()> {
        site.protect_page(&self.title, protections, expiry, reason, false)?;
        self.state = None;
        Ok(())
    }

    pub fn watch(&self, site: &mut Site, unwatch: bool) -> Result<()> {
        site.watch(std::slice::from_ref(&self.title), unwatch)
    }

    /// The talk page of a subject page, or the subject page of a talk page.
    pub fn toggle_talk_page(&self, site: &Site) -> Result<Page> {
        let namespaces = site.namespaces();
        let toggled = if self.title.is_talk() {
            self.title.subject_page(namespaces)
        } else {
            self.title.talk_page(namespaces)
        };
        toggled
            .map(Page::new)
            .ok_or_else(|| WikiError::InvalidTitle(format!("{} has no talk page", self.title)))
    }

    fn apply(&mut self, raw: &Value, server_time: Option<&str>, with_text: bool) -> Result<()> {
        if raw.get("invalid").is_some() {
            let reason = raw
                .get("invalidreason")
                .and_then(Value::as_str)
                .unwrap_or("invalid title");
            return Err(WikiError::InvalidTitle(format!("{}: {reason}", self.title)));
        }
        let info: RawPageInfo = serde_json::from_value(raw.clone())?;
        let latest = match raw
            .get("revisions")
            .and_then(Value::as_array)
            .and_then(|revisions| revisions.first())
        {
            Some(revision) => Some(parse_revision(revision)?),
            None => None,
        };
        let previous_text = if with_text {
            None
        } else {
            self.loaded_text().map(ToString::to_string)
        };
        let mut state = PageState {
            pageid: info.pageid.filter(|id| *id > 0),
            missing: info.missing,
            redirect: info.redirect,
            content_model: info.contentmodel,
            touched: info.touched,
            length: info.length,
            protection: info
                .protection
                .into_iter()
                .map(|raw| Protection {
                    action: raw.kind,
                    level: raw.level,
                    expiry: raw.expiry,
                })
                .collect(),
            latest,
            start_timestamp: server_time.map(ToString::to_string),
        };
        if let (Some(text), Some(latest)) = (previous_text, state.latest.as_mut())
            && latest.text.is_none()
        {
            latest.text = Some(text);
        }
        self.state = Some(state);
        Ok(())
    }
}

impl Site {
    pub fn page(&self, raw_title: &str) -> Result<Page> {
        Ok(Page::new(self.parse_title(raw_title)?))
    }

    /// Load page info (and latest revision text when `with_text`) for many
    /// pages, 50 titles per request.
    pub fn load_pages(&mut self, pages: &mut [Page], with_text: bool) -> Result<()> {
        let rvprop = if with_text {
            "ids|timestamp|user|comment|flags|size|sha1|content"
        } else {
            "ids|timestamp|user|comment|flags|size|sha1"
        };
        for batch in pages.chunks_mut(LOAD_BATCH) {
            let request = Request::query()
                .set_list("titles", batch.iter().map(|page| page.title.full_title()))
                .set("prop", "info|revisions")
                .set("inprop", "protection")
                .set("rvprop", rvprop)
                .set("rvslots", "main")
                .set("curtimestamp", "1");
            let mut generator = QueryGenerator::pages(request, None);
            let mut results = Vec::new();
            while let Some(found) = generator.next_batch(self.api_mut())? {
                results.extend(found);
            }

            for page in batch.iter_mut() {
                let mut wanted = page.title.without_fragment().full_title();
                if let Some((_, to)) = generator
                    .normalized()
                    .iter()
                    .find(|(from, _)| *from == wanted)
                {
                    wanted = to.clone();
                }
                let raw = results.iter().find(|raw| {
                    raw.get("title").and_then(Value::as_str).is_some_and(|title| {
                        title == wanted
                            || self
                                .parse_title(title)
                                .is_ok_and(|parsed| parsed.full_title() == wanted)
                    })
                });
                match raw {
                    Some(raw) => page.apply(raw, generator.server_time(), with_text)?,
                    None => {
                        tracing::warn!(title = %page.title, "page missing from load response");
                        page.state = Some(PageState {
                            missing: true,
                            start_timestamp: generator.server_time().map(ToString::to_string),
                            ..PageState::default()
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn parse_revision(raw: &Value) -> Result<Revision> {
    let parsed: RawRevision = serde_json::from_value(raw.clone())?;
    let text = raw
        .get("slots")
        .and_then(|slots| slots.get("main"))
        .and_then(|main| main.get("content").or_else(|| main.get("*")))
        .or_else(|| raw.get("content"))
        .or_else(|| raw.get("*"))
        .and_then(Value::as_str)
        .map(ToString::to_string);
    Ok(Revision {
        revid: parsed.revid,
        parentid: parsed.parentid,
        timestamp: parsed.timestamp,
        user: parsed.user,
        comment: parsed.comment,
        minor: parsed.minor,
        size: parsed.size,
        sha1: parsed.sha1,
        text,
    })
}

#[derive(Debug, Deserialize)]
struct RawRevision {
    #[serde(default)]
    revid: i64,
    #[serde(default)]
    parentid: i64,
    #[serde(default)]
    timestamp: String,
    user: Option<String>,
    comment: Option<String>,
    #[serde(default)]
    minor: bool,
    #[serde(default)]
    size: u64,
    sha1: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPageInfo {
    pageid: Option<i64>,
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    redirect: bool,
    contentmodel: Option<String>,
    touched: Option<String>,
    #[serde(default)]
    length: u64,
    #[serde(default)]
    protection: Vec<RawProtection>,
}

#[derive(Debug, Deserialize)]
struct RawProtection {
    #[serde(rename = "type")]
    kind: String,
    level: String,
    #[serde(default)]
    expiry: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::{MockTransport, mock_site};

    fn loaded(title: &str, revid: i64, text: &str) -> Value {
        json!({
            "batchcomplete": true,
            "curtimestamp": "2026-03-01T12:00:00Z",
            "query": {"pages": [{
                "pageid": 10, "ns": 0, "title": title, "contentmodel": "wikitext",
                "protection": [{"type": "edit", "level": "autoconfirmed", "expiry": "infinity"}],
                "revisions": [{
                    "revid": revid, "parentid": revid - 1, "timestamp": "2026-02-01T00:00:00Z",
                    "user": "Alice", "comment": "c",
                    "slots": {"main": {"contentmodel": "wikitext", "content": text}}
                }]
            }]}
        })
    }

    #[test]
    fn load_pages_maps_normalized_and_missing() {
        let transport = MockTransport::new();
        transport.push_json(json!({
            "batchcomplete": true,
            "query": {
                "normalized": [{"from": "Foo bar", "to": "Foo Bar"}],
                "pages": [
                    {"pageid": 3, "ns": 0, "title": "Foo Bar", "redirect": true,
                     "revisions": [{"revid": 9, "timestamp": "2026-01-01T00:00:00Z"}]},
                    {"ns": 0, "title": "Nothing", "missing": true}
                ]
            }
        }));
        let mut site = mock_site(&transport);
        let mut pages = vec![
            site.page("Foo bar").expect("title"),
            site.page("Nothing").expect("title"),
        ];
        site.load_pages(&mut pages, false).expect("load");
        assert_eq!(transport.request(0).param("titles"), Some("Foo bar|Nothing"));
        assert!(pages[0].exists(&mut site).expect("exists"));
        assert!(pages[0].is_redirect(&mut site).expect("redirect"));
        assert!(!pages[1].exists(&mut site).expect("exists"));
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn get_reports_missing_and_redirects() {
        let transport = MockTransport::new();
        transport.push_json(json!({"query": {"pages": [{"ns": 0, "title": "Gone", "missing": true}]}}));
        let mut site = mock_site(&transport);
        let mut page = site.page("Gone").expect("title");
        assert!(matches!(page.get(&mut site, false), Err(WikiError::NoPage(_))));
        assert!(matches!(page.text(&mut site), Err(WikiError::NoPage(_))));
        assert!(!page.exists(&mut site).expect("exists"));
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn save_sends_timestamps_and_nocreate() {
        let transport = MockTransport::new();
        transport.push_json(loaded("Foo", 100, "old"));
        transport.push_json(json!({"query": {"tokens": {"csrftoken": "t+\\"}}}));
        transport.push_json(json!({"edit": {"result": "Success", "pageid": 10, "title": "Foo",
            "oldrevid": 100, "newrevid": 101, "newtimestamp": "2026-03-01T12:01:00Z"}}));
        let mut site = mock_site(&transport);
        let mut page = site.page("Foo").expect("title");
        let text = page.text(&mut site).expect("text");
        let result = page
            .save(&mut site, &format!("{text} new"), "append", &SaveOptions::default())
            .expect("save");
        assert_eq!(result.new_revid, Some(101));

        let edit = transport.request(2);
        assert_eq!(edit.param("text"), Some("old new"));
        assert_eq!(edit.param("basetimestamp"), Some("2026-02-01T00:00:00Z"));
        assert_eq!(edit.param("starttimestamp"), Some("2026-03-01T12:00:00Z"));
        assert_eq!(edit.param("nocreate"), Some("1"));
        let latest = page.latest_revision(&mut site).expect("rev");
        assert_eq!(latest.revid, 101);
        assert_eq!(latest.text.as_deref(), Some("old new"));
    }

    #[test]
    fn save_without_changes_skips_request() {
        let transport = MockTransport::new();
        transport.push_json(loaded("Foo", 100, "same"));
        let mut site = mock_site(&transport);
        let mut page = site.page("Foo").expect("title");
        let result = page
            .save(&mut site, "same", "noop", &SaveOptions::default())
            .expect("save");
        assert!(result.nochange);
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn save_detects_deletion_since_load() {
        let transport = MockTransport::new();
        transport.push_json(loaded("Foo", 100, "old"));
        transport.push_json(json!({"query": {"tokens": {"csrftoken": "t+\\"}}}));
        transport.push_json(json!({"error": {"code": "missingtitle", "info": "gone"}}));
        let mut site = mock_site(&transport);
        let mut page = site.page("Foo").expect("title");
        page.text(&mut site).expect("text");
        let error = page
            .save(&mut site, "new", "edit", &SaveOptions::default())
            .expect_err("deleted");
        assert!(matches!(error, WikiError::PageDeletedConflict(_)));
    }

    #[test]
    fn redirect_targets_and_loops() {
        let transport = MockTransport::new();
        let redirect = |title: &str, target: &str| {
            json!({"query": {"pages": [{"pageid": 1, "ns": 0, "title": title, "redirect": true,
                "revisions": [{"revid": 1, "timestamp": "t",
                    "slots": {"main": {"content": format!("#REDIRECT [[{target}]]")}}}]}]}})
        };
        transport.push_json(redirect("A", "B#Part"));
        let mut site = mock_site(&transport);
        let mut page = site.page("A").expect("title");
        let target = page.redirect_target(&mut site).expect("target");
        assert_eq!(target.full_title(), "B");
        assert_eq!(target.fragment(), Some("Part"));

        transport.push_json(redirect("X", "Y"));
        transport.push_json(redirect("Y", "X"));
        let mut page = site.page("X").expect("title");
        let error = page.final_redirect_target(&mut site).expect_err("loop");
        assert!(matches!(error, WikiError::CircularRedirect(_)));

        transport.push_json(json!({"query": {"pages": [{"pageid": 2, "ns": 0, "title": "Plain"}]}}));
        let mut page = site.page("Plain").expect("title");
        assert!(matches!(
            page.redirect_target(&mut site),
            Err(WikiError::IsNotRedirectPage(_))
        ));
    }

    #[test]
    fn revisions_respect_limit_and_categories_hide_hidden() {
        let transport = MockTransport::new();
        transport.push_json(json!({
            "continue": {"rvcontinue": "2", "continue": "||"},
            "query": {"pages": [{"pageid": 1, "ns": 0, "title": "Foo",
                "revisions": [{"revid": 4, "timestamp": "t4"}, {"revid": 3, "timestamp": "t3"}]}]}
        }));
        transport.push_json(json!({"batchcomplete": true,
            "query": {"pages": [{"pageid": 1, "ns": 0, "title": "Foo",
                "revisions": [{"revid": 2, "timestamp": "t2"}, {"revid": 1, "timestamp": "t1"}]}]}
        }));
        transport.push_json(json!({"batchcomplete": true, "query": {"pages": [{"pageid": 1, "ns": 0,
            "title": "Foo", "categories": [{"ns": 14, "title": "Category:Bar"}]}]}}));
        let mut site = mock_site(&transport);
        let page = site.page("Foo").expect("title");
        let revisions = page.revisions(&mut site, Some(3), false).expect("revisions");
        assert_eq!(
            revisions.iter().map(|revision| revision.revid).collect::<Vec<_>>(),
            vec![4, 3, 2]
        );
        let categories = page.categories(&mut site, false).expect("categories");
        assert_eq!(categories[0].full_title(), "Category:Bar");
        assert_eq!(transport.request(2).param("clshow"), Some("!hidden"));
    }

    #[test]
    fn toggle_talk_page_round_trips() {
        let transport = MockTransport::new();
        let site = mock_site(&transport);
        let page = site.page("User:Example").expect("title");
        let talk = page.toggle_talk_page(&site).expect("talk");
        assert_eq!(talk.title().full_title(), "User talk:Example");
        let back = talk.toggle_talk_page(&site).expect("subject");
        assert_eq!(back.title().full_title(), "User:Example");
    }
}
