use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::{Api, ApiOptions, QueryGenerator, Request};
use crate::cache::ResponseCache;
use crate::config::BotConfig;
use crate::error::{Result, WikiError};
use crate::family::Family;
use crate::http::{HttpTransport, Transport};
use crate::login::{self, Credentials, TokenKind, TokenWallet, UserInfo};
use crate::namespace::NamespaceMap;
use crate::title::Title;

const SITEINFO_CACHE: Duration = Duration::from_secs(30 * 24 * 3600);
const TITLE_BATCH: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SiteInfo {
    pub sitename: String,
    pub mainpage: String,
    pub lang: String,
    pub generator: String,
    pub server: String,
    pub articlepath: String,
    pub scriptpath: String,
    pub readonly: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberType {
    Page,
    Subcat,
    File,
}

impl MemberType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::Subcat => "subcat",
            Self::File => "file",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectFilter {
    #[default]
    All,
    Redirects,
    NonRedirects,
}

impl RedirectFilter {
    fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Redirects => "redirects",
            Self::NonRedirects => "nonredirects",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecentChangesFilter {
    pub namespaces: Vec<i32>,
    /// ISO 8601 timestamp; only changes at or after it.
    pub since: Option<String>,
    pub user: Option<String>,
    pub types: Vec<String>,
    pub show: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentChange {
    pub title: String,
    pub change_type: String,
    pub revid: i64,
    pub old_revid: i64,
    pub timestamp: String,
    pub user: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub title: String,
    pub namespace: i32,
    pub page_id: i64,
    pub word_count: Option<u64>,
    pub snippet: String,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contribution {
    pub title: String,
    pub revid: i64,
    pub parentid: i64,
    pub timestamp: String,
    pub comment: Option<String>,
    pub size_diff: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct EditOptions {
    pub minor: bool,
    pub bot: bool,
    pub nocreate: bool,
    pub createonly: bool,
    pub recreate: bool,
    pub section: Option<String>,
    /// Timestamp of the revision the edit is based on.
    pub basetimestamp: Option<String>,
    /// Time the text was loaded; detects deletions since.
    pub starttimestamp: Option<String>,
    pub watchlist: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EditResult {
    pub title: String,
    pub pageid: Option<i64>,
    pub old_revid: Option<i64>,
    pub new_revid: Option<i64>,
    pub new_timestamp: Option<String>,
    pub nochange: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MoveOptions {
    pub move_talk: bool,
    pub move_subpages: bool,
    pub no_redirect: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BlockOptions {
    pub nocreate: bool,
    pub autoblock: bool,
    pub noemail: bool,
    pub allow_usertalk: bool,
    pub reblock: bool,
}

pub struct Site {
    family: Family,
    code: String,
    api: Api,
    tokens: TokenWallet,
    namespaces: NamespaceMap,
    info: Option<SiteInfo>,
    user: Option<UserInfo>,
    credentials: Option<Credentials>,
}

impl Site {
    /// Site from configuration, talking HTTP.
    pub fn from_config(config: &BotConfig) -> Result<Self> {
        let family_name = config.family();
        let family = match config.api_url() {
            Some(api_url) => Family::custom(&family_name, &api_url)?,
            None => Family::builtin(&family_name)?,
        };
        let code = match config.api_url() {
            Some(_) => family.default_code(),
            None => config.code(),
        };
        let settings = config.http_settings();
        let transport = HttpTransport::new(settings.clone())?;
        let mut site = Self::with_transport(
            family,
            &code,
            Box::new(transport),
            ApiOptions::from_settings(&settings),
        )?;
        if let Some(path) = &config.cache.path {
            let cache = ResponseCache::open(path)?;
            let max_age = Duration::from_secs(config.cache_expiry_hours() * 3600);
            let purged = cache.purge_expired(max_age)?;
            if purged > 0 {
                tracing::debug!(purged, "dropped expired cache entries");
            }
            site.api.set_cache(cache);
        }
        if let (Some(username), Some(password)) = (config.username(), config.password()) {
            site.credentials = Some(Credentials::new(&username, &password));
        }
        Ok(site)
    }

    pub fn with_transport(
        family: Family,
        code: &str,
        transport: Box<dyn Transport>,
        options: ApiOptions,
    ) -> Result<Self> {
        let api_url = family.api_url(code)?;
        Ok(Self {
            family,
            code: code.to_string(),
            api: Api::new(&api_url, transport, options),
            tokens: TokenWallet::default(),
            namespaces: NamespaceMap::builtin(),
            info: None,
            user: None,
            credentials: None,
        })
    }

    pub fn set_credentials(&mut self, credentials: Option<Credentials>) {
        self.credentials = credentials;
    }

    pub fn set_cache(&mut self, cache: ResponseCache) {
        self.api.set_cache(cache);
    }

    pub fn family(&self) -> &Family {
        &self.family
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn api_url(&self) -> &str {
        self.api.api_url()
    }

    pub fn request_count(&self) -> usize {
        self.api.request_count()
    }

    pub(crate) fn api_mut(&mut self) -> &mut Api {
        &mut self.api
    }

    pub fn load_siteinfo(&mut self) -> Result<SiteInfo> {
        if let Some(info) = &self.info {
            return Ok(info.clone());
        }
        let payload = self.api.submit(
            &Request::query()
                .set("meta", "siteinfo")
                .set("siprop", "general|namespaces|namespacealiases")
                .cache_for(SITEINFO_CACHE),
        )?;
        let query = payload
            .get("query")
            .ok_or_else(|| WikiError::Unexpected("siteinfo response has no query".to_string()))?;
        let general: RawGeneral = query
            .get("general")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        if let Some(namespaces) = NamespaceMap::from_siteinfo(query) {
            self.namespaces = namespaces;
        }
        let info = SiteInfo {
            sitename: general.sitename,
            mainpage: general.mainpage,
            lang: general.lang,
            generator: general.generator,
            server: general.server,
            articlepath: general.articlepath,
            scriptpath: general.scriptpath,
            readonly: general.readonly,
        };
        self.info = Some(info.clone());
        Ok(info)
    }

    pub fn site_name(&mut self) -> Result<String> {
        Ok(self.load_siteinfo()?.sitename)
    }

    pub fn main_page(&mut self) -> Result<Title> {
        let main = self.load_siteinfo()?.mainpage;
        self.parse_title(&main)
    }

    /// Content language, falling back to the site code before siteinfo
    /// reports one.
    pub fn lang(&mut self) -> Result<String> {
        let lang = self.load_siteinfo()?.lang;
        Ok(if lang.is_empty() { self.code.clone() } else { lang })
    }

    pub fn namespaces(&self) -> &NamespaceMap {
        &self.namespaces
    }

    pub fn parse_title(&self, raw: &str) -> Result<Title> {
        Title::parse(raw, &self.namespaces)
    }

    pub(crate) fn title_of(&self, item: &Value) -> Result<Title> {
        let raw = item
            .get("title")
            .and_then(Value::as_str)
            .ok_or_else(|| WikiError::Unexpected(format!("item without title: {item}")))?;
        self.parse_title(raw)
    }

    fn titles_of(&self, items: &[Value]) -> Vec<Title> {
        items
            .iter()
            .filter_map(|item| match self.title_of(item) {
                Ok(title) => Some(title),
                Err(error) => {
                    tracing::warn!(%error, "skipping unparseable title");
                    None
                }
            })
            .collect()
    }

    pub fn login(&mut self) -> Result<UserInfo> {
        let credentials = self.credentials.clone().ok_or_else(|| WikiError::NoUsername {
            site: format!("{}:{}", self.family.name, self.code),
        })?;
        self.tokens.clear();
        self.api.set_assert_user(false);
        let user = login::login(&mut self.api, &credentials)?;
        self.api.set_assert_user(true);
        self.user = Some(user.clone());
        Ok(user)
    }

    pub fn logout(&mut self) -> Result<()> {
        login::logout(&mut self.api, &mut self.tokens)?;
        self.api.set_assert_user(false);
        self.user = None;
        Ok(())
    }

    /// Current user, loading anonymous user info when not logged in.
    pub fn user(&mut self) -> Result<UserInfo> {
        if let Some(user) = &self.user {
            return Ok(user.clone());
        }
        let user = login::fetch_user_info(&mut self.api)?;
        self.user = Some(user.clone());
        Ok(user)
    }

    pub fn is_logged_in(&self) -> bool {
        self.user.as_ref().is_some_and(|user| !user.anon)
    }

    pub fn has_right(&mut self, right: &str) -> Result<bool> {
        Ok(self.user()?.has_right(right))
    }

    pub fn require_right(&mut self, right: &str) -> Result<()> {
        let user = self.user()?;
        if user.is_blocked() {
            return Err(WikiError::UserBlocked(
                user.block_reason.unwrap_or_else(|| "blocked".to_string()),
            ));
        }
        if !user.has_right(right) {
            return Err(WikiError::PermissionDenied(format!(
                "user {} lacks the '{right}' right",
                if user.name.is_empty() { "<anonymous>" } else { &user.name }
            )));
        }
        Ok(())
    }

    pub fn token(&mut self, kind: TokenKind) -> Result<String> {
        self.tokens.get(&mut self.api, kind)
    }

    pub fn submit(&mut self, request: &Request) -> Result<Value> {
        self.api.submit(request)
    }

    /// Submit a token-bearing write, refreshing the token once if the server
    /// rejects it.
    pub fn submit_write(&mut self, request: Request, kind: TokenKind) -> Result<Value> {
        let token = self.token(kind)?;
        let request = request.write();
        match self.api.submit(&request.clone().set("token", token)) {
            Err(WikiError::BadToken) => {
                tracing::warn!(token = kind.as_str(), "token rejected, refreshing");
                self.tokens.invalidate(kind);
                let token = self.token(kind)?;
                self.api.submit(&request.set("token", token))
            }
            other => other,
        }
    }

    pub fn allpages(
        &mut self,
        prefix: Option<&str>,
        namespace: i32,
        limit: Option<usize>,
    ) -> Result<Vec<Title>> {
        let request = Request::query()
            .set("apnamespace", namespace.to_string())
            .set("apprefix", prefix.unwrap_or_default());
        let items = QueryGenerator::list(request, "allpages", "ap")
            .with_limit(limit)
            .collect(&mut self.api)?;
        Ok(self.titles_of(&items))
    }

    /// Pages whose title starts with `prefix`; the prefix may carry a
    /// namespace (`Template:Cite`), overriding `namespace`.
    pub fn prefix_index(
        &mut self,
        prefix: &str,
        namespace: i32,
        limit: Option<usize>,
    ) -> Result<Vec<Title>> {
        if prefix.contains(':')
            && let Ok(title) = self.parse_title(prefix)
            && title.namespace() != namespace
            && title.namespace() != 0
        {
            return self.allpages(Some(title.text()), title.namespace(), limit);
        }
        self.allpages(Some(prefix), namespace, limit)
    }

    pub fn category_members(
        &mut self,
        category: &Title,
        types: &[MemberType],
        namespaces: &[i32],
        limit: Option<usize>,
    ) -> Result<Vec<Title>> {
        let request = Request::query()
            .set("cmtitle", category.full_title())
            .set_list("cmtype", types.iter().map(|kind| kind.as_str()))
            .set_list("cmnamespace", namespaces.iter().map(ToString::to_string));
        let items = QueryGenerator::list(request, "categorymembers", "cm")
            .with_limit(limit)
            .collect(&mut self.api)?;
        Ok(self.titles_of(&items))
    }

    pub fn recent_changes(
        &mut self,
        filter: &RecentChangesFilter,
        limit: Option<usize>,
    ) -> Result<Vec<RecentChange>> {
        let mut request = Request::query()
            .set("rcprop", "title|ids|timestamp|user|comment")
            .set_list("rcnamespace", filter.namespaces.iter().map(ToString::to_string))
            .set_list("rctype", &filter.types)
            .set_list("rcshow", &filter.show)
            .set("rcuser", filter.user.clone().unwrap_or_default());
        if let Some(since) = &filter.since {
            request = request.set("rcstart", since.as_str()).set("rcdir", "newer");
        }
        let items = QueryGenerator::list(request, "recentchanges", "rc")
            .with_limit(limit)
            .collect(&mut self.api)?;
        let mut output = Vec::with_capacity(items.len());
        for item in items {
            let raw: RawRecentChange = serde_json::from_value(item)?;
            output.push(RecentChange {
                title: raw.title,
                change_type: raw.change_type,
                revid: raw.revid,
                old_revid: raw.old_revid,
                timestamp: raw.timestamp,
                user: raw.user,
                comment: raw.comment,
            });
        }
        Ok(output)
    }

    pub fn search(
        &mut self,
        query: &str,
        namespaces: &[i32],
        limit: Option<usize>,
    ) -> Result<Vec<SearchHit>> {
        let request = Request::query()
            .set("srsearch", query)
            .set_list("srnamespace", namespaces.iter().map(ToString::to_string));
        let items = QueryGenerator::list(request, "search", "sr")
            .with_limit(limit)
            .collect(&mut self.api)?;
        let mut hits = Vec::with_capacity(items.len());
        for item in items {
            let raw: RawSearchHit = serde_json::from_value(item)?;
            hits.push(SearchHit {
                title: raw.title,
                namespace: raw.ns,
                page_id: raw.pageid,
                word_count: raw.wordcount.and_then(|value| u64::try_from(value).ok()),
                snippet: raw.snippet.unwrap_or_default(),
                timestamp: raw.timestamp,
            });
        }
        Ok(hits)
    }

    pub fn backlinks(
        &mut self,
        target: &Title,
        filter: RedirectFilter,
        namespaces: &[i32],
        limit: Option<usize>,
    ) -> Result<Vec<Title>> {
        let request = Request::query()
            .set("bltitle", target.full_title())
            .set("blfilterredir", filter.as_str())
            .set_list("blnamespace", namespaces.iter().map(ToString::to_string));
        let items = QueryGenerator::list(request, "backlinks", "bl")
            .with_limit(limit)
            .collect(&mut self.api)?;
        Ok(self.titles_of(&items))
    }

    pub fn embedded_in(
        &mut self,
        template: &Title,
        namespaces: &[i32],
        limit: Option<usize>,
    ) -> Result<Vec<Title>> {
        let request = Request::query()
            .set("eititle", template.full_title())
            .set_list("einamespace", namespaces.iter().map(ToString::to_string));
        let items = QueryGenerator::list(request, "embeddedin", "ei")
            .with_limit(limit)
            .collect(&mut self.api)?;
        Ok(self.titles_of(&items))
    }

    pub fn user_contributions(
        &mut self,
        user: &str,
        namespaces: &[i32],
        limit: Option<usize>,
    ) -> Result<Vec<Contribution>> {
        let request = Request::query()
            .set("ucuser", user)
            .set("ucprop", "ids|title|timestamp|comment|sizediff")
            .set_list("ucnamespace", namespaces.iter().map(ToString::to_string));
        let items = QueryGenerator::list(request, "usercontribs", "uc")
            .with_limit(limit)
            .collect(&mut self.api)?;
        let mut output = Vec::with_capacity(items.len());
        for item in items {
            let raw: RawContribution = serde_json::from_value(item)?;
            output.push(Contribution {
                title: raw.title,
                revid: raw.revid,
                parentid: raw.parentid,
                timestamp: raw.timestamp,
                comment: raw.comment,
                size_diff: raw.sizediff,
            });
        }
        Ok(output)
    }

    pub fn edit(
        &mut self,
        title: &Title,
        text: &str,
        summary: &str,
        options: &EditOptions,
    ) -> Result<EditResult> {
        let full_title = title.full_title();
        let mut request = Request::new("edit")
            .for_title(&full_title)
            .set("title", full_title.as_str())
            .set_verbatim("text", text)
            .set("summary", summary)
            .set_flag("minor", options.minor)
            .set_flag("notminor", !options.minor)
            .set_flag("bot", options.bot)
            .set_flag("nocreate", options.nocreate)
            .set_flag("createonly", options.createonly)
            .set_flag("recreate", options.recreate)
            .set("section", options.section.clone().unwrap_or_default())
            .set("basetimestamp", options.basetimestamp.clone().unwrap_or_default())
            .set("starttimestamp", options.starttimestamp.clone().unwrap_or_default())
            .set("watchlist", options.watchlist.clone().unwrap_or_default());
        if !options.tags.is_empty() {
            request = request.set_list("tags", &options.tags);
        }

        let payload = self.submit_write(request, TokenKind::Csrf)?;
        let edit: RawEdit = payload
            .get("edit")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .ok_or_else(|| WikiError::Unexpected("missing edit payload in API response".to_string()))?;

        if edit.result.as_deref() != Some("Success") {
            if let Some(url) = edit.spamblacklist {
                return Err(WikiError::SpamBlacklist {
                    title: full_title,
                    url,
                });
            }
            if edit.captcha.is_some() {
                return Err(WikiError::Captcha(full_title));
            }
            if let Some(filter) = edit.abusefilter {
                return Err(WikiError::AbuseFilter {
                    title: full_title,
                    info: filter.to_string(),
                });
            }
            return Err(WikiError::Unexpected(format!(
                "edit of [[{full_title}]] failed: {}",
                edit.result.unwrap_or_else(|| "unknown".to_string())
            )));
        }

        tracing::info!(
            title = %full_title,
            revid = edit.newrevid.unwrap_or_default(),
            nochange = edit.nochange,
            "page saved"
        );
        Ok(EditResult {
            title: edit.title.unwrap_or(full_title),
            pageid: edit.pageid,
            old_revid: edit.oldrevid,
            new_revid: edit.newrevid,
            new_timestamp: edit.newtimestamp,
            nochange: edit.nochange,
        })
    }

    pub fn move_page(
        &mut self,
        from: &Title,
        to: &Title,
        reason: &str,
        options: &MoveOptions,
    ) -> Result<Title> {
        let request = Request::new("move")
            .for_title(&from.full_title())
            .set("from", from.full_title())
            .set("to", to.full_title())
            .set("reason", reason)
            .set_flag("movetalk", options.move_talk)
            .set_flag("movesubpages", options.move_subpages)
            .set_flag("noredirect", options.no_redirect);
        let payload = match self.submit_write(request, TokenKind::Csrf) {
            Err(WikiError::PageExists(_)) => return Err(WikiError::PageExists(to.full_title())),
            other => other?,
        };
        let moved_to = payload
            .get("move")
            .and_then(|value| value.get("to"))
            .and_then(Value::as_str)
            .ok_or_else(|| WikiError::Unexpected("missing move payload".to_string()))?;
        tracing::info!(from = %from, to = moved_to, "page moved");
        self.parse_title(moved_to)
    }

    pub fn delete_page(&mut self, title: &Title, reason: &str) -> Result<()> {
        let request = Request::new("delete")
            .for_title(&title.full_title())
            .set("title", title.full_title())
            .set("reason", reason);
        self.submit_write(request, TokenKind::Csrf)?;
        tracing::info!(title = %title, "page deleted");
        Ok(())
    }

    pub fn undelete_page(&mut self, title: &Title, reason: &str) -> Result<()> {
        let request = Request::new("undelete")
            .for_title(&title.full_title())
            .set("title", title.full_title())
            .set("reason", reason);
        self.submit_write(request, TokenKind::Csrf)?;
        Ok(())
    }

    /// `protections` pairs an action (`edit`, `move`, `create`, `upload`)
    /// with a level (`sysop`, `autoconfirmed`, `all`).
    pub fn protect_page(
        &mut self,
        title: &Title,
        protections: &[(String, String)],
        expiry: &str,
        reason: &str,
        cascade: bool,
    ) -> Result<()> {
        if protections.is_empty() {
            return Err(WikiError::Config("protect requires at least one protection".to_string()));
        }
        let request = Request::new("protect")
            .for_title(&title.full_title())
            .set("title", title.full_title())
            .set_list(
                "protections",
                protections
                    .iter()
                    .map(|(action, level)| format!("{action}={level}")),
            )
            .set("expiry", expiry)
            .set("reason", reason)
            .set_flag("cascade", cascade);
        self.submit_write(request, TokenKind::Csrf)?;
        Ok(())
    }

    pub fn purge(&mut self, titles: &[Title]) -> Result<usize> {
        let mut purged = 0usize;
        for batch in titles.chunks(TITLE_BATCH) {
            let payload = self.api.submit(
                &Request::new("purge")
                    .set_list("titles", batch.iter().map(Title::full_title))
                    .post(),
            )?;
            purged += payload
                .get("purge")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter(|item| item.get("purged").is_some())
                        .count()
                })
                .unwrap_or(0);
        }
        Ok(purged)
    }

    pub fn watch(&mut self, titles: &[Title], unwatch: bool) -> Result<()> {
        for batch in titles.chunks(TITLE_BATCH) {
            let request = Request::new("watch")
                .set_list("titles", batch.iter().map(Title::full_title))
                .set_flag("unwatch", unwatch);
            self.submit_write(request, TokenKind::Watch)?;
        }
        Ok(())
    }

    pub fn rollback(&mut self, title: &Title, user: &str, summary: &str) -> Result<i64> {
        let request = Request::new("rollback")
            .for_title(&title.full_title())
            .set("title", title.full_title())
            .set("user", user)
            .set("summary", summary);
        let payload = self.submit_write(request, TokenKind::Rollback)?;
        payload
            .get("rollback")
            .and_then(|value| value.get("revid"))
            .and_then(Value::as_i64)
            .ok_or_else(|| WikiError::Unexpected("missing rollback payload".to_string()))
    }

    pub fn block_user(
        &mut self,
        user: &str,
        expiry: &str,
        reason: &str,
        options: &BlockOptions,
    ) -> Result<i64> {
        let request = Request::new("block")
            .set("user", user)
            .set("expiry", expiry)
            .set("reason", reason)
            .set_flag("nocreate", options.nocreate)
            .set_flag("autoblock", options.autoblock)
            .set_flag("noemail", options.noemail)
            .set_flag("allowusertalk", options.allow_usertalk)
            .set_flag("reblock", options.reblock);
        let payload = self.submit_write(request, TokenKind::Csrf)?;
        let id = payload
            .get("block")
            .and_then(|value| value.get("id"))
            .and_then(Value::as_i64)
            .ok_or_else(|| WikiError::Unexpected(format!("block of {user} returned no block id")))?;
        tracing::info!(user, expiry, id, "user blocked");
        Ok(id)
    }

    pub fn unblock_user(&mut self, user: &str, reason: &str) -> Result<()> {
        let request = Request::new("unblock")
            .set("user", user)
            .set("reason", reason);
        self.submit_write(request, TokenKind::Csrf)?;
        Ok(())
    }

    pub fn expand_text(&mut self, text: &str, title: Option<&Title>) -> Result<String> {
        let payload = self.api.submit(
            &Request::new("expandtemplates")
                .set("text", text)
                .set("prop", "wikitext")
                .set("title", title.map(Title::full_title).unwrap_or_default())
                .post(),
        )?;
        payload
            .get("expandtemplates")
            .and_then(|value| value.get("wikitext"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| WikiError::Unexpected("missing expandtemplates payload".to_string()))
    }

    pub fn parse_wikitext(&mut self, text: &str, title: Option<&Title>) -> Result<String> {
        let payload = self.api.submit(
            &Request::new("parse")
                .set("text", text)
                .set("contentmodel", "wikitext")
                .set("prop", "text")
                .set("disablelimitreport", "1")
                .set("title", title.map(Title::full_title).unwrap_or_default())
                .post(),
        )?;
        payload
            .get("parse")
            .and_then(|value| value.get("text"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| WikiError::Unexpected("missing parse payload".to_string()))
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawGeneral {
    #[serde(default)]
    sitename: String,
    #[serde(default)]
    mainpage: String,
    #[serde(default)]
    lang: String,
    #[serde(default)]
    generator: String,
    #[serde(default)]
    server: String,
    #[serde(default)]
    articlepath: String,
    #[serde(default)]
    scriptpath: String,
    #[serde(default)]
    readonly: bool,
}

#[derive(Debug, Deserialize)]
struct RawRecentChange {
    title: String,
    #[serde(rename = "type", default)]
    change_type: String,
    #[serde(default)]
    revid: i64,
    #[serde(default)]
    old_revid: i64,
    #[serde(default)]
    timestamp: String,
    user: Option<String>,
    comment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSearchHit {
    title: String,
    ns: i32,
    #[serde(default)]
    pageid: i64,
    wordcount: Option<i64>,
    snippet: Option<String>,
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawContribution {
    title: String,
    #[serde(default)]
    revid: i64,
    #[serde(default)]
    parentid: i64,
    #[serde(default)]
    timestamp: String,
    comment: Option<String>,
    sizediff: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct RawEdit {
    result: Option<String>,
    title: Option<String>,
    pageid: Option<i64>,
    oldrevid: Option<i64>,
    newrevid: Option<i64>,
    newtimestamp: Option<String>,
    #[serde(default)]
    nochange: bool,
    spamblacklist: Option<String>,
    captcha: Option<Value>,
    abusefilter: Option<Value>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::namespace::{NS_CATEGORY, NS_MAIN};
    use crate::testing::{MockTransport, mock_site};

    fn tokens() -> Value {
        json!({"query": {"tokens": {"csrftoken": "c+\\", "watchtoken": "w+\\"}}})
    }

    #[test]
    fn siteinfo_loads_local_namespaces() {
        let transport = MockTransport::new();
        transport.push_json(json!({"query": {
            "general": {"sitename": "Wikipedia", "mainpage": "Hauptseite", "lang": "de"},
            "namespaces": {
                "0": {"id": 0, "name": ""},
                "14": {"id": 14, "name": "Kategorie", "canonical": "Category"}
            },
            "namespacealiases": []
        }}));
        let mut site = mock_site(&transport);
        let info = site.load_siteinfo().expect("siteinfo");
        assert_eq!(info.mainpage, "Hauptseite");
        let title = site.parse_title("Category:Foo").expect("title");
        assert_eq!(title.full_title(), "Kategorie:Foo");

        site.load_siteinfo().expect("cached");
        assert_eq!(site.site_name().expect("name"), "Wikipedia");
        assert_eq!(site.lang().expect("lang"), "de");
        assert_eq!(site.main_page().expect("main").full_title(), "Hauptseite");
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn prefix_index_resolves_namespace_prefix() {
        let transport = MockTransport::new();
        transport.push_json(json!({"query": {"allpages": [{"ns": 10, "title": "Template:Cite web"}]}}));
        transport.push_json(json!({"query": {"allpages": [{"ns": 0, "title": "Rust (language)"}]}}));
        let mut site = mock_site(&transport);
        let pages = site.prefix_index("Template:Cite", NS_MAIN, None).expect("templates");
        assert_eq!(pages[0].full_title(), "Template:Cite web");
        assert_eq!(transport.request(0).param("apnamespace"), Some("10"));
        assert_eq!(transport.request(0).param("apprefix"), Some("Cite"));

        site.prefix_index("Rust", NS_MAIN, Some(1)).expect("articles");
        assert_eq!(transport.request(1).param("apnamespace"), Some("0"));
        assert_eq!(transport.request(1).param("aplimit"), Some("1"));
    }

    #[test]
    fn login_enables_assert_user() {
        let transport = MockTransport::new();
        transport.push_json(json!({"query": {"tokens": {"logintoken": "t"}}}));
        transport.push_json(json!({"login": {"result": "Success"}}));
        transport.push_json(json!({"query": {"userinfo": {"id": 1, "name": "Bot", "rights": ["edit"]}}}));
        transport.push_json(json!({"query": {"allpages": []}}));
        let mut site = mock_site(&transport);
        assert!(matches!(site.login(), Err(WikiError::NoUsername { .. })));

        site.set_credentials(Some(Credentials::new("Bot", "pw")));
        site.login().expect("login");
        assert!(site.is_logged_in());
        site.allpages(None, NS_MAIN, None).expect("allpages");
        assert_eq!(transport.request(3).param("assert"), Some("user"));
        assert_eq!(transport.request(1).param("assert"), None);
    }

    #[test]
    fn submit_write_refreshes_bad_token_once() {
        let transport = MockTransport::new();
        transport.push_json(tokens());
        transport.push_json(json!({"error": {"code": "badtoken", "info": "Invalid CSRF token."}}));
        transport.push_json(json!({"query": {"tokens": {"csrftoken": "new+\\"}}}));
        transport.push_json(json!({"delete": {"title": "Foo"}}));
        let mut site = mock_site(&transport);
        let title = site.parse_title("Foo").expect("title");
        site.delete_page(&title, "cleanup").expect("delete");
        assert_eq!(transport.request(1).param("token"), Some("c+\\"));
        assert_eq!(transport.request(3).param("token"), Some("new+\\"));
    }

    #[test]
    fn category_members_walks_continuation() {
        let transport = MockTransport::new();
        transport.push_json(json!({
            "continue": {"cmcontinue": "x", "continue": "-||"},
            "query": {"categorymembers": [{"ns": 0, "title": "Alpha"}]}
        }));
        transport.push_json(json!({
            "query": {"categorymembers": [{"ns": 14, "title": "Category:Beta"}]}
        }));
        let mut site = mock_site(&transport);
        let category = site.parse_title("Category:Greek").expect("title");
        let members = site
            .category_members(&category, &[MemberType::Page, MemberType::Subcat], &[], None)
            .expect("members");
        assert_eq!(members.len(), 2);
        assert_eq!(members[1].namespace(), NS_CATEGORY);
        assert_eq!(transport.request(0).param("cmtype"), Some("page|subcat"));
        assert_eq!(transport.request(0).param("cmtitle"), Some("Category:Greek"));
    }

    #[test]
    fn edit_success_and_nochange() {
        let transport = MockTransport::new();
        transport.push_json(tokens());
        transport.push_json(json!({"edit": {
            "result": "Success", "pageid": 5, "title": "Foo", "oldrevid": 10,
            "newrevid": 11, "newtimestamp": "2026-01-01T00:00:00Z"
        }}));
        transport.push_json(json!({"edit": {"result": "Success", "pageid": 5, "title": "Foo", "nochange": true}}));
        let mut site = mock_site(&transport);
        let title = site.parse_title("Foo").expect("title");
        let options = EditOptions {
            basetimestamp: Some("2025-12-31T00:00:00Z".to_string()),
            nocreate: true,
            ..EditOptions::default()
        };
        let result = site.edit(&title, "new text", "summary", &options).expect("edit");
        assert_eq!(result.new_revid, Some(11));
        assert!(!result.nochange);
        let sent = transport.request(1);
        assert_eq!(sent.param("basetimestamp"), Some("2025-12-31T00:00:00Z"));
        assert_eq!(sent.param("nocreate"), Some("1"));
        assert_eq!(sent.param("createonly"), None);

        let result = site.edit(&title, "new text", "summary", &options).expect("edit");
        assert!(result.nochange);
        assert_eq!(result.new_revid, None);
    }

    #[test]
    fn edit_maps_conflicts_and_blacklist() {
        let transport = MockTransport::new();
        transport.push_json(tokens());
        transport.push_json(json!({"error": {"code": "editconflict", "info": "Edit conflict."}}));
        transport.push_json(json!({"edit": {"result": "Failure", "spamblacklist": "spam.example"}}));
        let mut site = mock_site(&transport);
        let title = site.parse_title("Foo").expect("title");

        let error = site
            .edit(&title, "x", "s", &EditOptions::default())
            .expect_err("conflict");
        assert!(matches!(error, WikiError::EditConflict(ref t) if t == "Foo"));

        let error = site
            .edit(&title, "x", "s", &EditOptions::default())
            .expect_err("blacklist");
        assert!(matches!(error, WikiError::SpamBlacklist { ref url, .. } if url == "spam.example"));
    }

    #[test]
    fn move_reports_existing_target() {
        let transport = MockTransport::new();
        transport.push_json(tokens());
        transport.push_json(json!({"error": {"code": "articleexists", "info": "exists"}}));
        let mut site = mock_site(&transport);
        let from = site.parse_title("Old").expect("title");
        let to = site.parse_title("New").expect("title");
        let error = site
            .move_page(&from, &to, "rename", &MoveOptions::default())
            .expect_err("exists");
        assert!(matches!(error, WikiError::PageExists(ref t) if t == "New"));
    }

    #[test]
    fn require_right_checks_user() {
        let transport = MockTransport::new();
        transport.push_json(json!({"query": {"userinfo": {"id": 0, "name": "127.0.0.1", "anon": true, "rights": ["read"]}}}));
        let mut site = mock_site(&transport);
        let error = site.require_right("upload").expect_err("denied");
        assert!(matches!(error, WikiError::PermissionDenied(_)));
        assert!(site.has_right("read").expect("right"));
        assert!(!site.is_logged_in());
    }

    #[test]
    fn search_parses_hits() {
        let transport = MockTransport::new();
        transport.push_json(json!({"query": {"search": [
            {"ns": 0, "title": "Rust", "pageid": 7, "wordcount": 100, "snippet": "a <b>language</b>"}
        ]}}));
        let mut site = mock_site(&transport);
        let hits = site.search("language", &[0], Some(5)).expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].word_count, Some(100));
        assert_eq!(transport.request(0).param("srlimit"), Some("5"));
    }

    #[test]
    fn block_user_returns_block_id() {
        let transport = MockTransport::new();
        transport.push_json(json!({"query": {"tokens": {"csrftoken": "t+\\"}}}));
        transport.push_json(json!({"block": {"user": "Vandal", "id": 314, "expiry": "infinite"}}));
        let mut site = mock_site(&transport);
        let id = site
            .block_user("Vandal", "infinite", "spam", &BlockOptions::default())
            .expect("block");
        assert_eq!(id, 314);
        assert_eq!(transport.request(1).param("user"), Some("Vandal"));
    }

    #[test]
    fn block_user_without_id_is_an_error() {
        let transport = MockTransport::new();
        transport.push_json(json!({"query": {"tokens": {"csrftoken": "t+\\"}}}));
        transport.push_json(json!({"block": {"user": "Vandal"}}));
        let mut site = mock_site(&transport);
        let error = site
            .block_user("Vandal", "1 day", "spam", &BlockOptions::default())
            .expect_err("no id");
        assert!(matches!(error, WikiError::Unexpected(_)));
    }
}
