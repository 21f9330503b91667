use std::collections::VecDeque;
use std::sync::LazyLock;
use std::thread::sleep;
use std::time::Duration;

use regex::Regex;
use serde_json::{Map, Value};

use crate::cache::ResponseCache;
use crate::config::HttpSettings;
use crate::error::{Result, WikiError, is_retryable_code};
use crate::http::{FilePart, HttpRequest, Method, Transport};

static LAG_SECONDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?) seconds? lagged").expect("valid lag regex")
});

/// Separator MediaWiki accepts in multi-value parameters when a value itself
/// contains `|`.
const MULTI_VALUE_SEPARATOR: char = '\u{1f}';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiOptions {
    pub maxlag: Option<u64>,
    pub max_retries: usize,
    pub retry_wait_ms: u64,
    pub retry_max_wait_ms: u64,
}

impl ApiOptions {
    pub fn from_settings(settings: &HttpSettings) -> Self {
        Self {
            maxlag: settings.maxlag,
            max_retries: settings.max_retries,
            retry_wait_ms: settings.retry_wait_ms,
            retry_max_wait_ms: settings.retry_max_wait_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    params: Vec<(String, String)>,
    method: Method,
    write: bool,
    file: Option<FilePart>,
    cache_for: Option<Duration>,
    title: Option<String>,
}

impl Request {
    pub fn new(action: &str) -> Self {
        Self {
            params: vec![("action".to_string(), action.to_string())],
            method: Method::Get,
            write: false,
            file: None,
            cache_for: None,
            title: None,
        }
    }

    pub fn query() -> Self {
        Self::new("query")
    }

    /// Set a parameter, replacing any previous value. Empty values are dropped.
    pub fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value.into());
        self
    }

    /// Like `set`, but an empty value is sent as-is.
    pub fn set_verbatim(mut self, key: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        if let Some(slot) = self.params.iter_mut().find(|(name, _)| name == key) {
            slot.1 = value;
        } else {
            self.params.push((key.to_string(), value));
        }
        self
    }

    pub fn set_flag(self, key: &str, enabled: bool) -> Self {
        if enabled { self.set(key, "1") } else { self.unset(key) }
    }

    pub fn set_list<I, S>(self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let values = values
            .into_iter()
            .map(|value| value.as_ref().to_string())
            .collect::<Vec<_>>();
        let joined = if values.iter().any(|value| value.contains('|')) {
            let mut joined = String::new();
            for value in &values {
                joined.push(MULTI_VALUE_SEPARATOR);
                joined.push_str(value);
            }
            joined
        } else {
            values.join("|")
        };
        self.set(key, joined)
    }

    pub fn unset(mut self, key: &str) -> Self {
        self.params.retain(|(name, _)| name != key);
        self
    }

    pub fn post(mut self) -> Self {
        self.method = Method::Post;
        self
    }

    /// Mark as a write: sent by POST and throttled as an edit.
    pub fn write(mut self) -> Self {
        self.write = true;
        self.method = Method::Post;
        self
    }

    pub fn with_file(mut self, file: FilePart) -> Self {
        self.file = Some(file);
        self.method = Method::Post;
        self
    }

    pub fn without_file(mut self) -> Self {
        self.file = None;
        self
    }

    pub fn cache_for(mut self, duration: Duration) -> Self {
        self.cache_for = Some(duration);
        self
    }

    /// Page the request acts on, used to label mapped errors.
    pub fn for_title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn is_write(&self) -> bool {
        self.write
    }

    fn insert(&mut self, key: &str, value: String) {
        if value.is_empty() {
            self.params.retain(|(name, _)| name != key);
            return;
        }
        if let Some(slot) = self.params.iter_mut().find(|(name, _)| name == key) {
            slot.1 = value;
        } else {
            self.params.push((key.to_string(), value));
        }
    }
}

pub struct Api {
    transport: Box<dyn Transport>,
    api_url: String,
    options: ApiOptions,
    cache: Option<ResponseCache>,
    assert_user: bool,
}

impl Api {
    pub fn new(api_url: &str, transport: Box<dyn Transport>, options: ApiOptions) -> Self {
        Self {
            transport,
            api_url: api_url.to_string(),
            options,
            cache: None,
            assert_user: false,
        }
    }

    pub fn set_cache(&mut self, cache: ResponseCache) {
        self.cache = Some(cache);
    }

    /// Once logged in every request asserts it, so an expired session fails
    /// loudly instead of editing anonymously.
    pub fn set_assert_user(&mut self, enabled: bool) {
        self.assert_user = enabled;
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn request_count(&self) -> usize {
        self.transport.request_count()
    }

    pub fn submit(&mut self, request: &Request) -> Result<Value> {
        let mut params = vec![
            ("format".to_string(), "json".to_string()),
            ("formatversion".to_string(), "2".to_string()),
        ];
        params.extend(request.params.iter().cloned());
        let action = request.get("action").unwrap_or_default();
        if let Some(maxlag) = self.options.maxlag {
            params.push(("maxlag".to_string(), maxlag.to_string()));
        }
        if self.assert_user && !matches!(action, "login" | "clientlogin" | "logout") {
            params.push(("assert".to_string(), "user".to_string()));
        }

        let cache_key = match (request.cache_for, &self.cache) {
            (Some(max_age), Some(cache)) if !request.write => {
                let key = ResponseCache::key(&self.api_url, &params);
                if let Some(value) = cache.get(&key, max_age)? {
                    tracing::debug!(action, "serving response from cache");
                    return Ok(value);
                }
                Some(key)
            }
            _ => None,
        };

        let mut http = match request.method {
            Method::Get => {
                let mut http = HttpRequest::get(&self.api_url);
                http.query = params;
                http
            }
            Method::Post => {
                let mut http = HttpRequest::post(&self.api_url);
                http.form = params;
                http
            }
        };
        http.file = request.file.clone();
        http.is_write = request.write;

        let mut wait_ms = self.options.retry_wait_ms;
        let mut last_error = None;
        for attempt in 0..=self.options.max_retries {
            let response = self.transport.send(&http)?;

            if !response.is_success() {
                let error = WikiError::HttpStatus {
                    status: response.status,
                    url: self.api_url.clone(),
                };
                if attempt < self.options.max_retries && error.is_retryable() {
                    let delay = response
                        .retry_after
                        .map(|seconds| seconds.saturating_mul(1000))
                        .unwrap_or(wait_ms);
                    tracing::warn!(
                        status = response.status,
                        attempt,
                        delay_ms = delay,
                        "server error, retrying"
                    );
                    self.pause(delay);
                    wait_ms = self.next_wait(wait_ms);
                    last_error = Some(error);
                    continue;
                }
                return Err(error);
            }

            let payload = response.json()?;
            log_warnings(action, &payload);

            if let Some((code, info, lag)) = extract_error(&payload) {
                if attempt < self.options.max_retries && is_retryable_code(&code) {
                    let delay = if code == "maxlag" {
                        maxlag_delay(response.retry_after, lag, &info, wait_ms, &self.options)
                    } else {
                        wait_ms
                    };
                    tracing::warn!(
                        code = code.as_str(),
                        info = info.as_str(),
                        attempt,
                        delay_ms = delay,
                        "retrying API request"
                    );
                    self.pause(delay);
                    wait_ms = self.next_wait(wait_ms);
                    last_error = Some(WikiError::from_api(&code, &info, request.title.as_deref()));
                    continue;
                }
                return Err(WikiError::from_api(&code, &info, request.title.as_deref()));
            }

            if let (Some(key), Some(cache)) = (&cache_key, &self.cache) {
                cache.put(key, &payload)?;
            }
            return Ok(payload);
        }

        Err(last_error.unwrap_or_else(|| {
            WikiError::Unexpected("API request exhausted retry budget".to_string())
        }))
    }

    fn pause(&self, delay_ms: u64) {
        if delay_ms > 0 {
            sleep(Duration::from_millis(delay_ms));
        }
    }

    fn next_wait(&self, current: u64) -> u64 {
        current
            .saturating_mul(2)
            .min(self.options.retry_max_wait_ms)
            .max(self.options.retry_wait_ms.min(self.options.retry_max_wait_ms))
    }
}

fn extract_error(payload: &Value) -> Option<(String, String, Option<f64>)> {
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error")
            .to_string();
        let info = error
            .get("info")
            .or_else(|| error.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("unknown info")
            .to_string();
        let lag = error.get("lag").and_then(Value::as_f64);
        return Some((code, info, lag));
    }
    let first = payload.get("errors")?.as_array()?.first()?;
    let code = first.get("code").and_then(Value::as_str)?.to_string();
    let info = first
        .get("text")
        .or_else(|| first.get("*"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some((code, info, None))
}

/// Wait before resending after `maxlag`: `Retry-After`, then the reported
/// lag, then the lag quoted in `info`, clamped to the configured bounds.
fn maxlag_delay(
    retry_after: Option<u64>,
    lag: Option<f64>,
    info: &str,
    fallback_ms: u64,
    options: &ApiOptions,
) -> u64 {
    retry_after
        .map(|seconds| seconds.saturating_mul(1000))
        .or_else(|| lag.map(|lag| (lag * 1000.0) as u64))
        .or_else(|| parse_lag_ms(info))
        .unwrap_or(fallback_ms)
        .clamp(
            options.retry_wait_ms,
            options.retry_max_wait_ms.max(options.retry_wait_ms),
        )
}

fn parse_lag_ms(info: &str) -> Option<u64> {
    let captures = LAG_SECONDS.captures(info)?;
    let seconds = captures.get(1)?.as_str().parse::<f64>().ok()?;
    Some((seconds * 1000.0) as u64)
}

fn log_warnings(action: &str, payload: &Value) {
    let Some(warnings) = payload.get("warnings").and_then(Value::as_object) else {
        return;
    };
    for (module, warning) in warnings {
        let text = warning
            .get("warnings")
            .or_else(|| warning.get("*"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| warning.to_string());
        tracing::warn!(action, module = module.as_str(), "API warning: {text}");
    }
}

/// Where query results live in each response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultKey {
    /// `query.<name>` array of a `list=` module.
    List(String),
    /// `query.pages`, merged across prop continuations.
    Pages,
}

pub struct QueryGenerator {
    request: Request,
    key: ResultKey,
    limit_param: Option<String>,
    limit: Option<usize>,
    yielded: usize,
    continuation: Option<Map<String, Value>>,
    finished: bool,
    pending: Vec<Value>,
    normalized: Vec<(String, String)>,
    server_time: Option<String>,
}

impl QueryGenerator {
    /// Walk a `list=` module. `prefix` is the module's parameter prefix
    /// (`cm` for categorymembers) and sets `<prefix>limit`.
    pub fn list(request: Request, list: &str, prefix: &str) -> Self {
        let request = request.set("list", list);
        Self::build(request, ResultKey::List(list.to_string()), Some(format!("{prefix}limit")))
    }

    /// Walk page results of a generator (`generator=<name>`, params prefixed
    /// with `g<prefix>`) or of a plain `titles=`/`pageids=` prop query.
    pub fn pages(request: Request, generator: Option<(&str, &str)>) -> Self {
        match generator {
            Some((name, prefix)) => {
                let request = request.set("generator", name);
                Self::build(request, ResultKey::Pages, Some(format!("g{prefix}limit")))
            }
            None => Self::build(request, ResultKey::Pages, None),
        }
    }

    fn build(request: Request, key: ResultKey, limit_param: Option<String>) -> Self {
        let request = match &limit_param {
            Some(param) if request.get(param).is_none() => request.set(param, "max"),
            _ => request,
        };
        Self {
            request,
            key,
            limit_param,
            limit: None,
            yielded: 0,
            continuation: None,
            finished: false,
            pending: Vec::new(),
            normalized: Vec::new(),
            server_time: None,
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// `(from, to)` title normalizations reported so far.
    pub fn normalized(&self) -> &[(String, String)] {
        &self.normalized
    }

    /// `curtimestamp` of the first response, when requested.
    pub fn server_time(&self) -> Option<&str> {
        self.server_time.as_deref()
    }

    fn remaining(&self) -> Option<usize> {
        self.limit.map(|limit| limit.saturating_sub(self.yielded))
    }

    /// Fetch until at least one item is available. `Ok(None)` once exhausted.
    pub fn next_batch(&mut self, api: &mut Api) -> Result<Option<Vec<Value>>> {
        loop {
            if self.remaining() == Some(0) {
                self.finished = true;
                self.pending.clear();
                return Ok(None);
            }
            if self.finished {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let batch = std::mem::take(&mut self.pending);
                return Ok(Some(self.take_allowed(batch)));
            }

            let mut request = self.request.clone();
            if let Some(continuation) = &self.continuation {
                for (key, value) in continuation {
                    request = request.set(key, value_to_param(value));
                }
            }
            if let (Some(param), Some(remaining)) = (&self.limit_param, self.remaining())
                && remaining < 500
            {
                request = request.set(param, remaining.to_string());
            }

            let payload = api.submit(&request)?;
            self.record_meta(&payload);
            let next = parse_continuation(&payload);
            if next.is_some() && next == self.continuation {
                tracing::warn!("server repeated the previous continuation; stopping");
                self.finished = true;
            } else {
                self.finished = next.is_none();
                self.continuation = next;
            }
            tracing::debug!(finished = self.finished, "query batch received");

            let batch_complete = self.finished
                || payload
                    .get("batchcomplete")
                    .map(|value| value.as_bool().unwrap_or(true))
                    .unwrap_or(false);

            match &self.key {
                ResultKey::List(name) => {
                    let items = payload
                        .get("query")
                        .and_then(|query| query.get(name))
                        .map(items_of)
                        .unwrap_or_default();
                    if !items.is_empty() {
                        return Ok(Some(self.take_allowed(items)));
                    }
                }
                ResultKey::Pages => {
                    let pages = payload
                        .get("query")
                        .and_then(|query| query.get("pages"))
                        .map(items_of)
                        .unwrap_or_default();
                    for page in pages {
                        merge_into(&mut self.pending, page);
                    }
                    if batch_complete && !self.pending.is_empty() {
                        let batch = std::mem::take(&mut self.pending);
                        return Ok(Some(self.take_allowed(batch)));
                    }
                }
            }
        }
    }

    fn record_meta(&mut self, payload: &Value) {
        if self.server_time.is_none() {
            self.server_time = payload
                .get("curtimestamp")
                .and_then(Value::as_str)
                .map(ToString::to_string);
        }
        let entries = payload
            .get("query")
            .and_then(|query| query.get("normalized"))
            .and_then(Value::as_array);
        for entry in entries.into_iter().flatten() {
            let from = entry.get("from").and_then(Value::as_str);
            let to = entry.get("to").and_then(Value::as_str);
            if let (Some(from), Some(to)) = (from, to)
                && !self.normalized.iter().any(|(seen, _)| seen == from)
            {
                self.normalized.push((from.to_string(), to.to_string()));
            }
        }
    }

    fn take_allowed(&mut self, mut items: Vec<Value>) -> Vec<Value> {
        if let Some(remaining) = self.remaining() {
            items.truncate(remaining);
        }
        self.yielded += items.len();
        items
    }

    pub fn collect(mut self, api: &mut Api) -> Result<Vec<Value>> {
        let mut output = Vec::new();
        while let Some(batch) = self.next_batch(api)? {
            output.extend(batch);
        }
        Ok(output)
    }

    pub fn iter(self, api: &mut Api) -> QueryIter<'_> {
        QueryIter {
            api,
            generator: self,
            buffer: VecDeque::new(),
            failed: false,
        }
    }
}

pub struct QueryIter<'a> {
    api: &'a mut Api,
    generator: QueryGenerator,
    buffer: VecDeque<Value>,
    failed: bool,
}

impl Iterator for QueryIter<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(item) = self.buffer.pop_front() {
            return Some(Ok(item));
        }
        if self.failed {
            return None;
        }
        match self.generator.next_batch(self.api) {
            Ok(Some(batch)) => {
                self.buffer.extend(batch);
                self.buffer.pop_front().map(Ok)
            }
            Ok(None) => None,
            Err(error) => {
                self.failed = true;
                Some(Err(error))
            }
        }
    }
}

fn items_of(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        // formatversion=1 style objects keyed by id
        Value::Object(map) => map.values().cloned().collect(),
        _ => Vec::new(),
    }
}

fn value_to_param(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Parameters to merge into the next request, from either the modern
/// `continue` object or legacy `query-continue`.
fn parse_continuation(payload: &Value) -> Option<Map<String, Value>> {
    if let Some(continuation) = payload.get("continue").and_then(Value::as_object)
        && !continuation.is_empty()
    {
        return Some(continuation.clone());
    }
    let legacy = payload.get("query-continue").and_then(Value::as_object)?;
    let mut merged = Map::new();
    for module in legacy.values() {
        if let Some(params) = module.as_object() {
            for (key, value) in params {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    if merged.is_empty() { None } else { Some(merged) }
}

fn page_key(page: &Value) -> Option<String> {
    if let Some(id) = page.get("pageid").and_then(Value::as_i64)
        && id > 0
    {
        return Some(format!("id:{id}"));
    }
    page.get("title")
        .and_then(Value::as_str)
        .map(|title| format!("title:{title}"))
}

/// Fold `page` into `pending`: arrays of a page already seen are
/// concatenated, other fields are overwritten.
fn merge_into(pending: &mut Vec<Value>, page: Value) {
    let key = page_key(&page);
    let existing = key.as_ref().and_then(|key| {
        pending
            .iter_mut()
            .find(|candidate| page_key(candidate).as_ref() == Some(key))
    });
    let Some(existing) = existing else {
        pending.push(page);
        return;
    };
    let (Some(target), Value::Object(source)) = (existing.as_object_mut(), page) else {
        return;
    };
    for (field, value) in source {
        match (target.get_mut(&field), value) {
            (Some(Value::Array(current)), Value::Array(more)) => current.extend(more),
            (_, value) => {
                target.insert(field, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::{MockTransport, TEST_API_URL, quick_options};

    fn api(transport: &MockTransport) -> Api {
        Api::new(TEST_API_URL, Box::new(transport.clone()), quick_options())
    }

    #[test]
    fn request_set_replaces_and_drops_empty() {
        let request = Request::query()
            .set("list", "allpages")
            .set("list", "categorymembers")
            .set("cmtitle", "");
        assert_eq!(request.get("list"), Some("categorymembers"));
        assert_eq!(request.get("cmtitle"), None);
        assert_eq!(request.params().len(), 2);
    }

    #[test]
    fn set_list_uses_unit_separator_when_values_contain_pipes() {
        let request = Request::query().set_list("titles", ["A", "B"]);
        assert_eq!(request.get("titles"), Some("A|B"));
        let request = Request::query().set_list("text", ["a|b", "c"]);
        assert_eq!(request.get("text"), Some("\u{1f}a|b\u{1f}c"));
    }

    #[test]
    fn submit_adds_format_and_maxlag() {
        let transport = MockTransport::new();
        transport.push_json(json!({"query": {}}));
        let mut options = quick_options();
        options.maxlag = Some(5);
        let mut api = Api::new(TEST_API_URL, Box::new(transport.clone()), options);
        api.set_assert_user(true);
        api.submit(&Request::query().set("meta", "siteinfo"))
            .expect("submit");

        let sent = transport.request(0);
        assert_eq!(sent.method, Method::Get);
        assert_eq!(sent.param("format"), Some("json"));
        assert_eq!(sent.param("formatversion"), Some("2"));
        assert_eq!(sent.param("maxlag"), Some("5"));
        assert_eq!(sent.param("assert"), Some("user"));
    }

    #[test]
    fn write_requests_are_posted() {
        let transport = MockTransport::new();
        transport.push_json(json!({"edit": {"result": "Success"}}));
        let mut api = api(&transport);
        api.submit(&Request::new("edit").set("title", "X").write())
            .expect("submit");
        let sent = transport.request(0);
        assert_eq!(sent.method, Method::Post);
        assert!(sent.is_write);
        assert_eq!(sent.form.iter().find(|(k, _)| k == "title").map(|(_, v)| v.as_str()), Some("X"));
    }

    #[test]
    fn submit_retries_maxlag_then_succeeds() {
        let transport = MockTransport::new();
        transport.push_json(json!({
            "error": {"code": "maxlag", "info": "Waiting for db1: 0 seconds lagged.", "lag": 0}
        }));
        transport.push_response(503, Some(0), "Service Unavailable".to_string());
        transport.push_json(json!({"query": {"general": {"sitename": "Test"}}}));
        let mut api = api(&transport);
        let payload = api.submit(&Request::query()).expect("submit");
        assert_eq!(payload["query"]["general"]["sitename"], "Test");
        assert_eq!(transport.requests().len(), 3);
    }

    #[test]
    fn maxlag_delay_prefers_header_then_lag_then_info() {
        let options = ApiOptions {
            maxlag: Some(5),
            max_retries: 3,
            retry_wait_ms: 1_000,
            retry_max_wait_ms: 60_000,
        };
        let info = "Waiting for db1: 7 seconds lagged.";
        assert_eq!(maxlag_delay(Some(3), Some(9.0), info, 2_000, &options), 3_000);
        assert_eq!(maxlag_delay(None, Some(9.5), info, 2_000, &options), 9_500);
        assert_eq!(maxlag_delay(None, None, info, 2_000, &options), 7_000);
        assert_eq!(maxlag_delay(None, None, "lagged", 2_000, &options), 2_000);
    }

    #[test]
    fn maxlag_delay_is_clamped_to_bounds() {
        let options = ApiOptions {
            maxlag: Some(5),
            max_retries: 3,
            retry_wait_ms: 1_000,
            retry_max_wait_ms: 60_000,
        };
        assert_eq!(maxlag_delay(Some(600), None, "", 2_000, &options), 60_000);
        assert_eq!(maxlag_delay(None, Some(0.2), "", 2_000, &options), 1_000);
        assert_eq!(maxlag_delay(Some(0), None, "", 2_000, &options), 1_000);

        let inverted = ApiOptions {
            retry_max_wait_ms: 500,
            ..options
        };
        assert_eq!(maxlag_delay(Some(30), None, "", 2_000, &inverted), 1_000);
    }

    #[test]
    fn submit_gives_up_after_retry_budget() {
        let transport = MockTransport::new();
        for _ in 0..4 {
            transport.push_json(json!({"error": {"code": "maxlag", "info": "5 seconds lagged"}}));
        }
        let mut api = api(&transport);
        let error = api.submit(&Request::query()).expect_err("must fail");
        assert!(matches!(error, WikiError::Maxlag { .. }));
        assert_eq!(transport.requests().len(), 4);
    }

    #[test]
    fn submit_maps_non_retryable_errors_with_title() {
        let transport = MockTransport::new();
        transport.push_json(json!({"error": {"code": "protectedpage", "info": "protected"}}));
        let mut api = api(&transport);
        let error = api
            .submit(&Request::new("edit").for_title("Main Page").write())
            .expect_err("must fail");
        assert!(matches!(error, WikiError::LockedPage { ref title, .. } if title == "Main Page"));
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn submit_fails_on_client_errors() {
        let transport = MockTransport::new();
        transport.push_response(404, None, "Not Found".to_string());
        let mut api = api(&transport);
        let error = api.submit(&Request::query()).expect_err("must fail");
        assert!(matches!(error, WikiError::HttpStatus { status: 404, .. }));
    }

    #[test]
    fn cached_requests_skip_the_network() {
        let transport = MockTransport::new();
        transport.push_json(json!({"query": {"general": {"sitename": "Cached"}}}));
        let mut api = api(&transport);
        api.set_cache(ResponseCache::in_memory().expect("cache"));
        let request = Request::query()
            .set("meta", "siteinfo")
            .cache_for(Duration::from_secs(60));
        let first = api.submit(&request).expect("first");
        let second = api.submit(&request).expect("second");
        assert_eq!(first, second);
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn parse_lag_from_info() {
        assert_eq!(parse_lag_ms("Waiting for 10.64.0.1: 1.5 seconds lagged."), Some(1500));
        assert_eq!(parse_lag_ms("Waiting for db: 1 second lagged"), Some(1000));
        assert_eq!(parse_lag_ms("no lag here"), None);
    }

    #[test]
    fn list_generator_follows_continue() {
        let transport = MockTransport::new();
        transport.push_json(json!({
            "continue": {"cmcontinue": "page|B", "continue": "-||"},
            "query": {"categorymembers": [{"title": "A"}]}
        }));
        transport.push_json(json!({
            "batchcomplete": true,
            "query": {"categorymembers": [{"title": "B"}, {"title": "C"}]}
        }));
        let mut api = api(&transport);
        let request = Request::query().set("cmtitle", "Category:X");
        let items = QueryGenerator::list(request, "categorymembers", "cm")
            .collect(&mut api)
            .expect("collect");
        let titles = items
            .iter()
            .filter_map(|item| item["title"].as_str())
            .collect::<Vec<_>>();
        assert_eq!(titles, vec!["A", "B", "C"]);

        assert_eq!(transport.request(0).param("cmlimit"), Some("max"));
        assert_eq!(transport.request(0).param("cmcontinue"), None);
        assert_eq!(transport.request(1).param("cmcontinue"), Some("page|B"));
        assert_eq!(transport.request(1).param("continue"), Some("-||"));
    }

    #[test]
    fn list_generator_honors_limit() {
        let transport = MockTransport::new();
        transport.push_json(json!({
            "continue": {"apcontinue": "C", "continue": "-||"},
            "query": {"allpages": [{"title": "A"}, {"title": "B"}]}
        }));
        transport.push_json(json!({
            "continue": {"apcontinue": "E", "continue": "-||"},
            "query": {"allpages": [{"title": "C"}]}
        }));
        let mut api = api(&transport);
        let items = QueryGenerator::list(Request::query(), "allpages", "ap")
            .with_limit(Some(3))
            .collect(&mut api)
            .expect("collect");
        assert_eq!(items.len(), 3);
        assert_eq!(transport.request(0).param("aplimit"), Some("3"));
        assert_eq!(transport.request(1).param("aplimit"), Some("1"));
        assert_eq!(transport.requests().len(), 2);
    }

    #[test]
    fn legacy_query_continue_is_merged() {
        let transport = MockTransport::new();
        transport.push_json(json!({
            "query-continue": {"allpages": {"apcontinue": "B"}},
            "query": {"allpages": [{"title": "A"}]}
        }));
        transport.push_json(json!({"query": {"allpages": [{"title": "B"}]}}));
        let mut api = api(&transport);
        let items = QueryGenerator::list(Request::query(), "allpages", "ap")
            .collect(&mut api)
            .expect("collect");
        assert_eq!(items.len(), 2);
        assert_eq!(transport.request(1).param("apcontinue"), Some("B"));
    }

    #[test]
    fn repeated_continuation_stops_the_walk() {
        let transport = MockTransport::new();
        let looping = json!({
            "continue": {"apcontinue": "A", "continue": "-||"},
            "query": {"allpages": [{"title": "A"}]}
        });
        transport.push_json(looping.clone());
        transport.push_json(looping);
        let mut api = api(&transport);
        let items = QueryGenerator::list(Request::query(), "allpages", "ap")
            .collect(&mut api)
            .expect("collect");
        assert_eq!(items.len(), 2);
        assert_eq!(transport.requests().len(), 2);
    }

    #[test]
    fn pages_are_merged_until_batch_complete() {
        let transport = MockTransport::new();
        transport.push_json(json!({
            "continue": {"clcontinue": "1|B", "continue": "||"},
            "query": {"pages": [
                {"pageid": 1, "title": "One", "categories": [{"title": "Category:A"}]},
                {"pageid": 2, "title": "Two"}
            ]}
        }));
        transport.push_json(json!({
            "batchcomplete": true,
            "query": {"pages": [
                {"pageid": 1, "title": "One", "categories": [{"title": "Category:B"}]}
            ]}
        }));
        let mut api = api(&transport);
        let mut generator = QueryGenerator::pages(
            Request::query().set("titles", "One|Two").set("prop", "categories"),
            None,
        );
        let batch = generator.next_batch(&mut api).expect("batch").expect("some");
        assert_eq!(batch.len(), 2);
        let categories = batch[0]["categories"].as_array().expect("categories");
        assert_eq!(categories.len(), 2);
        assert!(generator.next_batch(&mut api).expect("done").is_none());
        assert_eq!(transport.requests().len(), 2);
    }

    #[test]
    fn query_iter_yields_error_once() {
        let transport = MockTransport::new();
        transport.push_json(json!({
            "continue": {"apcontinue": "B", "continue": "-||"},
            "query": {"allpages": [{"title": "A"}]}
        }));
        transport.push_json(json!({"error": {"code": "badcontinue", "info": "bad"}}));
        let mut api = api(&transport);
        let results = QueryGenerator::list(Request::query(), "allpages", "ap")
            .iter(&mut api)
            .collect::<Vec<_>>();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
