use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use reqwest::StatusCode;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::RETRY_AFTER;
use serde_json::Value;

use crate::config::HttpSettings;
use crate::error::{Result, WikiError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub field: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub form: Vec<(String, String)>,
    pub json: Option<Value>,
    pub headers: Vec<(String, String)>,
    pub file: Option<FilePart>,
    pub is_write: bool,
}

impl HttpRequest {
    pub fn get(url: &str) -> Self {
        Self {
            method: Method::Get,
            url: url.to_string(),
            query: Vec::new(),
            form: Vec::new(),
            json: None,
            headers: Vec::new(),
            file: None,
            is_write: false,
        }
    }

    pub fn post(url: &str) -> Self {
        Self {
            method: Method::Post,
            ..Self::get(url)
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Value of a query or form parameter, for logging and tests.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .chain(self.form.iter())
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Seconds from a `Retry-After` header.
    pub retry_after: Option<u64>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// One round-trip to a remote HTTP server. Implementations may retry
/// connection failures but return non-2xx responses to the caller.
pub trait Transport {
    fn send(&mut self, request: &HttpRequest) -> Result<HttpResponse>;
    fn request_count(&self) -> usize;
}

pub struct HttpTransport {
    client: Client,
    settings: HttpSettings,
    last_request_at: Option<Instant>,
    last_write_at: Option<Instant>,
    request_count: usize,
}

impl HttpTransport {
    pub fn new(settings: HttpSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .cookie_store(true)
            .user_agent(settings.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            settings,
            last_request_at: None,
            last_write_at: None,
            request_count: 0,
        })
    }

    fn build(&self, request: &HttpRequest) -> Result<RequestBuilder> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(file) = &request.file {
            let mut form = Form::new();
            for (key, value) in &request.form {
                form = form.text(key.clone(), value.clone());
            }
            let part = Part::bytes(file.bytes.clone())
                .file_name(file.file_name.clone())
                .mime_str("application/octet-stream")?;
            form = form.part(file.field.clone(), part);
            builder = builder.multipart(form);
        } else if let Some(json) = &request.json {
            builder = builder.json(json);
        } else if !request.form.is_empty() {
            builder = builder.form(&request.form);
        }
        Ok(builder)
    }

    fn apply_throttle(&mut self, is_write: bool) {
        let read_gap = Duration::from_millis(self.settings.read_throttle_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < read_gap {
                sleep(read_gap - elapsed);
            }
        }
        if is_write {
            let write_gap = Duration::from_millis(self.settings.write_throttle_ms);
            if let Some(last) = self.last_write_at {
                let elapsed = last.elapsed();
                if elapsed < write_gap {
                    tracing::debug!(
                        wait_ms = (write_gap - elapsed).as_millis() as u64,
                        "throttling write request"
                    );
                    sleep(write_gap - elapsed);
                }
            }
            self.last_write_at = Some(Instant::now());
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize, is_write: bool) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .settings
            .retry_wait_ms
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(self.settings.retry_max_wait_ms);
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let multiplier = if is_write { 2u64 } else { 1u64 };
        sleep(Duration::from_millis(
            base.saturating_mul(multiplier).saturating_add(jitter),
        ));
    }
}

impl Transport for HttpTransport {
    fn send(&mut self, request: &HttpRequest) -> Result<HttpResponse> {
        let max_retries = transport_retries(request.is_write, self.settings.max_retries);

        for attempt in 0..=max_retries {
            self.apply_throttle(request.is_write);
            tracing::debug!(
                method = ?request.method,
                url = %request.url,
                action = request.param("action").unwrap_or(""),
                "sending request"
            );
            match self.build(request)?.send() {
                Ok(response) => {
                    let status = response.status();
                    if attempt < max_retries && is_retryable_status(status) {
                        tracing::warn!(%status, attempt, "retryable HTTP status");
                        self.wait_before_retry(attempt, request.is_write);
                        continue;
                    }
                    let retry_after = response
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|value| value.to_str().ok())
                        .and_then(|value| value.trim().parse::<u64>().ok());
                    let body = response.text()?;
                    return Ok(HttpResponse {
                        status: status.as_u16(),
                        retry_after,
                        body,
                    });
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        tracing::warn!(%error, attempt, "retrying failed request");
                        self.wait_before_retry(attempt, request.is_write);
                        continue;
                    }
                    return Err(WikiError::Http(error));
                }
            }
        }

        Err(WikiError::Unexpected(format!(
            "request to {} exhausted retry budget",
            request.url
        )))
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Resends the transport attempts on its own. Writes get none here: a
/// timed-out edit may have landed, and the API layer decides from the
/// response whether to resend.
fn transport_retries(is_write: bool, max_retries: usize) -> usize {
    if is_write { 0 } else { max_retries.min(3) }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}
