use reqwest::Url;
use serde::Serialize;
use serde_json::Value;

use crate::config::{BotConfig, DEFAULT_CITOID_URL};
use crate::error::{Result, WikiError};
use crate::http::{HttpRequest, HttpTransport, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CitoidFormat {
    Mediawiki,
    MediawikiBasefields,
    Zotero,
    Bibtex,
    Wikibase,
}

impl CitoidFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mediawiki => "mediawiki",
            Self::MediawikiBasefields => "mediawiki-basefields",
            Self::Zotero => "zotero",
            Self::Bibtex => "bibtex",
            Self::Wikibase => "wikibase",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "mediawiki" => Some(Self::Mediawiki),
            "mediawiki-basefields" => Some(Self::MediawikiBasefields),
            "zotero" => Some(Self::Zotero),
            "bibtex" => Some(Self::Bibtex),
            "wikibase" => Some(Self::Wikibase),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Citation {
    Json(Vec<Value>),
    Bibtex(String),
}

impl Citation {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Json(items) => items.is_empty(),
            Self::Bibtex(text) => text.trim().is_empty(),
        }
    }
}

/// The fields a `{{cite web}}` needs, read from a `mediawiki` format item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CitationMetadata {
    pub title: Option<String>,
    pub website: Option<String>,
    pub date: Option<String>,
    pub access_date: Option<String>,
    pub url: Option<String>,
}

impl CitationMetadata {
    pub fn from_mediawiki(item: &Value) -> Self {
        let field = |keys: &[&str]| {
            keys.iter()
                .find_map(|key| item.get(*key).and_then(Value::as_str))
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string)
        };
        Self {
            title: field(&["title"]),
            website: field(&["websiteTitle", "publicationTitle", "blogTitle", "publisher"]),
            date: field(&["date"]),
            access_date: field(&["accessDate"]),
            url: field(&["url"]),
        }
    }
}

pub struct CitoidClient {
    base_url: String,
    transport: Box<dyn Transport>,
}

impl CitoidClient {
    pub fn new(base_url: &str, transport: Box<dyn Transport>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            transport,
        }
    }

    pub fn from_config(config: &BotConfig) -> Result<Self> {
        let transport = HttpTransport::new(config.http_settings())?;
        Ok(Self::new(&config.citoid_url(), Box::new(transport)))
    }

    pub fn default_endpoint(transport: Box<dyn Transport>) -> Self {
        Self::new(DEFAULT_CITOID_URL, transport)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, format: CitoidFormat, query: &str) -> Result<String> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|error| WikiError::Config(format!("invalid citoid URL {}: {error}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|()| WikiError::Config(format!("citoid URL {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .push(format.as_str())
            .push(query);
        Ok(url.to_string())
    }

    /// Looks up `query` (a URL, DOI, ISBN or PMID). Unknown queries give an
    /// empty result rather than an error.
    pub fn citation(&mut self, format: CitoidFormat, query: &str) -> Result<Citation> {
        let url = self.endpoint(format, query)?;
        tracing::debug!(url = url.as_str(), "citoid lookup");
        let response = self.transport.send(&HttpRequest::get(&url))?;
        if response.status == 404 {
            return Ok(match format {
                CitoidFormat::Bibtex => Citation::Bibtex(String::new()),
                _ => Citation::Json(Vec::new()),
            });
        }
        if !response.is_success() {
            return Err(WikiError::HttpStatus {
                status: response.status,
                url,
            });
        }
        if format == CitoidFormat::Bibtex {
            return Ok(Citation::Bibtex(response.body));
        }
        Ok(match response.json()? {
            Value::Array(items) => Citation::Json(items),
            other => Citation::Json(vec![other]),
        })
    }

    /// First `mediawiki` result for `query`, if any.
    pub fn metadata(&mut self, query: &str) -> Result<Option<CitationMetadata>> {
        match self.citation(CitoidFormat::Mediawiki, query)? {
            Citation::Json(items) => Ok(items.first().map(CitationMetadata::from_mediawiki)),
            Citation::Bibtex(_) => Ok(None),
        }
    }
}
