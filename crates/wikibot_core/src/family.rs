use std::collections::BTreeMap;

use reqwest::Url;

use crate::error::{Result, WikiError};

const MULTILINGUAL_FAMILIES: &[&str] = &[
    "wikipedia",
    "wiktionary",
    "wikiquote",
    "wikisource",
    "wikibooks",
    "wikinews",
    "wikiversity",
    "wikivoyage",
];

const SINGLE_SITE_FAMILIES: &[(&str, &str, &str)] = &[
    ("commons", "commons", "commons.wikimedia.org"),
    ("meta", "meta", "meta.wikimedia.org"),
    ("wikidata", "wikidata", "www.wikidata.org"),
    ("mediawiki", "mediawiki", "www.mediawiki.org"),
    ("test", "test", "test.wikipedia.org"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Family {
    pub name: String,
    pub protocol: String,
    pub scriptpath: String,
    hosts: FamilyHosts,
    category_redirect_templates: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FamilyHosts {
    /// `{code}.{domain}` for any language code.
    PerLanguage { domain: String },
    /// A fixed set of codes.
    Fixed(BTreeMap<String, String>),
    /// A wiki configured by API URL only.
    Custom { code: String, api_url: String },
}

impl Family {
    pub fn builtin(name: &str) -> Result<Self> {
        let mut templates = BTreeMap::new();
        templates.insert("_default".to_string(), vec!["Category redirect".to_string()]);

        if MULTILINGUAL_FAMILIES.contains(&name) {
            if name == "wikipedia" {
                templates.insert(
                    "de".to_string(),
                    vec!["Kategorienweiterleitung".to_string()],
                );
                templates.insert(
                    "fr".to_string(),
                    vec!["Redirect catégorie".to_string()],
                );
            }
            return Ok(Self {
                name: name.to_string(),
                protocol: "https".to_string(),
                scriptpath: "/w".to_string(),
                hosts: FamilyHosts::PerLanguage {
                    domain: format!("{name}.org"),
                },
                category_redirect_templates: templates,
            });
        }

        if let Some((family, code, host)) = SINGLE_SITE_FAMILIES
            .iter()
            .find(|(family, _, _)| *family == name)
        {
            let mut hosts = BTreeMap::new();
            hosts.insert((*code).to_string(), (*host).to_string());
            return Ok(Self {
                name: (*family).to_string(),
                protocol: "https".to_string(),
                scriptpath: "/w".to_string(),
                hosts: FamilyHosts::Fixed(hosts),
                category_redirect_templates: templates,
            });
        }

        Err(WikiError::Config(format!("unknown wiki family: {name}")))
    }

    /// A single-wiki family addressed by its API URL.
    pub fn custom(name: &str, api_url: &str) -> Result<Self> {
        let parsed = Url::parse(api_url)
            .map_err(|error| WikiError::Config(format!("invalid API URL {api_url}: {error}")))?;
        let path = parsed.path();
        let scriptpath = path
            .strip_suffix("/api.php")
            .unwrap_or("")
            .trim_end_matches('/')
            .to_string();
        let mut templates = BTreeMap::new();
        templates.insert("_default".to_string(), vec!["Category redirect".to_string()]);
        Ok(Self {
            name: name.to_string(),
            protocol: parsed.scheme().to_string(),
            scriptpath,
            hosts: FamilyHosts::Custom {
                code: name.to_string(),
                api_url: api_url.trim().to_string(),
            },
            category_redirect_templates: templates,
        })
    }

    /// Codes this family is known to serve. Empty for per-language families.
    pub fn codes(&self) -> Vec<String> {
        match &self.hosts {
            FamilyHosts::PerLanguage { .. } => Vec::new(),
            FamilyHosts::Fixed(hosts) => hosts.keys().cloned().collect(),
            FamilyHosts::Custom { code, .. } => vec![code.clone()],
        }
    }

    /// The code to use when none was configured.
    pub fn default_code(&self) -> String {
        match &self.hosts {
            FamilyHosts::PerLanguage { .. } => "en".to_string(),
            FamilyHosts::Fixed(hosts) => hosts.keys().next().cloned().unwrap_or_default(),
            FamilyHosts::Custom { code, .. } => code.clone(),
        }
    }

    pub fn hostname(&self, code: &str) -> Result<String> {
        match &self.hosts {
            FamilyHosts::PerLanguage { domain } => {
                if code.is_empty()
                    || !code
                        .chars()
                        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-')
                {
                    return Err(WikiError::Config(format!(
                        "invalid language code for {}: {code:?}",
                        self.name
                    )));
                }
                Ok(format!("{code}.{domain}"))
            }
            FamilyHosts::Fixed(hosts) => hosts.get(code).cloned().ok_or_else(|| {
                WikiError::Config(format!("family {} has no site {code:?}", self.name))
            }),
            FamilyHosts::Custom {
                code: own_code,
                api_url,
            } => {
                if code != own_code {
                    return Err(WikiError::Config(format!(
                        "family {} has no site {code:?}",
                        self.name
                    )));
                }
                Url::parse(api_url)
                    .ok()
                    .and_then(|url| url.host_str().map(ToString::to_string))
                    .ok_or_else(|| WikiError::Config(format!("API URL has no host: {api_url}")))
            }
        }
    }

    pub fn api_url(&self, code: &str) -> Result<String> {
        if let FamilyHosts::Custom { api_url, .. } = &self.hosts {
            self.hostname(code)?;
            return Ok(api_url.clone());
        }
        Ok(format!(
            "{}://{}{}/api.php",
            self.protocol,
            self.hostname(code)?,
            self.scriptpath
        ))
    }

    pub fn article_url(&self, code: &str, title: &str) -> Result<String> {
        Ok(format!(
            "{}://{}/wiki/{}",
            self.protocol,
            self.hostname(code)?,
            title.trim().replace(' ', "_")
        ))
    }

    pub fn category_redirect_templates(&self, code: &str) -> Vec<String> {
        self.category_redirect_templates
            .get(code)
            .or_else(|| self.category_redirect_templates.get("_default"))
            .cloned()
            .unwrap_or_else(|| vec!["Category redirect".to_string()])
    }
}
