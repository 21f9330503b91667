use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use toml::Value;

pub const DEFAULT_USER_AGENT: &str = "wikibot/0.1 (https://www.mediawiki.org/wiki/API:Etiquette)";
pub const DEFAULT_FAMILY: &str = "wikipedia";
pub const DEFAULT_CODE: &str = "en";
pub const DEFAULT_CONFIG_FILENAME: &str = "wikibot.toml";
pub const DEFAULT_CITOID_URL: &str = "https://en.wikipedia.org/api/rest_v1/data/citation";
pub const DEFAULT_SUPERSET_URL: &str = "https://superset.wmcloud.org";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BotConfig {
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default)]
    pub account: AccountSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub superset: SupersetSection,
    #[serde(default)]
    pub citoid: CitoidSection,
    #[serde(default)]
    pub bot: BotSection,
    /// Command-line choices; they win over env and the file.
    #[serde(skip)]
    pub overrides: SiteSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SiteSection {
    pub family: Option<String>,
    pub code: Option<String>,
    pub url: Option<String>,
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct AccountSection {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HttpSection {
    pub timeout_ms: Option<u64>,
    pub maxlag: Option<u64>,
    pub max_retries: Option<usize>,
    pub retry_wait_ms: Option<u64>,
    pub retry_max_wait_ms: Option<u64>,
    pub read_throttle_ms: Option<u64>,
    pub write_throttle_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CacheSection {
    pub path: Option<PathBuf>,
    pub expiry_hours: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SupersetSection {
    pub url: Option<String>,
    pub session_cookie: Option<String>,
    pub database_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CitoidSection {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BotSection {
    pub summary_prefix: Option<String>,
    pub put_throttle_ms: Option<u64>,
}

/// Resolved HTTP and retry policy; env > config > default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub user_agent: String,
    pub timeout_ms: u64,
    pub maxlag: Option<u64>,
    pub max_retries: usize,
    pub retry_wait_ms: u64,
    pub retry_max_wait_ms: u64,
    pub read_throttle_ms: u64,
    pub write_throttle_ms: u64,
}

impl BotConfig {
    /// Resolve the family name: override > env WIKIBOT_FAMILY > config > DEFAULT_FAMILY.
    pub fn family(&self) -> String {
        self.overrides
            .family
            .clone()
            .or_else(|| env_override("WIKIBOT_FAMILY"))
            .or_else(|| self.site.family.clone())
            .unwrap_or_else(|| DEFAULT_FAMILY.to_string())
    }

    /// Resolve the language/site code: override > env WIKIBOT_CODE > config > DEFAULT_CODE.
    pub fn code(&self) -> String {
        self.overrides
            .code
            .clone()
            .or_else(|| env_override("WIKIBOT_CODE"))
            .or_else(|| self.site.code.clone())
            .unwrap_or_else(|| DEFAULT_CODE.to_string())
    }

    /// Explicit API URL for wikis outside the built-in families.
    pub fn api_url(&self) -> Option<String> {
        env_override("WIKIBOT_API_URL").or_else(|| self.site.api_url.clone())
    }

    pub fn user_agent(&self) -> String {
        env_override("WIKIBOT_USER_AGENT")
            .or_else(|| self.site.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn username(&self) -> Option<String> {
        env_override("WIKIBOT_USERNAME").or_else(|| self.account.username.clone())
    }

    pub fn password(&self) -> Option<String> {
        env_override("WIKIBOT_PASSWORD").or_else(|| self.account.password.clone())
    }

    pub fn http_settings(&self) -> HttpSettings {
        let maxlag = match env_override("WIKIBOT_MAXLAG") {
            Some(value) => value.parse::<u64>().ok().filter(|lag| *lag > 0),
            None => self.http.maxlag.or(Some(5)).filter(|lag| *lag > 0),
        };
        HttpSettings {
            user_agent: self.user_agent(),
            timeout_ms: self.http.timeout_ms.unwrap_or(30_000),
            maxlag,
            max_retries: self.http.max_retries.unwrap_or(15),
            retry_wait_ms: self.http.retry_wait_ms.unwrap_or(5_000),
            retry_max_wait_ms: self.http.retry_max_wait_ms.unwrap_or(120_000),
            read_throttle_ms: self.http.read_throttle_ms.unwrap_or(0),
            write_throttle_ms: self
                .http
                .write_throttle_ms
                .or(self.bot.put_throttle_ms)
                .unwrap_or(10_000),
        }
    }

    pub fn cache_expiry_hours(&self) -> u64 {
        self.cache.expiry_hours.unwrap_or(24 * 30)
    }

    pub fn superset_url(&self) -> String {
        self.superset
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_SUPERSET_URL.to_string())
    }

    pub fn superset_session(&self) -> Option<String> {
        env_override("WIKIBOT_SUPERSET_SESSION").or_else(|| self.superset.session_cookie.clone())
    }

    pub fn citoid_url(&self) -> String {
        self.citoid
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_CITOID_URL.to_string())
    }
}

/// Config file location: explicit path > env WIKIBOT_CONFIG > `./wikibot.toml`.
pub fn resolve_config_path(explicit: Option<&Path>, cwd: &Path) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(value) = env_override("WIKIBOT_CONFIG") {
        return PathBuf::from(value);
    }
    cwd.join(DEFAULT_CONFIG_FILENAME)
}

/// Load and parse a BotConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<BotConfig> {
    if !config_path.exists() {
        return Ok(BotConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: BotConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Update `section.key` in the config file while preserving all other
/// sections. Returns `true` when a write occurred.
pub fn patch_config(config_path: &Path, section: &str, key: &str, value: &str) -> Result<bool> {
    if section.trim().is_empty() || key.trim().is_empty() {
        bail!("config section and key cannot be empty");
    }

    let mut root = if config_path.exists() {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        toml::from_str::<Value>(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?
    } else {
        Value::Table(Default::default())
    };
    let original = root.clone();

    let root_table = root.as_table_mut().ok_or_else(|| {
        anyhow::anyhow!(
            "top-level TOML must be a table in {}",
            config_path.display()
        )
    })?;
    let section_entry = root_table
        .entry(section.to_string())
        .or_insert_with(|| Value::Table(Default::default()));
    let section_table = section_entry.as_table_mut().ok_or_else(|| {
        anyhow::anyhow!("[{section}] must be a table in {}", config_path.display())
    })?;

    if value.is_empty() {
        section_table.remove(key);
    } else {
        section_table.insert(key.to_string(), parse_scalar(value));
    }

    if root == original {
        return Ok(false);
    }

    // Reject patches that would make the file unloadable.
    let rendered = toml::to_string_pretty(&root).context("failed to serialize config TOML")?;
    toml::from_str::<BotConfig>(&rendered)
        .with_context(|| format!("invalid value for {section}.{key}: {value}"))?;

    if let Some(parent) = config_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(config_path, rendered)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    Ok(true)
}

fn parse_scalar(value: &str) -> Value {
    if let Ok(number) = value.parse::<i64>() {
        return Value::Integer(number);
    }
    match value {
        "true" => Value::Boolean(true),
        "false" => Value::Boolean(false),
        _ => Value::String(value.to_string()),
    }
}

fn env_override(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
