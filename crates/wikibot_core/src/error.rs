use thiserror::Error;

pub type Result<T> = std::result::Result<T, WikiError>;

#[derive(Debug, Error)]
pub enum WikiError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("response cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("MediaWiki API error [{code}]: {info}")]
    Api { code: String, info: String },

    #[error("maximum replication lag exceeded: {info}")]
    Maxlag { info: String },

    #[error("wiki is in read-only mode: {0}")]
    ReadOnly(String),

    #[error("no username configured for {site}")]
    NoUsername { site: String },

    #[error("login failed: {0}")]
    Login(String),

    #[error("not logged in to {0}")]
    NotLoggedIn(String),

    #[error("bad or expired token")]
    BadToken,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("user is blocked: {0}")]
    UserBlocked(String),

    #[error("invalid title: {0}")]
    InvalidTitle(String),

    #[error("page [[{0}]] does not exist")]
    NoPage(String),

    #[error("page [[{0}]] already exists")]
    PageExists(String),

    #[error("page [[{0}]] is a redirect")]
    IsRedirectPage(String),

    #[error("page [[{0}]] is not a redirect")]
    IsNotRedirectPage(String),

    #[error("circular redirect at [[{0}]]")]
    CircularRedirect(String),

    #[error("edit conflict on [[{0}]]")]
    EditConflict(String),

    #[error("page [[{0}]] was deleted after editing started")]
    PageDeletedConflict(String),

    #[error("page [[{title}]] is locked: {info}")]
    LockedPage { title: String, info: String },

    #[error("edit to [[{title}]] blocked by spam blacklist: {url}")]
    SpamBlacklist { title: String, url: String },

    #[error("edit to [[{title}]] disallowed by abuse filter: {info}")]
    AbuseFilter { title: String, info: String },

    #[error("captcha required to edit [[{0}]]")]
    Captcha(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("upload returned warnings: {}", .0.join(", "))]
    UploadWarning(Vec<String>),

    #[error("Superset error: {0}")]
    Superset(String),

    #[error("unexpected API response: {0}")]
    Unexpected(String),
}

impl WikiError {
    /// Map an API error payload to a typed error. `title` names the page the
    /// request acted on, when there is one.
    pub fn from_api(code: &str, info: &str, title: Option<&str>) -> Self {
        let title_str = title.unwrap_or_default().to_string();
        match code {
            "maxlag" => Self::Maxlag {
                info: info.to_string(),
            },
            "readonly" => Self::ReadOnly(info.to_string()),
            "badtoken" | "notoken" => Self::BadToken,
            "editconflict" => Self::EditConflict(title_str),
            "pagedeleted" => Self::PageDeletedConflict(title_str),
            "protectedpage" | "cascadeprotected" | "protectedtitle" | "protectednamespace"
            | "protectednamespace-interface" | "customcssprotected" | "customjsprotected" => {
                Self::LockedPage {
                    title: title_str,
                    info: info.to_string(),
                }
            }
            "articleexists" => Self::PageExists(title_str),
            "missingtitle" | "nocreate-missing" => Self::NoPage(title_str),
            "invalidtitle" | "badtitle" => Self::InvalidTitle(
                title.map(ToString::to_string).unwrap_or_else(|| info.to_string()),
            ),
            "spamblacklist" | "spamdetected" => Self::SpamBlacklist {
                title: title_str,
                url: info.to_string(),
            },
            "abusefilter-disallowed" | "abusefilter-warning" => Self::AbuseFilter {
                title: title_str,
                info: info.to_string(),
            },
            "blocked" | "autoblocked" | "globalblocking-blocked" => {
                Self::UserBlocked(info.to_string())
            }
            "permissiondenied" | "writeapidenied" | "mustbeloggedin" | "noedit" | "noedit-anon"
            | "cantcreate" | "cantcreate-anon" | "cantdelete" | "cantmove" => {
                Self::PermissionDenied(info.to_string())
            }
            code if code.ends_with("-notallowed") || code.starts_with("permissiondenied") => {
                Self::PermissionDenied(info.to_string())
            }
            "assertuserfailed" | "assertbotfailed" | "assertnameduserfailed" => {
                Self::NotLoggedIn(info.to_string())
            }
            _ => Self::Api {
                code: code.to_string(),
                info: info.to_string(),
            },
        }
    }

    /// API error code this error was mapped from, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code),
            Self::Maxlag { .. } => Some("maxlag"),
            Self::ReadOnly(_) => Some("readonly"),
            Self::BadToken => Some("badtoken"),
            Self::EditConflict(_) => Some("editconflict"),
            Self::PageDeletedConflict(_) => Some("pagedeleted"),
            Self::NoPage(_) => Some("missingtitle"),
            Self::PageExists(_) => Some("articleexists"),
            _ => None,
        }
    }

    /// Whether resending the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Maxlag { .. } | Self::ReadOnly(_) => true,
            Self::HttpStatus { status, .. } => {
                matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
            }
            Self::Http(error) => error.is_timeout() || error.is_connect(),
            Self::Api { code, .. } => is_retryable_code(code),
            _ => false,
        }
    }
}

pub(crate) fn is_retryable_code(code: &str) -> bool {
    matches!(
        code,
        "maxlag"
            | "readonly"
            | "ratelimited"
            | "internal_api_error_DBConnectionError"
            | "internal_api_error_DBQueryError"
            | "internal_api_error_DBQueryTimeoutError"
            | "backend-fail-internal"
    )
}
