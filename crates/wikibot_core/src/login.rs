use std::collections::BTreeMap;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::{Api, Request};
use crate::error::{Result, WikiError};

const MAX_THROTTLED_LOGIN_ATTEMPTS: usize = 3;
const MAX_THROTTLE_WAIT_SECONDS: u64 = 120;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.trim().to_string(),
            password: password.to_string(),
        }
    }

    /// Account name without a bot-password suffix (`User@Task` -> `User`).
    pub fn login_name(&self) -> &str {
        self.username
            .split_once('@')
            .map(|(account, _)| account)
            .unwrap_or(&self.username)
    }

    pub fn is_bot_password(&self) -> bool {
        self.username.contains('@')
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserInfo {
    pub id: i64,
    pub name: String,
    pub anon: bool,
    pub groups: Vec<String>,
    pub rights: Vec<String>,
    pub blocked_by: Option<String>,
    pub block_reason: Option<String>,
    pub block_expiry: Option<String>,
}

impl UserInfo {
    pub fn has_right(&self, right: &str) -> bool {
        self.rights.iter().any(|candidate| candidate == right)
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.groups.iter().any(|candidate| candidate == group)
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked_by.is_some()
    }

    fn from_query(payload: &Value) -> Result<Self> {
        let raw = payload
            .get("query")
            .and_then(|query| query.get("userinfo"))
            .cloned()
            .ok_or_else(|| WikiError::Unexpected("missing userinfo in response".to_string()))?;
        let parsed: RawUserInfo = serde_json::from_value(raw)?;
        Ok(Self {
            id: parsed.id,
            name: parsed.name,
            anon: parsed.anon,
            groups: parsed.groups,
            rights: parsed.rights,
            blocked_by: parsed.blockedby,
            block_reason: parsed.blockreason,
            block_expiry: parsed.blockexpiry,
        })
    }
}

pub fn fetch_user_info(api: &mut Api) -> Result<UserInfo> {
    let payload = api.submit(
        &Request::query()
            .set("meta", "userinfo")
            .set("uiprop", "groups|rights|blockinfo"),
    )?;
    UserInfo::from_query(&payload)
}

/// Log in with a password or bot password and return the resulting user.
pub fn login(api: &mut Api, credentials: &Credentials) -> Result<UserInfo> {
    if credentials.username.is_empty() {
        return Err(WikiError::NoUsername {
            site: api.api_url().to_string(),
        });
    }

    let mut token = fetch_login_token(api)?;
    let mut retried_token = false;
    let mut throttled = 0usize;

    loop {
        let payload = api.submit(
            &Request::new("login")
                .set("lgname", credentials.username.as_str())
                .set("lgpassword", credentials.password.as_str())
                .set("lgtoken", token.as_str())
                .post(),
        )?;
        let result: LoginResponse = serde_json::from_value(payload)?;
        match result.login.result.as_deref() {
            Some("Success") => {
                tracing::info!(user = credentials.login_name(), "logged in");
                let user = fetch_user_info(api)?;
                if user.anon {
                    return Err(WikiError::Login(
                        "server accepted the login but the session is anonymous".to_string(),
                    ));
                }
                return Ok(user);
            }
            Some("NeedToken") if !retried_token => {
                retried_token = true;
                token = match result.login.token {
                    Some(token) => token,
                    None => fetch_login_token(api)?,
                };
            }
            Some("Throttled") if throttled < MAX_THROTTLED_LOGIN_ATTEMPTS => {
                throttled += 1;
                let wait = result.login.wait.unwrap_or(5).min(MAX_THROTTLE_WAIT_SECONDS);
                tracing::warn!(wait, "login throttled, waiting");
                sleep(Duration::from_secs(wait));
                token = fetch_login_token(api)?;
            }
            other => {
                let reason = result
                    .login
                    .reason
                    .or_else(|| other.map(ToString::to_string))
                    .unwrap_or_else(|| "unknown error".to_string());
                return Err(WikiError::Login(reason));
            }
        }
    }
}

pub fn logout(api: &mut Api, wallet: &mut TokenWallet) -> Result<()> {
    let token = wallet.get(api, TokenKind::Csrf)?;
    api.submit(&Request::new("logout").set("token", token).post())?;
    wallet.clear();
    Ok(())
}

fn fetch_login_token(api: &mut Api) -> Result<String> {
    let payload = api.submit(&Request::query().set("meta", "tokens").set("type", "login"))?;
    payload
        .get("query")
        .and_then(|query| query.get("tokens"))
        .and_then(|tokens| tokens.get("logintoken"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| WikiError::Login("failed to get login token".to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TokenKind {
    Csrf,
    Watch,
    Patrol,
    Rollback,
    UserRights,
}

impl TokenKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csrf => "csrf",
            Self::Watch => "watch",
            Self::Patrol => "patrol",
            Self::Rollback => "rollback",
            Self::UserRights => "userrights",
        }
    }

    const ALL: [TokenKind; 5] = [
        Self::Csrf,
        Self::Watch,
        Self::Patrol,
        Self::Rollback,
        Self::UserRights,
    ];
}

/// Tokens are session-bound; the wallet loads every kind in one request and
/// drops them on login, logout or a `badtoken` error.
#[derive(Debug, Default)]
pub struct TokenWallet {
    tokens: BTreeMap<TokenKind, String>,
}

impl TokenWallet {
    pub fn get(&mut self, api: &mut Api, kind: TokenKind) -> Result<String> {
        if let Some(token) = self.tokens.get(&kind) {
            return Ok(token.clone());
        }
        let payload = api.submit(
            &Request::query()
                .set("meta", "tokens")
                .set_list("type", TokenKind::ALL.iter().map(|kind| kind.as_str())),
        )?;
        let tokens = payload
            .get("query")
            .and_then(|query| query.get("tokens"))
            .and_then(Value::as_object)
            .ok_or_else(|| WikiError::Unexpected("missing tokens in response".to_string()))?;
        for candidate in TokenKind::ALL {
            let field = format!("{}token", candidate.as_str());
            if let Some(token) = tokens.get(&field).and_then(Value::as_str) {
                self.tokens.insert(candidate, token.to_string());
            }
        }
        self.tokens
            .get(&kind)
            .cloned()
            .ok_or_else(|| WikiError::PermissionDenied(format!("no {} token available", kind.as_str())))
    }

    pub fn invalidate(&mut self, kind: TokenKind) {
        self.tokens.remove(&kind);
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct RawUserInfo {
    #[serde(default)]
    id: i64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    anon: bool,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    rights: Vec<String>,
    blockedby: Option<String>,
    blockreason: Option<String>,
    blockexpiry: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LoginResponse {
    #[serde(default)]
    login: LoginPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
    token: Option<String>,
    wait: Option<u64>,
}
