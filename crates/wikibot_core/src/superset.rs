use serde_json::{Map, Value, json};

use crate::config::BotConfig;
use crate::error::{Result, WikiError};
use crate::http::{HttpRequest, HttpResponse, HttpTransport, Transport};

/// Where a query runs: a known database id, or the database exposing a schema
/// such as `enwiki_p`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryTarget {
    DatabaseId(i64),
    Schema(String),
}

pub struct SupersetClient {
    base_url: String,
    session_cookie: String,
    transport: Box<dyn Transport>,
    csrf_token: Option<String>,
    logged_in: bool,
}

impl SupersetClient {
    pub fn new(base_url: &str, session_cookie: &str, transport: Box<dyn Transport>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            session_cookie: session_cookie.to_string(),
            transport,
            csrf_token: None,
            logged_in: false,
        }
    }

    pub fn from_config(config: &BotConfig) -> Result<Self> {
        let session = config.superset_session().ok_or_else(|| {
            WikiError::Config(
                "no Superset session cookie; set [superset].session_cookie or WIKIBOT_SUPERSET_SESSION"
                    .to_string(),
            )
        })?;
        let transport = HttpTransport::new(config.http_settings())?;
        Ok(Self::new(&config.superset_url(), &session, Box::new(transport)))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorized(&self, request: HttpRequest) -> HttpRequest {
        let cookie = if self.session_cookie.contains('=') {
            self.session_cookie.clone()
        } else {
            format!("session={}", self.session_cookie)
        };
        request.header("Cookie", &cookie)
    }

    fn send(&mut self, request: HttpRequest) -> Result<Value> {
        let url = request.url.clone();
        let response = self.transport.send(&self.authorized(request))?;
        match response.status {
            401 => Err(WikiError::NotLoggedIn(self.base_url.clone())),
            status if !(200..300).contains(&status) => {
                Err(error_from_body(&response).unwrap_or(WikiError::HttpStatus { status, url }))
            }
            _ => {
                let body = response.json()?;
                match error_message(&body) {
                    Some(message) => Err(WikiError::Superset(message)),
                    None => Ok(body),
                }
            }
        }
    }

    /// Verifies the session cookie is accepted and returns the user name.
    pub fn check_login(&mut self) -> Result<String> {
        let body = self.send(HttpRequest::get(&self.url("/api/v1/me/")))?;
        let username = body
            .get("result")
            .and_then(|result| result.get("username"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.logged_in = true;
        tracing::debug!(user = username.as_str(), "superset session accepted");
        Ok(username)
    }

    pub fn csrf_token(&mut self) -> Result<String> {
        if let Some(token) = &self.csrf_token {
            return Ok(token.clone());
        }
        let body = self.send(HttpRequest::get(&self.url("/api/v1/security/csrf_token/")))?;
        let token = body
            .get("result")
            .and_then(Value::as_str)
            .ok_or_else(|| WikiError::Superset("csrf_token response has no result".to_string()))?
            .to_string();
        self.csrf_token = Some(token.clone());
        Ok(token)
    }

    pub fn database_id_for_schema(&mut self, schema: &str) -> Result<i64> {
        let body = self.send(HttpRequest::get(&self.url("/api/v1/database/")))?;
        let ids = body
            .get("result")
            .and_then(Value::as_array)
            .map(|databases| {
                databases
                    .iter()
                    .filter_map(|database| database.get("id").and_then(Value::as_i64))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        for id in ids {
            let schemas = self.send(HttpRequest::get(
                &self.url(&format!("/api/v1/database/{id}/schemas/")),
            ))?;
            let found = schemas
                .get("result")
                .and_then(Value::as_array)
                .is_some_and(|names| names.iter().any(|name| name.as_str() == Some(schema)));
            if found {
                return Ok(id);
            }
        }
        Err(WikiError::Superset(format!("no database exposes schema {schema}")))
    }

    /// Runs `sql` synchronously and returns one JSON object per row.
    pub fn query(&mut self, sql: &str, target: &QueryTarget) -> Result<Vec<Map<String, Value>>> {
        if !self.logged_in {
            self.check_login()?;
        }
        let (database_id, schema) = match target {
            QueryTarget::DatabaseId(id) => (*id, None),
            QueryTarget::Schema(schema) => (self.database_id_for_schema(schema)?, Some(schema.clone())),
        };
        let token = self.csrf_token()?;
        let mut request = HttpRequest::post(&self.url("/api/v1/sqllab/execute/"))
            .header("X-CSRFToken", &token)
            .header("Referer", &self.url("/sqllab/"));
        request.json = Some(json!({
            "database_id": database_id,
            "schema": schema,
            "sql": sql,
            "json": true,
            "runAsync": false,
            "queryLimit": 10_000,
        }));
        let body = self.send(request)?;
        let rows = body
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| WikiError::Superset("query response has no data".to_string()))?;
        tracing::info!(database_id, rows = rows.len(), "superset query finished");
        Ok(rows
            .iter()
            .filter_map(|row| row.as_object().cloned())
            .collect())
    }
}

fn error_message(body: &Value) -> Option<String> {
    if let Some(errors) = body.get("errors").and_then(Value::as_array)
        && let Some(first) = errors.first()
    {
        return Some(
            first
                .get("message")
                .and_then(Value::as_str)
                .map(ToString::to_string)
                .unwrap_or_else(|| first.to_string()),
        );
    }
    body.get("error")
        .and_then(Value::as_str)
        .or_else(|| body.get("msg").and_then(Value::as_str))
        .map(ToString::to_string)
}

fn error_from_body(response: &HttpResponse) -> Option<WikiError> {
    let body = response.json().ok()?;
    error_message(&body).map(WikiError::Superset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;

    fn client(transport: &MockTransport) -> SupersetClient {
        SupersetClient::new("https://superset.test/", "abc", Box::new(transport.clone()))
    }

    fn header<'a>(request: &'a HttpRequest, name: &str) -> Option<&'a str> {
        request
            .headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    #[test]
    fn unauthorized_session_is_not_logged_in() {
        let transport = MockTransport::new();
        transport.push_response(401, None, "{}".to_string());
        let mut superset = client(&transport);
        assert!(matches!(superset.check_login(), Err(WikiError::NotLoggedIn(_))));
        let sent = transport.request(0);
        assert_eq!(sent.url, "https://superset.test/api/v1/me/");
        assert_eq!(header(&sent, "Cookie"), Some("session=abc"));
    }

    #[test]
    fn query_by_schema_resolves_database() {
        let transport = MockTransport::new();
        transport.push_json(json!({"result": {"username": "Bot"}}));
        transport.push_json(json!({"result": [{"id": 1}, {"id": 2}]}));
        transport.push_json(json!({"result": ["dewiki_p"]}));
        transport.push_json(json!({"result": ["enwiki_p", "information_schema"]}));
        transport.push_json(json!({"result": "csrf-1"}));
        transport.push_json(json!({"data": [{"page_title": "Foo", "page_len": 10}], "columns": []}));
        let mut superset = client(&transport);
        let rows = superset
            .query("SELECT page_title FROM page", &QueryTarget::Schema("enwiki_p".to_string()))
            .expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["page_title"], "Foo");

        let execute = transport.request(5);
        assert_eq!(execute.url, "https://superset.test/api/v1/sqllab/execute/");
        assert_eq!(header(&execute, "X-CSRFToken"), Some("csrf-1"));
        assert_eq!(header(&execute, "Referer"), Some("https://superset.test/sqllab/"));
        let body = execute.json.expect("json body");
        assert_eq!(body["database_id"], 2);
        assert_eq!(body["schema"], "enwiki_p");
    }

    #[test]
    fn body_errors_surface_as_superset_errors() {
        let transport = MockTransport::new();
        transport.push_json(json!({"result": {"username": "Bot"}}));
        transport.push_json(json!({"result": "csrf-1"}));
        transport.push_json(json!({"errors": [{"message": "syntax error near SELEC"}]}));
        let mut superset = client(&transport);
        let error = superset
            .query("SELEC 1", &QueryTarget::DatabaseId(3))
            .expect_err("error");
        assert!(matches!(error, WikiError::Superset(ref message) if message.contains("SELEC")));
    }
}
