use serde::Serialize;
use serde_json::{Map, Value};

use crate::api::{QueryGenerator, Request};
use crate::error::{Result, WikiError};
use crate::site::Site;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogDetails {
    Block {
        duration: Option<String>,
        expiry: Option<String>,
        flags: Vec<String>,
    },
    Move {
        target: Option<String>,
        suppress_redirect: bool,
    },
    Rights {
        old_groups: Vec<String>,
        new_groups: Vec<String>,
    },
    Patrol {
        current_id: Option<i64>,
        previous_id: Option<i64>,
        auto: bool,
    },
    Protect {
        description: Option<String>,
    },
    Upload {
        sha1: Option<String>,
    },
    Delete,
    Other,
}

/// Parts of an entry suppressed by revision deletion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HiddenFields {
    pub action: bool,
    pub user: bool,
    pub comment: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub logid: i64,
    pub log_type: String,
    /// `None` when the action was revision-deleted.
    pub action: Option<String>,
    pub timestamp: String,
    pub user: Option<String>,
    pub title: Option<String>,
    pub namespace: Option<i32>,
    pub pageid: Option<i64>,
    pub comment: Option<String>,
    pub params: Map<String, Value>,
    pub hidden: HiddenFields,
    pub details: LogDetails,
}

fn string_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(ToString::to_string)
}

fn string_list(map: &Map<String, Value>, key: &str) -> Vec<String> {
    map.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn flag(map: &Map<String, Value>, key: &str) -> bool {
    match map.get(key) {
        Some(Value::Bool(value)) => *value,
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

impl LogEntry {
    pub fn from_api(value: &Value) -> Result<Self> {
        let entry = value
            .as_object()
            .ok_or_else(|| WikiError::Unexpected(format!("log entry is not an object: {value}")))?;
        let log_type = string_field(entry, "type")
            .ok_or_else(|| WikiError::Unexpected("log entry has no type".to_string()))?;
        let hidden = |field: &str| flag(entry, &format!("{field}hidden"));
        let params = entry
            .get("params")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let details = match log_type.as_str() {
            "block" => LogDetails::Block {
                duration: string_field(&params, "duration"),
                expiry: string_field(&params, "expiry"),
                flags: string_list(&params, "flags"),
            },
            "move" => LogDetails::Move {
                target: string_field(&params, "target_title"),
                suppress_redirect: flag(&params, "suppressredirect"),
            },
            "rights" => LogDetails::Rights {
                old_groups: string_list(&params, "oldgroups"),
                new_groups: string_list(&params, "newgroups"),
            },
            "patrol" => LogDetails::Patrol {
                current_id: params.get("curid").and_then(Value::as_i64),
                previous_id: params.get("previd").and_then(Value::as_i64),
                auto: flag(&params, "auto"),
            },
            "protect" => LogDetails::Protect {
                description: string_field(&params, "description"),
            },
            "upload" => LogDetails::Upload {
                sha1: string_field(&params, "img_sha1").or_else(|| string_field(entry, "sha1")),
            },
            "delete" => LogDetails::Delete,
            _ => LogDetails::Other,
        };

        let hidden = HiddenFields {
            action: hidden("action"),
            user: hidden("user"),
            comment: hidden("comment"),
        };
        let action_hidden = hidden.action;
        Ok(Self {
            logid: entry.get("logid").and_then(Value::as_i64).unwrap_or_default(),
            log_type,
            action: string_field(entry, "action").filter(|_| !action_hidden),
            timestamp: string_field(entry, "timestamp").unwrap_or_default(),
            user: string_field(entry, "user").filter(|_| !hidden.user),
            title: string_field(entry, "title").filter(|_| !action_hidden),
            namespace: entry
                .get("ns")
                .and_then(Value::as_i64)
                .and_then(|ns| i32::try_from(ns).ok())
                .filter(|_| !action_hidden),
            pageid: entry
                .get("pageid")
                .and_then(Value::as_i64)
                .filter(|id| *id > 0),
            comment: string_field(entry, "comment").filter(|_| !hidden.comment),
            params,
            hidden,
            details,
        })
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden.action || self.hidden.user || self.hidden.comment
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub log_type: Option<String>,
    /// Either `action` alone (combined with `log_type`) or `type/action`.
    pub action: Option<String>,
    pub user: Option<String>,
    pub title: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    /// Oldest first instead of newest first.
    pub reverse: bool,
    pub limit: Option<usize>,
}

impl Site {
    pub fn log_events(&mut self, filter: &LogFilter) -> Result<Vec<LogEntry>> {
        let action = match (&filter.log_type, &filter.action) {
            (_, Some(action)) if action.contains('/') => action.clone(),
            (Some(log_type), Some(action)) => format!("{log_type}/{action}"),
            _ => String::new(),
        };
        let mut request = Request::query()
            .set("leprop", "ids|title|type|user|timestamp|comment|details")
            .set("leuser", filter.user.clone().unwrap_or_default())
            .set("letitle", filter.title.clone().unwrap_or_default())
            .set("lestart", filter.start.clone().unwrap_or_default())
            .set("leend", filter.end.clone().unwrap_or_default());
        request = if action.is_empty() {
            request.set("letype", filter.log_type.clone().unwrap_or_default())
        } else {
            request.set("leaction", action)
        };
        if filter.reverse {
            request = request.set("ledir", "newer");
        }
        let items = QueryGenerator::list(request, "logevents", "le")
            .with_limit(filter.limit)
            .collect(self.api_mut())?;
        items.iter().map(LogEntry::from_api).collect()
    }
}
