use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Result;

const CACHE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS api_cache (
    key TEXT PRIMARY KEY,
    body TEXT NOT NULL,
    stored_at_unix INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_api_cache_stored_at ON api_cache(stored_at_unix);
"#;

pub struct ResponseCache {
    connection: Connection,
}

impl ResponseCache {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let connection = Connection::open(path)?;
        connection.execute_batch(CACHE_SCHEMA_SQL)?;
        Ok(Self { connection })
    }

    pub fn in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory()?;
        connection.execute_batch(CACHE_SCHEMA_SQL)?;
        Ok(Self { connection })
    }

    /// Cache key for a request. Token parameters are left out so a cached
    /// response survives a session change.
    pub fn key(api_url: &str, params: &[(String, String)]) -> String {
        let mut sorted = params
            .iter()
            .filter(|(name, _)| !name.ends_with("token") && name != "assert")
            .collect::<Vec<_>>();
        sorted.sort();
        let mut hasher = Sha256::new();
        hasher.update(api_url.as_bytes());
        for (name, value) in sorted {
            hasher.update([0u8]);
            hasher.update(name.as_bytes());
            hasher.update([b'=']);
            hasher.update(value.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, key: &str, max_age: Duration) -> Result<Option<Value>> {
        let cutoff = unix_now().saturating_sub(max_age.as_secs());
        let body: Option<String> = self
            .connection
            .query_row(
                "SELECT body FROM api_cache WHERE key = ?1 AND stored_at_unix >= ?2",
                params![key, cutoff as i64],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(body) => match serde_json::from_str(&body) {
                Ok(value) => Ok(Some(value)),
                Err(error) => {
                    tracing::warn!(%error, "dropping corrupt cache entry");
                    self.connection
                        .execute("DELETE FROM api_cache WHERE key = ?1", params![key])?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub fn put(&self, key: &str, value: &Value) -> Result<()> {
        self.put_at(key, value, unix_now())
    }

    fn put_at(&self, key: &str, value: &Value, stored_at: u64) -> Result<()> {
        self.connection.execute(
            "INSERT INTO api_cache (key, body, stored_at_unix) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET body = excluded.body, stored_at_unix = excluded.stored_at_unix",
            params![key, value.to_string(), stored_at as i64],
        )?;
        Ok(())
    }

    /// Delete entries older than `max_age`; returns the number removed.
    pub fn purge_expired(&self, max_age: Duration) -> Result<usize> {
        let cutoff = unix_now().saturating_sub(max_age.as_secs());
        let removed = self.connection.execute(
            "DELETE FROM api_cache WHERE stored_at_unix < ?1",
            params![cutoff as i64],
        )?;
        Ok(removed)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
