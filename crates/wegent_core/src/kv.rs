use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use tracing::info;

use crate::config::WegentDirs;

/// Key under which the sanitized post-login return path is stored.
pub const POST_LOGIN_REDIRECT_KEY: &str = "post_login_redirect_path";

/// SQLite-backed key-value store for small client-side records: the
/// correction-mode settings per task and the post-login redirect path.
pub struct KvStore {
    conn: Connection,
}

impl KvStore {
    /// Opens (or creates) the store at `~/.wegent/state.db`.
    pub fn open() -> Result<Self> {
        Self::open_at(WegentDirs::db_path()?)
    }

    /// Opens (or creates) the store at the given path.
    pub fn open_at(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open store: {}", path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self { conn };
        store.init_schema()?;
        info!("Key-value store opened at {}", path.display());
        Ok(store)
    }

    /// Opens an in-memory store (for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory store")?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )?;
        Ok(())
    }

    /// Store a string value under a key, replacing any previous value.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO kv_entries (key, value, updated_at)
                 VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET
                     value = excluded.value,
                     updated_at = excluded.updated_at",
                params![key, value],
            )
            .with_context(|| format!("Failed to store key {key}"))?;
        Ok(())
    }

    /// Fetch the value for a key, or `None` if absent.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM kv_entries WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to read key {key}"))
    }

    /// Remove a key. Removing an absent key is not an error.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM kv_entries WHERE key = ?1", params![key])
            .with_context(|| format!("Failed to remove key {key}"))?;
        Ok(())
    }

    /// Store a serializable value as JSON.
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)
            .with_context(|| format!("Failed to serialize value for key {key}"))?;
        self.set(key, &json)
    }

    /// Fetch and deserialize a JSON value. A corrupt record reads as `None`.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(json) => Ok(serde_json::from_str(&json).ok()),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn set_get_round_trip() {
        let store = KvStore::open_in_memory().unwrap();
        store.set("greeting", "hello").unwrap();
        assert_eq!(store.get("greeting").unwrap().as_deref(), Some("hello"));
    }

    #[test]
    fn get_missing_key_is_none() {
        let store = KvStore::open_in_memory().unwrap();
        assert!(store.get("absent").unwrap().is_none());
    }

    #[test]
    fn set_overwrites() {
        let store = KvStore::open_in_memory().unwrap();
        store.set("k", "first").unwrap();
        store.set("k", "second").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("second"));
    }

    #[test]
    fn remove_deletes_and_is_idempotent() {
        let store = KvStore::open_in_memory().unwrap();
        store.set("k", "v").unwrap();
        store.remove("k").unwrap();
        assert!(store.get("k").unwrap().is_none());
        store.remove("k").unwrap();
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Prefs {
        enabled: bool,
        model: String,
    }

    #[test]
    fn json_round_trip() {
        let store = KvStore::open_in_memory().unwrap();
        let prefs = Prefs {
            enabled: true,
            model: "gpt-test".into(),
        };
        store.set_json("prefs", &prefs).unwrap();
        let loaded: Option<Prefs> = store.get_json("prefs").unwrap();
        assert_eq!(loaded, Some(prefs));
    }

    #[test]
    fn corrupt_json_reads_as_none() {
        let store = KvStore::open_in_memory().unwrap();
        store.set("prefs", "{ not json").unwrap();
        let loaded: Option<Prefs> = store.get_json("prefs").unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn persists_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.db");
        {
            let store = KvStore::open_at(path.clone()).unwrap();
            store.set("durable", "yes").unwrap();
        }
        let store = KvStore::open_at(path).unwrap();
        assert_eq!(store.get("durable").unwrap().as_deref(), Some("yes"));
    }
}
