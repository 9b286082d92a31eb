//! SQLite-backed backlog store.
//!
//! One row per parked envelope; rowid order doubles as insertion order,
//! so newest-first reads are `ORDER BY id DESC`. TTLs live in a side
//! table keyed by list key; expired lists are purged on access rather
//! than by a background job.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::offline::{BacklogStore, StoreError};

type SqlResult<T> = Result<T, rusqlite::Error>;

pub struct SqliteBacklog {
    db: Mutex<Connection>,
}

impl SqliteBacklog {
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let store = SqliteBacklog { db: Mutex::new(conn) };
        store.init()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = SqliteBacklog { db: Mutex::new(conn) };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> SqlResult<()> {
        let db = self.db.lock();
        db.execute_batch(
            "PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS backlog (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_backlog_key ON backlog(key);

            CREATE TABLE IF NOT EXISTS backlog_expiry (
                key TEXT PRIMARY KEY,
                expires_at INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Drop the list if its deadline has passed.
    fn purge_if_expired(db: &Connection, key: &str) -> SqlResult<()> {
        let expires_at: Option<i64> = db
            .query_row(
                "SELECT expires_at FROM backlog_expiry WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(at) = expires_at {
            if at <= chrono::Utc::now().timestamp() {
                db.execute("DELETE FROM backlog WHERE key = ?1", params![key])?;
                db.execute("DELETE FROM backlog_expiry WHERE key = ?1", params![key])?;
            }
        }
        Ok(())
    }

    fn append_inner(&self, key: &str, value: &str) -> SqlResult<()> {
        let db = self.db.lock();
        Self::purge_if_expired(&db, key)?;
        db.execute(
            "INSERT INTO backlog (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn trim_inner(&self, key: &str, n: usize) -> SqlResult<()> {
        let db = self.db.lock();
        db.execute(
            "DELETE FROM backlog WHERE key = ?1 AND id NOT IN (
                SELECT id FROM backlog WHERE key = ?1 ORDER BY id DESC LIMIT ?2
            )",
            params![key, n as i64],
        )?;
        Ok(())
    }

    fn expire_inner(&self, key: &str, ttl_secs: i64) -> SqlResult<()> {
        let db = self.db.lock();
        let expires_at = chrono::Utc::now().timestamp() + ttl_secs;
        db.execute(
            "INSERT INTO backlog_expiry (key, expires_at) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at",
            params![key, expires_at],
        )?;
        Ok(())
    }

    fn read_all_inner(&self, key: &str) -> SqlResult<Vec<String>> {
        let db = self.db.lock();
        Self::purge_if_expired(&db, key)?;
        let mut stmt =
            db.prepare("SELECT value FROM backlog WHERE key = ?1 ORDER BY id DESC")?;
        let rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        rows.collect()
    }

    fn delete_inner(&self, key: &str) -> SqlResult<()> {
        let db = self.db.lock();
        db.execute("DELETE FROM backlog WHERE key = ?1", params![key])?;
        db.execute("DELETE FROM backlog_expiry WHERE key = ?1", params![key])?;
        Ok(())
    }
}

impl BacklogStore for SqliteBacklog {
    fn append(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.append_inner(key, value)
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn trim_to_length(&self, key: &str, n: usize) -> Result<(), StoreError> {
        self.trim_inner(key, n)
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn expire(&self, key: &str, ttl: std::time::Duration) -> Result<(), StoreError> {
        self.expire_inner(key, ttl.as_secs() as i64)
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn read_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.read_all_inner(key)
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.delete_inner(key)
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn make_store() -> SqliteBacklog {
        SqliteBacklog::open_memory().unwrap()
    }

    #[test]
    fn read_all_is_newest_first() {
        let store = make_store();
        for i in 0..4 {
            store.append("u:1", &format!("v{i}")).unwrap();
        }
        assert_eq!(store.read_all("u:1").unwrap(), vec!["v3", "v2", "v1", "v0"]);
    }

    #[test]
    fn trim_keeps_the_newest_entries() {
        let store = make_store();
        for i in 0..10 {
            store.append("u:1", &format!("v{i}")).unwrap();
        }
        store.trim_to_length("u:1", 3).unwrap();
        assert_eq!(store.read_all("u:1").unwrap(), vec!["v9", "v8", "v7"]);
    }

    #[test]
    fn keys_are_isolated() {
        let store = make_store();
        store.append("u:1", "a").unwrap();
        store.append("u:2", "b").unwrap();
        store.trim_to_length("u:1", 0).unwrap();
        assert!(store.read_all("u:1").unwrap().is_empty());
        assert_eq!(store.read_all("u:2").unwrap(), vec!["b"]);
    }

    #[test]
    fn expired_lists_are_purged_on_read() {
        let store = make_store();
        store.append("u:1", "a").unwrap();
        store.expire("u:1", Duration::ZERO).unwrap();
        assert!(store.read_all("u:1").unwrap().is_empty());
        // The expiry row went with it; a fresh append is a fresh list.
        store.append("u:1", "b").unwrap();
        assert_eq!(store.read_all("u:1").unwrap(), vec!["b"]);
    }

    #[test]
    fn expired_lists_are_purged_on_append() {
        let store = make_store();
        store.append("u:1", "a").unwrap();
        store.expire("u:1", Duration::ZERO).unwrap();
        store.append("u:1", "b").unwrap();
        assert_eq!(store.read_all("u:1").unwrap(), vec!["b"]);
    }

    #[test]
    fn refreshing_ttl_keeps_the_list_alive() {
        let store = make_store();
        store.append("u:1", "a").unwrap();
        store.expire("u:1", Duration::from_secs(3600)).unwrap();
        store.expire("u:1", Duration::from_secs(7200)).unwrap();
        assert_eq!(store.read_all("u:1").unwrap(), vec!["a"]);
    }

    #[test]
    fn delete_removes_list_and_ttl() {
        let store = make_store();
        store.append("u:1", "a").unwrap();
        store.expire("u:1", Duration::from_secs(3600)).unwrap();
        store.delete("u:1").unwrap();
        assert!(store.read_all("u:1").unwrap().is_empty());
    }

    #[test]
    fn missing_key_reads_empty() {
        let store = make_store();
        assert!(store.read_all("nope").unwrap().is_empty());
    }
}
