//! Persistent store of the last observed fingerprint for every dependency key.
//!
//! The store is a single SQLite file holding one table. It is opened in
//! exclusive locking mode, so a second `kiln` running against the same cache
//! gives up after [`LOCK_TIMEOUT`] instead of racing the first one.

use std::fs;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;

use camino::Utf8Path;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::CacheError;

/// Width in bytes of every value stored in the cache.
pub const VALUE_SIZE: usize = 28;

/// How long [`Cache::open`] waits for another process to release the store.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct Cache {
    conn: Mutex<Connection>,
    err: OnceLock<CacheError>,
}

impl Cache {
    pub fn open(path: impl AsRef<Utf8Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent()
            && !dir.as_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(LOCK_TIMEOUT)?;
        // The first write transaction takes the lock, which the exclusive
        // locking mode then keeps until the connection is closed.
        conn.execute_batch(
            "PRAGMA locking_mode = EXCLUSIVE;
             BEGIN EXCLUSIVE;
             CREATE TABLE IF NOT EXISTS fingerprints (
                 key   TEXT PRIMARY KEY NOT NULL,
                 value BLOB NOT NULL
             );
             COMMIT;",
        )?;

        tracing::debug!("opened cache at {path}");

        Ok(Self {
            conn: Mutex::new(conn),
            err: OnceLock::new(),
        })
    }

    /// Stores `value` under `key` and reports whether it differs from the
    /// value stored by the previous call for the same key. A key seen for the
    /// first time counts as changed, and so does every call once the store
    /// has failed.
    ///
    /// # Panics
    ///
    /// Panics if `value` is not exactly [`VALUE_SIZE`] bytes long.
    pub fn set(&self, key: &str, value: impl AsRef<[u8]>) -> bool {
        let value = value.as_ref();
        assert_eq!(
            value.len(),
            VALUE_SIZE,
            "cache value for '{key}' has a bad length"
        );

        match self.swap(key, value) {
            Ok(previous) => previous.as_deref() != Some(value),
            Err(err) => {
                tracing::warn!("cache write for '{key}' failed, assuming changed: {err}");
                let _ = self.err.set(err);
                true
            }
        }
    }

    fn swap(&self, key: &str, value: &[u8]) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction()?;

        let previous = tx
            .query_row(
                "SELECT value FROM fingerprints WHERE key = ?1",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;

        tx.execute(
            "INSERT INTO fingerprints (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        tx.commit()?;

        Ok(previous)
    }

    /// Drops whatever is stored under `key`, so the next [`Cache::set`] for
    /// it reports a change.
    pub fn forget(&self, key: &str) {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = conn.execute("DELETE FROM fingerprints WHERE key = ?1", params![key]) {
            tracing::warn!("couldn't drop cache entry '{key}': {err}");
            let _ = self.err.set(err.into());
        }
    }

    /// The first error the store ran into, if any.
    pub fn err(&self) -> Option<&CacheError> {
        self.err.get()
    }

    pub fn close(self) -> Result<(), CacheError> {
        let conn = self
            .conn
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        conn.close().map_err(|(_, err)| CacheError::Store(err))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    use super::*;

    fn value(s: &str) -> [u8; VALUE_SIZE] {
        let mut buf = [0u8; VALUE_SIZE];
        buf[..s.len()].copy_from_slice(s.as_bytes());
        buf
    }

    fn cache_path(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::try_from(dir.path().join("nested").join("cache.db")).unwrap()
    }

    #[test]
    fn test_set_reports_changes() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(cache_path(&dir)).unwrap();

        assert!(cache.set("aa", value("a")));
        assert!(!cache.set("aa", value("a")));
        assert!(cache.set("aa", value("b")));
        assert!(cache.set("ab", value("a")));
        assert!(cache.err().is_none());
    }

    #[test]
    fn test_values_persist_across_opens() {
        let dir = TempDir::new().unwrap();
        let path = cache_path(&dir);

        let cache = Cache::open(&path).unwrap();
        assert!(cache.set("key", value("v1")));
        cache.close().unwrap();

        let cache = Cache::open(&path).unwrap();
        assert!(!cache.set("key", value("v1")));
        assert!(cache.set("key", value("v2")));
        cache.close().unwrap();
    }

    #[test]
    fn test_forget() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(cache_path(&dir)).unwrap();

        assert!(cache.set("key", value("v1")));
        cache.forget("key");
        assert!(cache.set("key", value("v1")));
        assert!(!cache.set("key", value("v1")));
        cache.forget("never-stored");
        assert!(cache.err().is_none());
    }

    #[test]
    fn test_second_open_fails_while_locked() {
        let dir = TempDir::new().unwrap();
        let path = cache_path(&dir);

        let _held = Cache::open(&path).unwrap();
        assert!(Cache::open(&path).is_err());
    }

    #[test]
    #[should_panic(expected = "bad length")]
    fn test_wrong_width_panics() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(cache_path(&dir)).unwrap();
        cache.set("short", [1u8, 2, 3]);
    }

    #[test]
    fn test_concurrent_set() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(Cache::open(cache_path(&dir)).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    let key = format!("key-{i}");
                    (cache.set(&key, value("x")), cache.set(&key, value("x")))
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), (true, false));
        }
        assert!(cache.err().is_none());
    }
}
