//! SQLite-backed mapping store.
//!
//! Layout: one table `map (hash, actual, occurrences)` keyed by pseudonym.
//! Counter changes are single SQL statements or immediate transactions, so
//! they stay atomic across processes sharing the same database file, not
//! just across tasks in this one.
//!
//! `rusqlite` is blocking; every call runs on `spawn_blocking`.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::error::{MaskError, MaskResult};
use crate::hasher::Pseudonym;
use crate::mapping::{collision, not_found, zero_count, MappingEntry, MappingStore};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS map (
        hash TEXT PRIMARY KEY,
        actual TEXT NOT NULL,
        occurrences INTEGER NOT NULL CHECK (occurrences > 0)
    );
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Persistent mapping store backed by a SQLite file.
#[derive(Clone)]
pub struct SqliteMappingStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMappingStore {
    /// Opens (or creates) a mapping store at the given path.
    pub fn open(path: impl AsRef<Path>) -> MaskResult<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| MaskError::Store(format!("failed to open mapping store: {e}")))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(|e| MaskError::Store(format!("failed to enable WAL: {e}")))?;
        Self::init(conn)
    }

    /// Opens an in-memory mapping store.
    pub fn open_in_memory() -> MaskResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| MaskError::Store(format!("failed to open in-memory mapping store: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> MaskResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| MaskError::Store(format!("failed to set busy timeout: {e}")))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| MaskError::Store(format!("failed to init mapping schema: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> MaskResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> MaskResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| MaskError::Store("mapping connection lock poisoned".into()))?;
            op(&mut guard)
        })
        .await?
    }
}

fn to_count(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or(0)
}

fn to_sql_count(pseudonym: &Pseudonym, count: u64) -> MaskResult<i64> {
    i64::try_from(count).map_err(|_| {
        MaskError::InvalidArgument(format!("occurrence count for {} overflows", pseudonym.short()))
    })
}

#[async_trait]
impl MappingStore for SqliteMappingStore {
    async fn exists(&self, pseudonym: &Pseudonym) -> MaskResult<bool> {
        let key = pseudonym.as_str().to_string();
        self.with_conn(move |conn| {
            let found: bool = conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM map WHERE hash = ?1)",
                params![key],
                |row| row.get(0),
            )?;
            Ok(found)
        })
        .await
    }

    async fn create(
        &self,
        pseudonym: &Pseudonym,
        plaintext: &str,
        occurrences: u64,
    ) -> MaskResult<()> {
        if occurrences == 0 {
            return Err(zero_count(pseudonym));
        }
        let count = to_sql_count(pseudonym, occurrences)?;
        let p = pseudonym.clone();
        let plaintext = plaintext.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO map (hash, actual, occurrences) VALUES (?1, ?2, ?3)",
                params![p.as_str(), plaintext, count],
            )
            .map_err(|e| match MaskError::from(e) {
                MaskError::DuplicateKey(_) => {
                    MaskError::DuplicateKey(format!("pseudonym {} already exists", p.short()))
                }
                other => other,
            })?;
            Ok(())
        })
        .await
    }

    async fn read_by_key(&self, pseudonym: &Pseudonym) -> MaskResult<MappingEntry> {
        let p = pseudonym.clone();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT actual, occurrences FROM map WHERE hash = ?1",
                    params![p.as_str()],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?;
            match row {
                Some((plaintext, occurrences)) => Ok(MappingEntry {
                    pseudonym: p,
                    plaintext,
                    occurrences: to_count(occurrences),
                }),
                None => Err(not_found(&p)),
            }
        })
        .await
    }

    async fn update(&self, pseudonym: &Pseudonym, occurrences: u64) -> MaskResult<()> {
        if occurrences == 0 {
            return Err(zero_count(pseudonym));
        }
        let count = to_sql_count(pseudonym, occurrences)?;
        let p = pseudonym.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE map SET occurrences = ?1 WHERE hash = ?2",
                params![count, p.as_str()],
            )?;
            if changed == 0 {
                return Err(not_found(&p));
            }
            Ok(())
        })
        .await
    }

    async fn delete_by_keys(&self, pseudonyms: &[Pseudonym]) -> MaskResult<()> {
        let keys = pseudonyms.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            for p in &keys {
                let changed = tx.execute("DELETE FROM map WHERE hash = ?1", params![p.as_str()])?;
                if changed == 0 {
                    // Dropping the transaction rolls back the deletes so far.
                    return Err(not_found(p));
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn increment_or_create(
        &self,
        pseudonym: &Pseudonym,
        plaintext: &str,
    ) -> MaskResult<u64> {
        let p = pseudonym.clone();
        let plaintext = plaintext.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let (stored, count): (String, i64) = tx.query_row(
                "INSERT INTO map (hash, actual, occurrences) VALUES (?1, ?2, 1)
                 ON CONFLICT(hash) DO UPDATE SET occurrences = occurrences + 1
                 RETURNING actual, occurrences",
                params![p.as_str(), plaintext],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            if stored != plaintext {
                return Err(collision(&p));
            }
            tx.commit()?;
            debug!(pseudonym = %p.short(), occurrences = count, "mapping incremented");
            Ok(to_count(count))
        })
        .await
    }

    async fn decrement_or_delete(&self, pseudonym: &Pseudonym) -> MaskResult<u64> {
        let p = pseudonym.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let remaining: Option<i64> = tx
                .query_row(
                    "UPDATE map SET occurrences = occurrences - 1
                     WHERE hash = ?1 AND occurrences > 1
                     RETURNING occurrences",
                    params![p.as_str()],
                    |row| row.get(0),
                )
                .optional()?;

            let remaining = match remaining {
                Some(count) => to_count(count),
                None => {
                    let deleted = tx.execute("DELETE FROM map WHERE hash = ?1", params![p.as_str()])?;
                    if deleted == 0 {
                        return Err(not_found(&p));
                    }
                    0
                }
            };
            tx.commit()?;
            debug!(pseudonym = %p.short(), occurrences = remaining, "mapping decremented");
            Ok(remaining)
        })
        .await
    }

    async fn len(&self) -> MaskResult<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM map", [], |row| row.get(0))?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Pseudonym {
        Pseudonym::from_stored(s)
    }

    #[tokio::test]
    async fn test_point_operations() {
        let store = SqliteMappingStore::open_in_memory().unwrap();
        assert!(!store.exists(&p("h1")).await.unwrap());

        store.create(&p("h1"), "alice", 1).await.unwrap();
        assert!(store.exists(&p("h1")).await.unwrap());
        assert!(matches!(
            store.create(&p("h1"), "alice", 1).await,
            Err(MaskError::DuplicateKey(_))
        ));

        store.update(&p("h1"), 3).await.unwrap();
        let entry = store.read_by_key(&p("h1")).await.unwrap();
        assert_eq!(entry.plaintext, "alice");
        assert_eq!(entry.occurrences, 3);

        store.delete_by_keys(&[p("h1")]).await.unwrap();
        assert!(matches!(
            store.read_by_key(&p("h1")).await,
            Err(MaskError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_by_keys_rolls_back_on_missing() {
        let store = SqliteMappingStore::open_in_memory().unwrap();
        store.create(&p("h1"), "alice", 1).await.unwrap();
        assert!(matches!(
            store.delete_by_keys(&[p("h1"), p("missing")]).await,
            Err(MaskError::NotFound(_))
        ));
        assert!(store.exists(&p("h1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_and_decrement() {
        let store = SqliteMappingStore::open_in_memory().unwrap();
        assert_eq!(store.increment_or_create(&p("h"), "v").await.unwrap(), 1);
        assert_eq!(store.increment_or_create(&p("h"), "v").await.unwrap(), 2);
        assert_eq!(store.len().await.unwrap(), 1);

        assert_eq!(store.decrement_or_delete(&p("h")).await.unwrap(), 1);
        assert_eq!(store.decrement_or_delete(&p("h")).await.unwrap(), 0);
        assert_eq!(store.len().await.unwrap(), 0);
        assert!(matches!(
            store.decrement_or_delete(&p("h")).await,
            Err(MaskError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_collision_is_rolled_back() {
        let store = SqliteMappingStore::open_in_memory().unwrap();
        store.increment_or_create(&p("h"), "one").await.unwrap();
        assert!(matches!(
            store.increment_or_create(&p("h"), "two").await,
            Err(MaskError::DuplicateKey(_))
        ));
        assert_eq!(store.read_by_key(&p("h")).await.unwrap().occurrences, 1);
    }

    #[tokio::test]
    async fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.db");
        {
            let store = SqliteMappingStore::open(&path).unwrap();
            store.increment_or_create(&p("h"), "kept").await.unwrap();
        }
        let reopened = SqliteMappingStore::open(&path).unwrap();
        assert_eq!(reopened.read_by_key(&p("h")).await.unwrap().plaintext, "kept");
    }
}
