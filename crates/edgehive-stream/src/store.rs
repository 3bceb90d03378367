use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use crate::error::{Result, StreamError};

/// One persisted endpoint: the name announced to the cloud and the upstream
/// source URL it relays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUrl {
    pub endpoint: String,
    pub url: String,
}

/// SQLite-backed endpoint table. rusqlite's `Connection` is not `Sync`, so
/// it sits behind a std mutex and every query runs on the blocking pool.
struct UrlTable {
    conn: StdMutex<Connection>,
}

impl UrlTable {
    fn open(path: Option<&Path>) -> Result<Self> {
        let conn = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };

        conn.pragma_update(None, "journal_mode", "WAL").ok();
        // Rows must survive power loss once a start is acknowledged.
        conn.pragma_update(None, "synchronous", "FULL").ok();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS endpoint_urls (
                endpoint    TEXT PRIMARY KEY NOT NULL,
                url         TEXT NOT NULL,
                created_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM endpoint_urls", [], |row| row.get(0))
            .unwrap_or(0);
        if count > 0 {
            tracing::info!(count, "loaded stream endpoints from disk");
        }

        Ok(Self {
            conn: StdMutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StreamError::StoreTask(format!("lock poisoned: {e}")))
    }

    fn insert(&self, endpoint: &str, url: &str) -> Result<()> {
        let conn = self.lock()?;
        match conn.execute(
            "INSERT INTO endpoint_urls (endpoint, url) VALUES (?1, ?2)",
            rusqlite::params![endpoint, url],
        ) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                Err(StreamError::AlreadyExists(endpoint.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, endpoint: &str) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute("DELETE FROM endpoint_urls WHERE endpoint = ?1", [endpoint])?;
        Ok(n > 0)
    }

    fn get(&self, endpoint: &str) -> Result<Option<EndpointUrl>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT endpoint, url FROM endpoint_urls WHERE endpoint = ?1",
                [endpoint],
                |row| {
                    Ok(EndpointUrl {
                        endpoint: row.get(0)?,
                        url: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn list(&self) -> Result<Vec<EndpointUrl>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT endpoint, url FROM endpoint_urls ORDER BY endpoint")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(EndpointUrl {
                    endpoint: row.get(0)?,
                    url: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM endpoint_urls", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

/// Durable endpoint → URL map. Cheap to clone.
#[derive(Clone)]
pub struct UrlStore {
    table: Arc<UrlTable>,
}

impl UrlStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            table: Arc::new(UrlTable::open(Some(path))?),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            table: Arc::new(UrlTable::open(None)?),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&UrlTable) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let table = self.table.clone();
        tokio::task::spawn_blocking(move || f(&table))
            .await
            .map_err(|e| StreamError::StoreTask(format!("spawn_blocking failed: {e}")))?
    }

    /// Fails with [`StreamError::AlreadyExists`] if the endpoint is stored.
    pub async fn insert(&self, endpoint: &str, url: &str) -> Result<()> {
        let (endpoint, url) = (endpoint.to_string(), url.to_string());
        self.blocking(move |t| t.insert(&endpoint, &url)).await
    }

    /// Returns whether a row was removed.
    pub async fn delete(&self, endpoint: &str) -> Result<bool> {
        let endpoint = endpoint.to_string();
        self.blocking(move |t| t.delete(&endpoint)).await
    }

    pub async fn get(&self, endpoint: &str) -> Result<Option<EndpointUrl>> {
        let endpoint = endpoint.to_string();
        self.blocking(move |t| t.get(&endpoint)).await
    }

    pub async fn list(&self) -> Result<Vec<EndpointUrl>> {
        self.blocking(|t| t.list()).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.blocking(|t| t.count()).await? == 0)
    }
}
