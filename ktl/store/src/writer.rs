use std::{path::Path, sync::Arc};

use rusqlite::Connection;

use crate::error::StoreError;

/// Single-writer handle over one stack's embedded database file
/// (`spec.md` §4.3 "Single writer: all writes for a RunID go through one
/// in-process serializer", §5 "single-writer-per-stack resource").
///
/// `rusqlite::Connection` is `Send` but not `Sync`; wrapping it in a
/// `std::sync::Mutex` and running every access inside `spawn_blocking`
/// gives us the serialization the spec requires without a dedicated actor
/// task and channel plumbing.
#[derive(Clone)]
pub struct Writer {
    conn: Arc<std::sync::Mutex<Connection>>,
}

impl Writer {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        crate::schema::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(std::sync::Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(std::sync::Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on a blocking thread, serialized by
    /// the mutex. `f` is synchronous on purpose: rusqlite has no async API,
    /// and forcing every call through `spawn_blocking` keeps that fact from
    /// leaking into callers.
    pub async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|join_err| StoreError::WriterPanicked(join_err.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_conn_runs_on_blocking_thread() {
        let writer = Writer::open_in_memory().unwrap();
        let count: i64 = writer
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT count(*) FROM runs", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
