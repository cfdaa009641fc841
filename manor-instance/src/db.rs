//! Instance database connection management
//!
//! Each instance exclusively owns one local SQLite file (via libsql). The
//! open path retries with exponential backoff so a freshly provisioned
//! instance survives a slow volume mount.

use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Open the instance database, retrying with exponential backoff.
pub async fn open_database(
    path: &Path,
    max_retries: u32,
    retry_delay_secs: u64,
) -> Result<libsql::Database> {
    let base_delay = Duration::from_secs(retry_delay_secs);
    let mut attempt = 0;

    loop {
        match libsql::Builder::new_local(path).build().await {
            Ok(db) => {
                if attempt > 0 {
                    tracing::info!(
                        "database opened after {} attempt(s): {}",
                        attempt + 1,
                        path.display()
                    );
                } else {
                    tracing::debug!("database opened: {}", path.display());
                }
                return Ok(db);
            }
            Err(e) => {
                attempt += 1;
                if attempt > max_retries {
                    tracing::error!(
                        "failed to open database '{}' after {} attempts: {}",
                        path.display(),
                        max_retries + 1,
                        e
                    );
                    return Err(Error::Database(format!(
                        "failed to open database '{}': {}",
                        path.display(),
                        e
                    )));
                }

                let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));
                tracing::warn!(
                    "database open attempt {} failed: {}. Retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Open an in-memory database for tests and tooling.
pub async fn open_memory_database() -> Result<libsql::Database> {
    libsql::Builder::new_local(":memory:")
        .build()
        .await
        .map_err(|e| Error::Database(format!("failed to open in-memory database: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_a_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instance.db");
        let db = open_database(&path, 1, 1).await.unwrap();
        let conn = db.connect().unwrap();
        conn.execute("CREATE TABLE t (x INTEGER)", ()).await.unwrap();
        conn.execute("INSERT INTO t (x) VALUES (7)", ())
            .await
            .unwrap();
        let mut rows = conn.query("SELECT x FROM t", ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 7);
    }

    #[tokio::test]
    async fn opens_an_in_memory_database() {
        let db = open_memory_database().await.unwrap();
        assert!(db.connect().is_ok());
    }
}
