use super::traits::{MetricQuery, MetricRow, Storage, StorageError, TransactionalStore, UnitOfWork};
use async_trait::async_trait;
use chrono::DateTime;
use duckdb::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Check if a process with the given PID is still running
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        std::process::Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Pull the holder PID out of a DuckDB "Could not set lock" message: "... (PID 12345) ..."
fn lock_holder_pid(error_msg: &str) -> Option<u32> {
    let start = error_msg.find("(PID ")? + 5;
    let end = error_msg[start..].find(')')?;
    error_msg[start..start + end].parse().ok()
}

fn remove_stale_lock_files(db_path: &Path) -> std::io::Result<()> {
    for suffix in ["wal", "lock"] {
        let stale = PathBuf::from(format!("{}.{}", db_path.display(), suffix));
        if stale.exists() {
            std::fs::remove_file(&stale)?;
            tracing::info!(path = %stale.display(), "Removed stale database file");
        }
    }
    Ok(())
}

/// DuckDB-backed metric store.
///
/// The shared connection serves schema setup and reads. Every unit of work
/// runs on its own cloned connection so an open transaction never blocks
/// readers and is never shared between flushes.
pub struct DuckDbStorage {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::Database(format!(
                        "failed to create database directory '{}': {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = match Connection::open(path) {
            Ok(conn) => conn,
            Err(e) => {
                let error_msg = e.to_string();
                if !error_msg.contains("Could not set lock") {
                    return Err(e.into());
                }

                tracing::warn!("Database lock detected: {}", error_msg);
                match lock_holder_pid(&error_msg) {
                    Some(pid) if !is_process_running(pid) => {
                        tracing::warn!(pid, "Lock holder is gone, removing stale lock files");
                        if let Err(io_err) = remove_stale_lock_files(path) {
                            tracing::error!(error = %io_err, "Failed to remove lock files");
                            return Err(e.into());
                        }
                        Connection::open(path)?
                    }
                    Some(pid) => {
                        tracing::error!(pid, "Database is locked by a running process");
                        return Err(e.into());
                    }
                    None => return Err(e.into()),
                }
            }
        };

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory DuckDB storage instance (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

// A poisoned lock only means another thread panicked while holding the
// connection; the connection itself is still usable.
fn lock_conn(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    Committed,
    RolledBack,
    Aborted,
}

/// One DuckDB transaction on a dedicated connection.
pub struct DuckDbUnitOfWork {
    conn: Connection,
    state: TxState,
}

impl UnitOfWork for DuckDbUnitOfWork {
    fn exec(&mut self, statement: &str, params: &[&dyn duckdb::ToSql]) -> Result<usize, StorageError> {
        if self.state != TxState::Active {
            return Err(StorageError::Database(format!(
                "unit of work is no longer active ({:?})",
                self.state
            )));
        }
        let mut stmt = self.conn.prepare_cached(statement)?;
        Ok(stmt.execute(params)?)
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        if self.state != TxState::Active {
            return Err(StorageError::Commit(format!(
                "unit of work is no longer active ({:?})",
                self.state
            )));
        }
        match self.conn.execute_batch("COMMIT") {
            Ok(()) => {
                self.state = TxState::Committed;
                Ok(())
            }
            Err(e) => {
                self.state = TxState::Aborted;
                Err(StorageError::Commit(e.to_string()))
            }
        }
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        match self.state {
            TxState::Committed | TxState::RolledBack => Ok(()),
            TxState::Aborted => {
                // DuckDB may already have closed the transaction after a failed commit.
                let _ = self.conn.execute_batch("ROLLBACK");
                self.state = TxState::RolledBack;
                Ok(())
            }
            TxState::Active => {
                self.conn
                    .execute_batch("ROLLBACK")
                    .map_err(|e| StorageError::Rollback(e.to_string()))?;
                self.state = TxState::RolledBack;
                Ok(())
            }
        }
    }
}

impl TransactionalStore for DuckDbStorage {
    fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError> {
        let conn = lock_conn(&self.conn)
            .try_clone()
            .map_err(|e| StorageError::Begin(e.to_string()))?;
        conn.execute_batch("BEGIN TRANSACTION")
            .map_err(|e| StorageError::Begin(e.to_string()))?;

        Ok(Box::new(DuckDbUnitOfWork {
            conn,
            state: TxState::Active,
        }))
    }
}

fn row_to_metric(row: &duckdb::Row<'_>) -> duckdb::Result<MetricRow> {
    let micros: i64 = row.get(0)?;
    let time = DateTime::from_timestamp_micros(micros).ok_or_else(|| {
        duckdb::Error::FromSqlConversionFailure(
            0,
            duckdb::types::Type::BigInt,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "invalid timestamp",
            )),
        )
    })?;

    Ok(MetricRow {
        time,
        source_name: row.get(1)?,
        metric_name: row.get(2)?,
        value: row.get(3)?,
    })
}

#[async_trait]
impl Storage for DuckDbStorage {
    async fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = lock_conn(&conn);

            // Times are stored as UTC wall-clock microseconds.
            conn.execute(
                "CREATE TABLE IF NOT EXISTS metrics (
                    time TIMESTAMP NOT NULL,
                    source_name VARCHAR NOT NULL,
                    metric_name VARCHAR NOT NULL,
                    value BIGINT NOT NULL
                )",
                [],
            )?;

            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_metrics_time ON metrics(time)",
                [],
            )?;

            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_metrics_series ON metrics(source_name, metric_name)",
                [],
            )?;

            Ok::<(), StorageError>(())
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }

    async fn count_metrics(&self) -> Result<u64, StorageError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = lock_conn(&conn);
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM metrics", [], |row| row.get(0))?;
            Ok::<u64, StorageError>(count.max(0) as u64)
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }

    async fn query_metrics(&self, query: MetricQuery) -> Result<Vec<MetricRow>, StorageError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = lock_conn(&conn);
            let mut sql = String::from(
                "SELECT epoch_us(time), source_name, metric_name, value FROM metrics WHERE 1 = 1",
            );
            let mut params: Vec<Box<dyn duckdb::ToSql>> = Vec::new();
            if let Some(source_name) = query.source_name {
                sql.push_str(" AND source_name = ?");
                params.push(Box::new(source_name));
            }
            if let Some(metric_name) = query.metric_name {
                sql.push_str(" AND metric_name = ?");
                params.push(Box::new(metric_name));
            }
            sql.push_str(" ORDER BY time DESC LIMIT ?");
            params.push(Box::new(query.limit as i64));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                duckdb::params_from_iter(params.iter().map(|p| p.as_ref())),
                row_to_metric,
            )?;

            let mut metrics = Vec::new();
            for row in rows {
                metrics.push(row?);
            }
            Ok(metrics)
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }
}
