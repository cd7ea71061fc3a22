//! Embedded SQLite database plumbing for the message backlog.
//!
//! Owns the connection pool, journal-mode pragmas, and the embedded
//! migration set. Everything that touches the backlog goes through the
//! [`DatabaseConnection`] handed out here.

use nutype::nutype;
use sqlx::{Pool, Sqlite, SqlitePool, migrate::Migrator};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Static migrator for the embedded `SQLite` migrations.
static MIGRATOR: Migrator = sqlx::migrate!();

/// Errors raised while opening or migrating the backlog database.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// The configured path is unusable.
    #[error("invalid database path: {reason}")]
    InvalidPath {
        /// Why the path was rejected.
        reason: String,
    },

    /// Creating the parent directory failed.
    #[error("failed to create directory {dir}: {source}")]
    Directory {
        /// Directory that could not be created.
        dir: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Opening the pool or applying pragmas failed.
    #[error("database connection failed: {0}")]
    Connection(#[from] sqlx::Error),

    /// An embedded migration failed to apply.
    #[error("schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Validated path to the backlog database file. Must end in `.db`.
#[nutype(
    validate(predicate = |path| {
        !path.as_os_str().is_empty() && path.extension().is_some_and(|ext| ext == "db")
    }),
    derive(Clone, Debug, Eq, PartialEq)
)]
pub struct DatabasePath(PathBuf);

impl DatabasePath {
    /// Validates and wraps a filesystem path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is empty or does not end in `.db`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        Self::try_new(path.as_ref().to_path_buf()).map_err(|_| DatabaseError::InvalidPath {
            reason: "path must be non-empty and end in .db".to_string(),
        })
    }

    /// The path as a `PathBuf`.
    #[must_use]
    pub fn as_path(&self) -> PathBuf {
        self.clone().into_inner()
    }

    /// Parent directory, if the path has one.
    #[must_use]
    pub fn parent_directory(&self) -> Option<PathBuf> {
        self.as_path().parent().map(Path::to_path_buf)
    }
}

impl std::fmt::Display for DatabasePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_path().display())
    }
}

/// A pooled connection to the backlog database.
///
/// Cheap to clone; clones share the underlying pool. `SQLite` serialises
/// writers itself, so concurrent store handles stay correct without any
/// locking on this side.
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: Pool<Sqlite>,
}

impl DatabaseConnection {
    /// Opens the backlog database, applying pragmas and migrations.
    ///
    /// WAL journaling keeps readers unblocked while a writer is active,
    /// which is what lets the poller enqueue while the processor claims.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the pool cannot
    /// be opened, or a migration fails.
    pub async fn open(path: DatabasePath) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent_directory() {
            tokio::fs::create_dir_all(&parent)
                .await
                .map_err(|source| DatabaseError::Directory {
                    dir: parent.display().to_string(),
                    source,
                })?;
        }

        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(path.as_path())
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .pragma("journal_mode", "WAL")
            .pragma("synchronous", "NORMAL")
            .pragma("temp_store", "MEMORY");

        let pool = SqlitePool::connect_with(options).await?;

        match MIGRATOR.run(&pool).await {
            Ok(()) => info!(db = %path, "backlog database ready"),
            Err(e) => {
                warn!(db = %path, error = %e, "backlog migration failed");
                return Err(e.into());
            }
        }

        Ok(Self { pool })
    }

    /// Opens an in-memory database, for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be opened or a migration fails.
    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .in_memory(true)
            .shared_cache(true);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Access to the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn path_requires_db_extension() {
        assert!(DatabasePath::new("backlog.db").is_ok());
        assert!(DatabasePath::new("backlog.txt").is_err());
        assert!(DatabasePath::new("").is_err());
    }

    #[test]
    fn path_exposes_parent_directory() {
        let path = DatabasePath::new("/var/lib/corral/message_backlog.db").unwrap();
        assert_eq!(
            path.parent_directory().unwrap(),
            PathBuf::from("/var/lib/corral")
        );
    }

    #[tokio::test]
    async fn open_creates_file_and_runs_migrations() {
        let dir = tempdir().unwrap();
        let path = DatabasePath::new(dir.path().join("message_backlog.db")).unwrap();
        let conn = DatabaseConnection::open(path.clone()).await.unwrap();

        let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations")
            .fetch_one(conn.pool())
            .await
            .unwrap();
        assert!(applied >= 1, "expected at least one applied migration");
        assert!(path.as_path().exists());
    }

    #[tokio::test]
    async fn open_creates_missing_parent_directories() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a/b/message_backlog.db");
        let path = DatabasePath::new(&nested).unwrap();
        DatabaseConnection::open(path).await.unwrap();
        assert!(nested.exists());
    }
}
