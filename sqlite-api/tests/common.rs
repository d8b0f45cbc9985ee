//! Common test utilities shared across integration tests.

use std::path::PathBuf;

use sqlite_api::Connection;
use tempfile::TempDir;

/// Installs a test tracing subscriber, ignoring repeat initialization.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A database file in a private temporary directory, removed on drop.
pub struct TempDb {
    dir: TempDir,
}

impl TempDb {
    /// Creates a fresh temporary directory for the database.
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create temp dir"),
        }
    }

    /// Returns the path of the database file.
    pub fn path(&self) -> PathBuf {
        self.dir.path().join("test.db")
    }

    /// Opens a connection to the database file.
    pub fn open(&self) -> Connection {
        Connection::open(self.path(), 0).expect("open database")
    }
}

impl Default for TempDb {
    fn default() -> Self {
        Self::new()
    }
}
