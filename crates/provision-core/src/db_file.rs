//! redb file shared between processes.
//!
//! redb takes an exclusive lock on its file for as long as a `Database` is
//! open. `DbFile` opens the file for one transaction at a time and closes it
//! again, so a running worker pool and operator commands against the same
//! root take turns instead of locking each other out. Callers in the same
//! process queue on a mutex; a lock held by another process is waited out
//! with a capped backoff until `lock_wait` runs out.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use redb::{Database, DatabaseError, ReadTransaction, WriteTransaction};
use tracing::trace;

use crate::error::{storage, ProvisionError, Result};

/// How long a transaction waits for another process to release the file.
const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);

const MAX_BACKOFF: Duration = Duration::from_millis(50);

pub(crate) struct DbFile {
    path: PathBuf,
    gate: Mutex<()>,
    lock_wait: Duration,
}

impl DbFile {
    /// Create the file if needed and run `init` (table creation) once.
    pub(crate) fn open(
        path: &Path,
        init: impl FnOnce(&WriteTransaction) -> Result<()>,
    ) -> Result<Self> {
        crate::io::prepare_parent(path)?;
        let file = Self {
            path: path.to_path_buf(),
            gate: Mutex::new(()),
            lock_wait: DEFAULT_LOCK_WAIT,
        };
        file.write(init)?;
        Ok(file)
    }

    /// Run `f` inside a write transaction, committing only if it succeeds.
    pub(crate) fn write<R>(&self, f: impl FnOnce(&WriteTransaction) -> Result<R>) -> Result<R> {
        self.with_database(|db| {
            let wt = db.begin_write().map_err(storage)?;
            let out = f(&wt)?;
            wt.commit().map_err(storage)?;
            Ok(out)
        })
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&ReadTransaction) -> Result<R>) -> Result<R> {
        self.with_database(|db| {
            let rt = db.begin_read().map_err(storage)?;
            f(&rt)
        })
    }

    fn with_database<R>(&self, f: impl FnOnce(&Database) -> Result<R>) -> Result<R> {
        let _turn = self
            .gate
            .lock()
            .map_err(|_| ProvisionError::Storage(format!("{}: gate poisoned", self.path.display())))?;
        let db = self.acquire()?;
        f(&db)
    }

    fn acquire(&self) -> Result<Database> {
        let deadline = Instant::now() + self.lock_wait;
        let mut backoff = Duration::from_millis(1);
        loop {
            match Database::create(&self.path) {
                Ok(db) => return Ok(db),
                Err(DatabaseError::DatabaseAlreadyOpen) => {
                    if Instant::now() >= deadline {
                        return Err(ProvisionError::Storage(format!(
                            "{} is held by another process (waited {}ms)",
                            self.path.display(),
                            self.lock_wait.as_millis()
                        )));
                    }
                    trace!(path = %self.path.display(), backoff_ms = backoff.as_millis() as u64, "database busy");
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(storage(e)),
            }
        }
    }
}
