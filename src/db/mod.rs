use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;
use tokio::sync::oneshot;

mod helpers;
mod repositories;
pub mod schema;

pub use schema::{SchemaOutcome, StaleReason, READINGS_SCHEMA, TABLE_NAME};

use crate::{
    sink_error, sink_info,
    utils::logging::SharedLog,
};

const IN_MEMORY: &str = ":memory:";

/// Where the store file and its rebuild backups live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub db_path: PathBuf,
    pub backup_dir: PathBuf,
}

impl StorePaths {
    /// `sensor_data.db` inside `dir`, backups next to it.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            db_path: dir.join("sensor_data.db"),
            backup_dir: dir.to_path_buf(),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            db_path: PathBuf::from(IN_MEMORY),
            backup_dir: PathBuf::new(),
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.db_path.as_os_str() == IN_MEMORY
    }
}

type StoreTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum StoreCommand {
    Execute(StoreTask),
    Shutdown,
}

struct StoreInner {
    sender: mpsc::Sender<StoreCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
    log: SharedLog,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(StoreCommand::Shutdown) {
                sink_error!(self.log, "Failed to send shutdown to store thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                sink_error!(self.log, "Failed to join store thread: {join_err:?}");
            }
        }
    }
}

/// Append-only handle on `sensor_readings`.
///
/// The SQLite connection lives on a dedicated thread; every call is shipped
/// there as a closure. Clones share the thread, and dropping the last clone
/// closes the connection.
#[derive(Clone)]
pub struct ReadingStore {
    inner: Arc<StoreInner>,
    paths: Arc<StorePaths>,
    opened_with: SchemaOutcome,
}

impl ReadingStore {
    /// Open (creating if needed) the store and make the table writable.
    pub fn open(paths: StorePaths, log: SharedLog) -> Result<Self> {
        if !paths.is_in_memory() {
            if let Some(parent) = paths.db_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create store directory {}", parent.display())
                    })?;
                }
            }
        }

        let (command_tx, command_rx) = mpsc::channel::<StoreCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let paths_for_thread = paths.clone();
        let log_for_thread = log.clone();

        let worker = thread::Builder::new()
            .name("sensor-store".into())
            .spawn(move || {
                let log = log_for_thread;
                let mut conn = match Connection::open(&paths_for_thread.db_path) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open SQLite store")));
                        return;
                    }
                };

                if !paths_for_thread.is_in_memory() {
                    if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                        sink_error!(log, "Failed to enable WAL mode: {err}");
                    }
                }

                let init_result = schema::ensure(&mut conn, &paths_for_thread, &*log)
                    .context("failed to prepare sensor_readings");
                if ready_tx.send(init_result).is_err() {
                    sink_error!(log, "Store initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        StoreCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        StoreCommand::Shutdown => break,
                    }
                }

                sink_info!(log, "Store thread shutting down");
            })
            .with_context(|| "failed to spawn store worker thread")?;

        let opened_with = ready_rx
            .recv()
            .context("store worker exited before signaling readiness")??;

        sink_info!(
            log,
            "Store ready at {} ({opened_with:?})",
            paths.db_path.display()
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
                log,
            }),
            paths: Arc::new(paths),
            opened_with,
        })
    }

    pub fn open_in_memory(log: SharedLog) -> Result<Self> {
        Self::open(StorePaths::in_memory(), log)
    }

    pub fn path(&self) -> &Path {
        self.paths.db_path.as_path()
    }

    /// What the schema check did when this store was opened.
    pub fn schema_outcome(&self) -> &SchemaOutcome {
        &self.opened_with
    }

    /// Run the schema check again on the live connection.
    pub async fn ensure_schema(&self) -> Result<SchemaOutcome> {
        let paths = StorePaths::clone(&self.paths);
        let log = self.inner.log.clone();
        self.execute(move |conn| schema::ensure(conn, &paths, &*log))
            .await
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        let log = self.inner.log.clone();

        let command = StoreCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                sink_error!(log, "Store caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to store thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("store thread terminated unexpectedly"))?
    }
}
