use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use scim_config::Store;
use scim_kernel::ServiceFlow;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, warn};

use crate::stores::{ChainSnapshot, ContextSnapshot};

const CHAINS: &str = "chains";
const CONTEXTS: &str = "contexts";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("snapshot io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("sqlite snapshot failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("snapshot store lock poisoned")]
    Poisoned,
}

/// Named JSON documents that survive a restart. Backends only move bytes;
/// encoding lives in the provided methods.
pub trait SnapshotStore: Send + Sync {
    fn read(&self, name: &str) -> Result<Option<String>, PersistError>;
    fn write(&self, name: &str, body: &str) -> Result<(), PersistError>;

    /// Loads persisted chains. A flow that no longer decodes is skipped;
    /// the rest of its principal's list is kept in order.
    fn load_chains(&self) -> Result<ChainSnapshot, PersistError> {
        let Some(body) = self.read(CHAINS)? else {
            return Ok(ChainSnapshot::new());
        };
        let raw: BTreeMap<String, Vec<Value>> = serde_json::from_str(&body)?;
        let mut chains = ChainSnapshot::new();
        for (principal, flows) in raw {
            let mut decoded = Vec::with_capacity(flows.len());
            for flow in flows {
                match serde_json::from_value::<ServiceFlow>(flow) {
                    Ok(flow) => decoded.push(flow),
                    Err(e) => warn!(%principal, error = %e, "skipping unreadable persisted flow"),
                }
            }
            if !decoded.is_empty() {
                chains.insert(principal, decoded);
            }
        }
        Ok(chains)
    }

    fn load_contexts(&self) -> Result<ContextSnapshot, PersistError> {
        match self.read(CONTEXTS)? {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Ok(ContextSnapshot::new()),
        }
    }

    fn save_chains(&self, chains: &ChainSnapshot) -> Result<(), PersistError> {
        self.write(CHAINS, &serde_json::to_string(chains)?)
    }

    fn save_contexts(&self, contexts: &ContextSnapshot) -> Result<(), PersistError> {
        self.write(CONTEXTS, &serde_json::to_string(contexts)?)
    }
}

#[derive(Debug, Default)]
pub struct MemorySnapshots {
    docs: Mutex<HashMap<String, String>>,
}

impl SnapshotStore for MemorySnapshots {
    fn read(&self, name: &str) -> Result<Option<String>, PersistError> {
        let docs = self.docs.lock().map_err(|_| PersistError::Poisoned)?;
        Ok(docs.get(name).cloned())
    }

    fn write(&self, name: &str, body: &str) -> Result<(), PersistError> {
        let mut docs = self.docs.lock().map_err(|_| PersistError::Poisoned)?;
        docs.insert(name.to_string(), body.to_string());
        Ok(())
    }
}

/// One `<name>.json` file per document, replaced via rename.
#[derive(Debug)]
pub struct FileSnapshots {
    dir: PathBuf,
}

impl FileSnapshots {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }
}

impl SnapshotStore for FileSnapshots {
    fn read(&self, name: &str) -> Result<Option<String>, PersistError> {
        match std::fs::read_to_string(self.dir.join(format!("{name}.json"))) {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, name: &str, body: &str) -> Result<(), PersistError> {
        let target = self.dir.join(format!("{name}.json"));
        let staging = self
            .dir
            .join(format!("{name}.json.{}.tmp", uuid::Uuid::new_v4().as_simple()));
        std::fs::write(&staging, body)?;
        std::fs::rename(&staging, &target)?;
        Ok(())
    }
}

pub struct SqliteSnapshots {
    conn: Mutex<Connection>,
}

impl SqliteSnapshots {
    pub fn new(path: &str) -> Result<Self, PersistError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS snapshots (
                name TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl SnapshotStore for SqliteSnapshots {
    fn read(&self, name: &str) -> Result<Option<String>, PersistError> {
        let conn = self.conn.lock().map_err(|_| PersistError::Poisoned)?;
        let body = conn
            .query_row(
                "SELECT body FROM snapshots WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(body)
    }

    fn write(&self, name: &str, body: &str) -> Result<(), PersistError> {
        let conn = self.conn.lock().map_err(|_| PersistError::Poisoned)?;
        conn.execute(
            "INSERT OR REPLACE INTO snapshots(name, body, updated_at) VALUES (?1, ?2, ?3)",
            params![name, body, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

/// Opens the configured backend. A backend that cannot be opened degrades to
/// in-memory snapshots so routing keeps working.
pub fn open_snapshot_store(cfg: &Store) -> Arc<dyn SnapshotStore> {
    let opened: Result<Arc<dyn SnapshotStore>, PersistError> = match cfg.kind.as_str() {
        "file" => match cfg.snapshot_dir.as_deref() {
            Some(dir) => FileSnapshots::new(dir).map(|s| Arc::new(s) as Arc<dyn SnapshotStore>),
            None => Ok(Arc::new(MemorySnapshots::default())),
        },
        "sqlite" => match cfg.sqlite_path.as_deref() {
            Some(path) => {
                SqliteSnapshots::new(path).map(|s| Arc::new(s) as Arc<dyn SnapshotStore>)
            }
            None => Ok(Arc::new(MemorySnapshots::default())),
        },
        _ => Ok(Arc::new(MemorySnapshots::default())),
    };
    opened.unwrap_or_else(|e| {
        error!(store = %cfg.kind, error = %e, "snapshot store unavailable, using memory");
        Arc::new(MemorySnapshots::default())
    })
}
