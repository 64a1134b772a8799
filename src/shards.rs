//! Shard manager: one catalog, many per-owner databases
//!
//! Opens, caches, and closes the shared catalog (`shared.db`) and the
//! per-owner shard files (`user_db_{id}.db` / `role_db_{id}.db`). Schema
//! is installed on first open and default mailboxes are seeded into fresh
//! shards. Handles are cached behind a reader-writer lock with a
//! double-checked open-on-miss discipline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use rusqlite::Connection;
use tracing::debug;

use crate::clock::SharedClock;
use crate::errors::{StoreError, StoreResult};
use crate::mailbox;
use crate::models::Owner;
use crate::schema;

/// Shared handle to one database file
///
/// The connection is serialized through a mutex; callers borrow it for
/// the duration of a call and the underlying engine serializes writers
/// per file. Clones refer to the same connection.
#[derive(Clone)]
pub struct ShardHandle {
    conn: Arc<Mutex<Connection>>,
}

impl ShardHandle {
    fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Borrow the connection
    ///
    /// # Errors
    ///
    /// Returns `Internal` if a previous holder panicked while holding the
    /// lock.
    pub fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::internal("database handle poisoned by a panicked caller"))
    }
}

/// Manager for the catalog and the per-owner shards
///
/// Construction is fatal if the base directory or the catalog cannot be
/// initialized; a per-owner shard that fails to open surfaces to the
/// caller and leaves the manager usable.
pub struct ShardManager {
    base_dir: PathBuf,
    catalog: ShardHandle,
    clock: SharedClock,
    shards: RwLock<HashMap<Owner, ShardHandle>>,
    closed: AtomicBool,
}

impl ShardManager {
    /// Open (or create) the store under `base_dir`
    ///
    /// Idempotently creates the directory, opens the catalog, installs
    /// the catalog schema, and enables referential-integrity checks.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the directory or catalog file
    /// cannot be created, `Internal` if the schema is unrecognized.
    pub fn open(base_dir: impl Into<PathBuf>, clock: SharedClock) -> StoreResult<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir).map_err(|e| {
            StoreError::BackendUnavailable(format!(
                "cannot create base directory {}: {e}",
                base_dir.display()
            ))
        })?;

        let catalog_path = base_dir.join("shared.db");
        let conn = open_database(&catalog_path)?;
        schema::install_catalog(&conn)?;
        debug!(path = %catalog_path.display(), "catalog opened");

        Ok(Self {
            base_dir,
            catalog: ShardHandle::new(conn),
            clock,
            shards: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Borrow the catalog handle
    pub fn catalog(&self) -> StoreResult<ShardHandle> {
        self.check_open()?;
        Ok(self.catalog.clone())
    }

    /// Borrow a user's shard handle, opening the file on first use
    pub fn user_shard(&self, user_id: i64) -> StoreResult<ShardHandle> {
        self.shard(Owner::User(user_id))
    }

    /// Borrow a role mailbox's shard handle, opening the file on first use
    pub fn role_shard(&self, role_id: i64) -> StoreResult<ShardHandle> {
        self.shard(Owner::Role(role_id))
    }

    /// Borrow the shard handle for an owner
    ///
    /// Lookups take the shared lock; a miss upgrades to exclusive,
    /// re-checks, then opens and inserts.
    pub fn shard(&self, owner: Owner) -> StoreResult<ShardHandle> {
        self.check_open()?;

        {
            let cache = self
                .shards
                .read()
                .map_err(|_| StoreError::internal("shard cache poisoned"))?;
            if let Some(handle) = cache.get(&owner) {
                return Ok(handle.clone());
            }
        }

        let mut cache = self
            .shards
            .write()
            .map_err(|_| StoreError::internal("shard cache poisoned"))?;
        if let Some(handle) = cache.get(&owner) {
            return Ok(handle.clone());
        }

        let handle = self.open_shard_file(owner)?;
        cache.insert(owner, handle.clone());
        Ok(handle)
    }

    /// Path of the shard file for an owner
    pub fn shard_path(&self, owner: Owner) -> PathBuf {
        let file = match owner {
            Owner::User(id) => format!("user_db_{id}.db"),
            Owner::Role(id) => format!("role_db_{id}.db"),
        };
        self.base_dir.join(file)
    }

    /// Close every cached handle
    ///
    /// Idempotent; after close the manager rejects all further calls.
    pub fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut cache = self
            .shards
            .write()
            .map_err(|_| StoreError::internal("shard cache poisoned"))?;
        let drained = cache.len();
        cache.clear();
        debug!(shards = drained, "shard manager closed");
        Ok(())
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::internal("shard manager is closed"));
        }
        Ok(())
    }

    /// Open one shard file, install its schema, seed default mailboxes
    fn open_shard_file(&self, owner: Owner) -> StoreResult<ShardHandle> {
        let path = self.shard_path(owner);
        let conn = open_database(&path)?;
        schema::install_shard(&conn)?;
        mailbox::seed_default_mailboxes(&conn, owner.owner_id(), self.clock.as_ref())?;
        debug!(path = %path.display(), "shard opened");
        Ok(ShardHandle::new(conn))
    }
}

/// Open one database file with per-connection settings applied
fn open_database(path: &Path) -> StoreResult<Connection> {
    let conn = Connection::open(path).map_err(|e| {
        StoreError::BackendUnavailable(format!("cannot open database {}: {e}", path.display()))
    })?;
    schema::configure_connection(&conn)?;
    Ok(conn)
}
