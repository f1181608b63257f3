//! A SQLite-backed policy store.
//!
//! Groups, policies and lock leases live in a single database shared by every
//! policy-server replica. Mutations run in `BEGIN IMMEDIATE` transactions so
//! that writers are serialized by the database rather than by the process.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod lock;
pub mod metrics;
mod policies;
mod tags;


use netpol_policy_server_core::{
    Error, Filter, Group, GroupKind, Policy, PolicyStore, Result, TagWidth, TaggedPolicy,
};
use parking_lot::Mutex;
use rusqlite::{Connection, TransactionBehavior};
use std::{path::Path, sync::Arc, time::Duration};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS groups (
    tag INTEGER PRIMARY KEY CHECK (tag > 0),
    group_key TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL DEFAULT 'app'
);

CREATE TABLE IF NOT EXISTS policies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_tag INTEGER NOT NULL REFERENCES groups (tag),
    destination_tag INTEGER NOT NULL REFERENCES groups (tag),
    protocol TEXT NOT NULL,
    port_start INTEGER NOT NULL,
    port_end INTEGER NOT NULL,
    CHECK (port_start <= port_end),
    UNIQUE (source_tag, destination_tag, protocol, port_start, port_end)
);

CREATE INDEX IF NOT EXISTS policies_destination ON policies (destination_tag);

CREATE TABLE IF NOT EXISTS locks (
    lock_key TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    expires_at_ms INTEGER NOT NULL
);
";

#[derive(Clone, Debug)]
pub struct Store {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    conn: Mutex<Connection>,
    width: TagWidth,
}

/// Row counts reported by the store's metrics.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub policies: u64,
    pub groups: u64,
}

// === impl Store ===

impl Store {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>, width: TagWidth, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path).map_err(Error::database)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(Error::database)?;
        conn.busy_timeout(busy_timeout).map_err(Error::database)?;
        Self::init(conn, width)
    }

    /// Opens a private, non-durable database.
    pub fn in_memory(width: TagWidth) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(Error::database)?;
        Self::init(conn, width)
    }

    fn init(conn: Connection, width: TagWidth) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(Error::database)?;
        conn.execute_batch(SCHEMA).map_err(Error::database)?;
        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                width,
            }),
        })
    }

    pub fn tag_width(&self) -> TagWidth {
        self.inner.width
    }

    pub fn stats(&self) -> Result<Stats> {
        let conn = self.inner.conn.lock();
        let count = |table: &str| -> Result<u64> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n.max(0) as u64)
            .map_err(Error::database)
        };
        Ok(Stats {
            policies: count("policies")?,
            groups: count("groups")?,
        })
    }

    /// Runs `f` inside an immediate transaction on the blocking pool,
    /// committing only if it succeeds.
    async fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>, TagWidth) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = inner.conn.lock();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(Error::database)?;
            let out = f(&tx, inner.width)?;
            tx.commit().map_err(Error::database)?;
            Ok(out)
        })
        .await
        .map_err(Error::database)?
    }

    async fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner.conn.lock()))
            .await
            .map_err(Error::database)?
    }
}

#[async_trait::async_trait]
impl PolicyStore for Store {
    async fn list(&self, filter: Filter) -> Result<Vec<TaggedPolicy>> {
        self.read(move |conn| policies::select(conn, &filter)).await
    }

    async fn create(&self, policies: Vec<Policy>, max_per_source: Option<usize>) -> Result<()> {
        let created = policies.len();
        self.write(move |tx, width| policies::insert(tx, width, policies, max_per_source))
            .await?;
        tracing::debug!(policies = created, "Created policies");
        Ok(())
    }

    async fn delete(&self, policies: Vec<Policy>) -> Result<Vec<Policy>> {
        let deleted = self
            .write(move |tx, _| policies::delete(tx, policies))
            .await?;
        tracing::debug!(policies = deleted.len(), "Deleted policies");
        Ok(deleted)
    }

    async fn snapshot(&self, filter: Filter) -> Result<Vec<TaggedPolicy>> {
        self.read(move |conn| policies::select(conn, &filter)).await
    }

    async fn groups(&self) -> Result<Vec<Group>> {
        self.read(tags::all).await
    }

    async fn ensure_tag(&self, key: String, kind: GroupKind) -> Result<Group> {
        self.write(move |tx, width| tags::ensure_kind(tx, width, &key, kind))
            .await
    }

    async fn release_tags(&self, keys: Vec<String>) -> Result<Vec<Group>> {
        let released = self
            .write(move |tx, _| tags::release_unreferenced(tx, &keys))
            .await?;
        for group in &released {
            tracing::info!(key = %group.key, tag = %group.tag, "Released tag");
        }
        Ok(released)
    }
}
