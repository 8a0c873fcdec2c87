//! Periodic snapshot persistence.
//!
//! The store itself is purely in-memory. A [`SnapshotPersistence`] collaborator
//! receives full snapshots at a fixed cadence (at-least-once: a crash between
//! sweeps loses at most one interval of activity) and hands the latest one back
//! on startup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::store::ConversationStore;
use crate::types::{ChannelContext, Conversation, UserContext};

/// Serializable copy of the store's persistent maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub taken_at: DateTime<Utc>,
    pub conversations: HashMap<String, Conversation>,
    pub channels: HashMap<String, ChannelContext>,
    pub users: HashMap<String, UserContext>,
}

impl StoreSnapshot {
    pub const VERSION: u32 = 1;
}

/// Persistence collaborator for store snapshots.
#[async_trait]
pub trait SnapshotPersistence: Send + Sync {
    async fn save(&self, snapshot: &StoreSnapshot) -> Result<()>;
    /// The most recently saved snapshot, if any.
    async fn load(&self) -> Result<Option<StoreSnapshot>>;
}

/// Keeps the latest snapshot as JSON in a single-row SQLite table.
pub struct SqliteSnapshots {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSnapshots {
    /// Wrap an open connection, creating the table if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Task("snapshot connection poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl SnapshotPersistence for SqliteSnapshots {
    async fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let payload = serde_json::to_string(snapshot)?;
        let version = snapshot.version;
        let saved_at = snapshot.taken_at.to_rfc3339();
        self.with_conn(move |db| {
            db.execute(
                "INSERT INTO store_snapshots (id, version, payload, saved_at)
                 VALUES (1, ?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    version  = excluded.version,
                    payload  = excluded.payload,
                    saved_at = excluded.saved_at",
                rusqlite::params![version, payload, saved_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn load(&self) -> Result<Option<StoreSnapshot>> {
        let payload: Option<String> = self
            .with_conn(|db| {
                Ok(db
                    .query_row(
                        "SELECT payload FROM store_snapshots WHERE id = 1",
                        [],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;

        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

/// Restore the latest snapshot into `store`, if one exists.
pub async fn restore_latest<P>(store: &ConversationStore, persistence: &P) -> Result<bool>
where
    P: SnapshotPersistence + ?Sized,
{
    match persistence.load().await? {
        Some(snapshot) if snapshot.version == StoreSnapshot::VERSION => {
            store.restore(snapshot);
            Ok(true)
        }
        Some(snapshot) => {
            warn!(
                version = snapshot.version,
                expected = StoreSnapshot::VERSION,
                "ignoring snapshot with unknown version"
            );
            Ok(false)
        }
        None => Ok(false),
    }
}

/// Periodic cleanup + snapshot loop. Runs until `shutdown` broadcasts `true`,
/// then saves one final snapshot.
pub async fn run_maintenance<P>(
    store: Arc<ConversationStore>,
    persistence: Arc<P>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    P: SnapshotPersistence + ?Sized,
{
    info!(period_secs = period.as_secs(), "store maintenance started");
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = store.cleanup();
                debug!(removed = report.total_removed(), "maintenance sweep done");
                if let Err(e) = persistence.save(&store.snapshot()).await {
                    error!(error = %e, "snapshot save failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    match persistence.save(&store.snapshot()).await {
        Ok(()) => info!("store maintenance stopped, final snapshot saved"),
        Err(e) => error!(error = %e, "final snapshot save failed"),
    }
}
