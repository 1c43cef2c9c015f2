//! Persistent channel shared by processes through one SQLite file
//!
//! `entries` holds the current value of every key. `changes` is an
//! append-only journal; each open channel polls it for rows written by other
//! windows and re-broadcasts them locally, which stands in for the browser's
//! cross-window storage notification.

use anyhow::{anyhow, Context as _, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::{ChannelEvent, ChannelSubscription, SharedChannel, WindowId, EVENT_CAPACITY};

/// How often the journal is checked for other windows' writes
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Journal rows kept when trimming. A window more than this many writes
/// behind misses the older rows but still reads the newest value of each key.
pub const JOURNAL_KEEP: usize = 512;

/// Poll ticks between journal trims
const TRIM_EVERY_TICKS: u64 = 20;

/// A row of the `entries` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEntry {
    pub key: String,
    pub value: String,
    pub origin: String,
    pub updated_at: DateTime<Utc>,
}

pub struct SqliteChannel {
    id: WindowId,
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
    events: broadcast::Sender<ChannelEvent>,
    poller: JoinHandle<()>,
}

impl SqliteChannel {
    /// Open (creating if needed) the channel file as a new window.
    ///
    /// Must be called from within a tokio runtime; the journal poller runs as
    /// a task on it until the channel is dropped.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, WindowId::new(), DEFAULT_POLL_INTERVAL)
    }

    pub fn open_with(path: impl AsRef<Path>, id: WindowId, poll_interval: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| anyhow!("SqliteChannel must be opened inside a tokio runtime"))?;

        let path = path.as_ref().to_path_buf();
        let conn = Self::connect(&path)?;
        let last_seen = latest_revision(&conn)?;
        let conn = Arc::new(Mutex::new(conn));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let poller = runtime.spawn(poll_journal(
            conn.clone(),
            events.clone(),
            id,
            last_seen,
            poll_interval,
        ));

        debug!(window = %id, path = %path.display(), "sqlite channel opened");

        Ok(Self {
            id,
            path,
            conn,
            events,
            poller,
        })
    }

    /// Create the database file and schema without attaching a window
    pub fn initialize(path: impl AsRef<Path>) -> Result<()> {
        Self::connect(path.as_ref()).map(|_| ())
    }

    fn connect(path: &Path) -> Result<Connection> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open channel database: {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                origin TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS changes (
                revision INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL,
                value TEXT,
                origin TEXT NOT NULL,
                changed_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every entry, ordered by key
    pub fn entries(&self) -> Result<Vec<ChannelEntry>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT key, value, origin, updated_at FROM entries ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            let updated_at: String = row.get(3)?;
            Ok(ChannelEntry {
                key: row.get(0)?,
                value: row.get(1)?,
                origin: row.get(2)?,
                updated_at: DateTime::parse_from_rfc3339(&updated_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_default(),
            })
        })?;

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Drop all but the newest `keep` journal rows; returns rows deleted
    pub fn prune_changes(&self, keep: usize) -> Result<usize> {
        trim_journal(&self.conn.lock(), keep)
    }

    /// Number of rows currently in the journal
    pub fn journal_len(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM changes", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl Drop for SqliteChannel {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

impl SharedChannel for SqliteChannel {
    fn window_id(&self) -> WindowId {
        self.id
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM entries WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<String> = tx
            .query_row(
                "SELECT value FROM entries WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        if current.as_deref() == Some(value) {
            return Ok(());
        }

        let now = Utc::now().to_rfc3339();
        let origin = self.id.to_string();
        tx.execute(
            "INSERT INTO entries (key, value, origin, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                origin = excluded.origin,
                updated_at = excluded.updated_at",
            params![key, value, origin, now],
        )?;
        tx.execute(
            "INSERT INTO changes (key, value, origin, changed_at) VALUES (?1, ?2, ?3, ?4)",
            params![key, value, origin, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let removed = tx.execute("DELETE FROM entries WHERE key = ?1", params![key])?;
        if removed > 0 {
            tx.execute(
                "INSERT INTO changes (key, value, origin, changed_at) VALUES (?1, NULL, ?2, ?3)",
                params![key, self.id.to_string(), Utc::now().to_rfc3339()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn subscribe(&self) -> ChannelSubscription {
        ChannelSubscription::new(self.id, self.events.subscribe())
    }
}

fn latest_revision(conn: &Connection) -> Result<i64> {
    let revision = conn.query_row("SELECT COALESCE(MAX(revision), 0) FROM changes", [], |row| {
        row.get(0)
    })?;
    Ok(revision)
}

fn trim_journal(conn: &Connection, keep: usize) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM changes WHERE revision <= (SELECT COALESCE(MAX(revision), 0) FROM changes) - ?1",
        params![keep as i64],
    )?;
    Ok(deleted)
}

fn read_changes(conn: &Mutex<Connection>, since: i64) -> Result<Vec<(i64, String, Option<String>, String)>> {
    let conn = conn.lock();
    let mut stmt = conn.prepare(
        "SELECT revision, key, value, origin FROM changes WHERE revision > ?1 ORDER BY revision",
    )?;
    let rows = stmt.query_map(params![since], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

async fn poll_journal(
    conn: Arc<Mutex<Connection>>,
    events: broadcast::Sender<ChannelEvent>,
    id: WindowId,
    mut last_seen: i64,
    poll_interval: Duration,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks: u64 = 0;

    loop {
        ticker.tick().await;
        ticks += 1;
        let trim = ticks % TRIM_EVERY_TICKS == 0;

        let conn = conn.clone();
        let since = last_seen;
        let read = move || {
            let rows = read_changes(&conn, since)?;
            if trim {
                let deleted = trim_journal(&conn.lock(), JOURNAL_KEEP)?;
                if deleted > 0 {
                    debug!(deleted, "trimmed channel journal");
                }
            }
            Ok::<_, anyhow::Error>(rows)
        };
        let rows = match tokio::task::spawn_blocking(read).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(err)) => {
                warn!(window = %id, error = %err, "failed to read channel journal");
                continue;
            }
            Err(err) => {
                warn!(window = %id, error = %err, "channel journal task failed");
                break;
            }
        };

        for (revision, key, new_value, origin) in rows {
            last_seen = revision;
            let origin = match origin.parse::<WindowId>() {
                Ok(origin) => origin,
                Err(_) => {
                    warn!(revision, origin = %origin, "skipping journal row with bad origin");
                    continue;
                }
            };
            if origin == id {
                continue;
            }
            let _ = events.send(ChannelEvent {
                key,
                new_value,
                origin,
            });
        }
    }
}
