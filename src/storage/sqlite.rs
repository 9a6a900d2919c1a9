//! SQLite-backed MVCC key-value log.
//!
//! Every write appends a row to `kv_log`; the row id is the revision. A key's
//! value at revision `R` is the newest row for that key with `revision <= R`,
//! and a tombstone row (`deleted = 1`) hides the key. Watch events are read
//! straight from the log, and compaction removes rows that no reader at or
//! above the compaction floor can observe.
//!
//! # Schema
//!
//! - `kv_log`: (revision, key, created, deleted, create_revision,
//!   prev_revision, version, lease, value, old_value)
//! - `kv_meta`: (name, value) holding the compaction floor
//! - `leases`: (id, granted_ttl, expires_at_ms)
//!
//! Writers are serialized by an in-process lock and run inside
//! `BEGIN IMMEDIATE` transactions. Reads use deferred transactions so a range
//! and its count observe the same snapshot.

use parking_lot::Mutex;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::config::EmbeddedConfig;
use crate::core::error::{StorageError, StorageResult};
use crate::core::time::deadline_after;

/// r2d2 needs a finite pool size; this stands in for "unlimited".
pub const UNLIMITED_OPEN_CONNECTIONS: u32 = 1024;

const LOCK_RETRY_ATTEMPTS: u32 = 50;
const LOCK_RETRY_BACKOFF: Duration = Duration::from_millis(2);
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv_log (
    revision INTEGER PRIMARY KEY AUTOINCREMENT,
    key BLOB NOT NULL,
    created INTEGER NOT NULL,
    deleted INTEGER NOT NULL,
    create_revision INTEGER NOT NULL,
    prev_revision INTEGER NOT NULL,
    version INTEGER NOT NULL,
    lease INTEGER NOT NULL,
    value BLOB NOT NULL,
    old_value BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS kv_log_key_revision ON kv_log (key, revision);
CREATE INDEX IF NOT EXISTS kv_log_lease ON kv_log (lease) WHERE lease != 0;
CREATE TABLE IF NOT EXISTS kv_meta (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS leases (
    id INTEGER PRIMARY KEY,
    granted_ttl INTEGER NOT NULL,
    expires_at_ms INTEGER NOT NULL
);
";

const COLUMNS: &str =
    "revision, key, created, deleted, create_revision, prev_revision, version, lease, value, old_value";

const LATEST_IN_RANGE: &str = "
SELECT l.revision, l.key, l.created, l.deleted, l.create_revision, l.prev_revision,
       l.version, l.lease, l.value, l.old_value
FROM kv_log l
JOIN (
    SELECT key AS k, MAX(revision) AS r FROM kv_log
    WHERE key >= ?1 AND (?2 IS NULL OR key < ?2) AND revision <= ?3
    GROUP BY key
) m ON l.revision = m.r
WHERE l.deleted = 0
ORDER BY l.key ASC
LIMIT ?4";

const COUNT_IN_RANGE: &str = "
SELECT COUNT(*)
FROM kv_log l
JOIN (
    SELECT key AS k, MAX(revision) AS r FROM kv_log
    WHERE key >= ?1 AND (?2 IS NULL OR key < ?2) AND revision <= ?3
    GROUP BY key
) m ON l.revision = m.r
WHERE l.deleted = 0";

const LEASE_KEYS: &str = "
SELECT l.key
FROM kv_log l
JOIN (SELECT key AS k, MAX(revision) AS r FROM kv_log GROUP BY key) m ON l.revision = m.r
WHERE l.deleted = 0 AND l.lease = ?1
ORDER BY l.key ASC";

const COMPACT: &str = "
DELETE FROM kv_log
WHERE revision <= ?1
  AND (deleted = 1 OR EXISTS (
      SELECT 1 FROM kv_log n
      WHERE n.key = kv_log.key AND n.revision > kv_log.revision AND n.revision <= ?1
  ))";

/// A live key-value pair.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KvRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub version: i64,
    pub lease: i64,
}

/// Kind of change recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// A change derived from one log row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub kind: EventKind,
    /// New state; for deletes only `key` and `mod_revision` are set.
    pub kv: KvRecord,
    /// State before the change, when the key existed.
    pub prev_kv: Option<KvRecord>,
}

impl LogEvent {
    /// Revision at which the change happened.
    pub fn revision(&self) -> i64 {
        self.kv.mod_revision
    }
}

/// A persisted lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub id: i64,
    /// TTL in seconds requested at grant time.
    pub granted_ttl: i64,
    /// Unix timestamp (ms) after which the lease is expired.
    pub expires_at_ms: i64,
}

impl LeaseRecord {
    /// Seconds left before expiry, rounded up; `-1` once expired.
    pub fn remaining_secs(&self, now_ms: i64) -> i64 {
        let remaining = self.expires_at_ms - now_ms;
        if remaining <= 0 {
            -1
        } else {
            (remaining + 999) / 1000
        }
    }
}

/// Key selection in etcd form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRange {
    /// Exactly one key (`range_end` empty).
    Single(Vec<u8>),
    /// Every key `>= start` (`range_end == "\0"`).
    From(Vec<u8>),
    /// Keys in `[start, end)`.
    Between(Vec<u8>, Vec<u8>),
}

impl KeyRange {
    /// Interpret an etcd `key`/`range_end` pair.
    pub fn new(key: &[u8], range_end: &[u8]) -> Self {
        if range_end.is_empty() {
            Self::Single(key.to_vec())
        } else if range_end == [0] {
            Self::From(key.to_vec())
        } else {
            Self::Between(key.to_vec(), range_end.to_vec())
        }
    }

    /// Range covering every key that starts with `prefix`.
    pub fn prefix(prefix: &[u8]) -> Self {
        let mut end = prefix.to_vec();
        while let Some(last) = end.pop() {
            if last < 0xff {
                end.push(last + 1);
                return Self::Between(prefix.to_vec(), end);
            }
        }
        Self::From(prefix.to_vec())
    }

    /// Check whether `key` falls inside the range.
    pub fn contains(&self, key: &[u8]) -> bool {
        match self {
            Self::Single(k) => k.as_slice() == key,
            Self::From(start) => key >= start.as_slice(),
            Self::Between(start, end) => key >= start.as_slice() && key < end.as_slice(),
        }
    }

    fn bounds(&self) -> (&[u8], Option<&[u8]>) {
        match self {
            Self::Single(k) => (k.as_slice(), None),
            Self::From(start) => (start.as_slice(), None),
            Self::Between(start, end) => (start.as_slice(), Some(end.as_slice())),
        }
    }
}

/// Result of a range read.
#[derive(Debug, Clone, Default)]
pub struct RangeResult {
    /// Matching live records ordered by key.
    pub records: Vec<KvRecord>,
    /// Total number of matching keys, ignoring the limit.
    pub count: i64,
    /// Whether the limit cut the result short.
    pub more: bool,
    /// Store revision when the read happened.
    pub revision: i64,
}

#[derive(Debug, Clone)]
struct LogRow {
    revision: i64,
    key: Vec<u8>,
    created: bool,
    deleted: bool,
    create_revision: i64,
    prev_revision: i64,
    version: i64,
    lease: i64,
    value: Vec<u8>,
    old_value: Vec<u8>,
}

impl LogRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            revision: row.get(0)?,
            key: row.get(1)?,
            created: row.get::<_, i64>(2)? != 0,
            deleted: row.get::<_, i64>(3)? != 0,
            create_revision: row.get(4)?,
            prev_revision: row.get(5)?,
            version: row.get(6)?,
            lease: row.get(7)?,
            value: row.get(8)?,
            old_value: row.get(9)?,
        })
    }

    fn record(&self) -> KvRecord {
        KvRecord {
            key: self.key.clone(),
            value: self.value.clone(),
            create_revision: self.create_revision,
            mod_revision: self.revision,
            version: self.version,
            lease: self.lease,
        }
    }

    fn into_event(self) -> LogEvent {
        if self.deleted {
            // Tombstones carry the state of the deleted key.
            let prev = KvRecord {
                key: self.key.clone(),
                value: self.old_value,
                create_revision: self.create_revision,
                mod_revision: self.prev_revision,
                version: self.version,
                lease: self.lease,
            };
            LogEvent {
                kind: EventKind::Delete,
                kv: KvRecord {
                    key: self.key,
                    mod_revision: self.revision,
                    ..KvRecord::default()
                },
                prev_kv: Some(prev),
            }
        } else {
            let prev_kv = (!self.created).then(|| KvRecord {
                key: self.key.clone(),
                value: self.old_value.clone(),
                create_revision: self.create_revision,
                mod_revision: self.prev_revision,
                version: self.version - 1,
                lease: 0,
            });
            LogEvent {
                kind: EventKind::Put,
                kv: self.record(),
                prev_kv,
            }
        }
    }
}

/// SQLite-backed MVCC store.
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    write_lock: Mutex<()>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn init_connection(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

impl SqliteStore {
    /// Open (or create) the database at `path` with the given pool tuning.
    pub fn open(path: &Path, config: &EmbeddedConfig) -> StorageResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if config.shared_cache {
            flags |= OpenFlags::SQLITE_OPEN_SHARED_CACHE;
        }

        let manager = SqliteConnectionManager::file(path)
            .with_flags(flags)
            .with_init(init_connection);

        let max_size = match config.max_open_connections {
            0 => UNLIMITED_OPEN_CONNECTIONS,
            n => n,
        };
        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(config.max_idle_connections.min(max_size)))
            .max_lifetime(config.connection_max_lifetime())
            .idle_timeout(None)
            .build(manager)?;

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
            path: path.to_path_buf(),
        };
        store.migrate()?;

        tracing::debug!(
            path = %store.path.display(),
            max_open = max_size,
            max_idle = config.max_idle_connections,
            shared_cache = config.shared_cache,
            "sqlite store opened"
        );
        Ok(store)
    }

    fn migrate(&self) -> StorageResult<()> {
        let conn = self.pool.get()?;
        with_retry(|| conn.execute_batch(SCHEMA).map_err(StorageError::from))
    }

    /// Database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a read-only closure inside a deferred transaction.
    fn read<T>(&self, mut f: impl FnMut(&Connection) -> StorageResult<T>) -> StorageResult<T> {
        let mut conn = self.pool.get()?;
        with_retry(|| {
            let tx = conn.transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    /// Run a mutating closure inside an immediate transaction.
    ///
    /// The closure may run more than once when SQLite reports lock
    /// contention, so it must not have side effects outside the transaction.
    pub fn write<T>(
        &self,
        mut f: impl FnMut(&WriteBatch<'_>) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let _guard = self.write_lock.lock();
        let mut conn = self.pool.get()?;
        with_retry(|| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&WriteBatch { conn: &tx })?;
            tx.commit()?;
            Ok(out)
        })
    }

    /// Latest revision written to the log.
    pub fn current_revision(&self) -> StorageResult<i64> {
        self.read(|conn| current_revision(conn))
    }

    /// Compaction floor; reads below it fail.
    pub fn compact_revision(&self) -> StorageResult<i64> {
        self.read(|conn| compact_revision(conn))
    }

    /// Read the live value of `key` at `revision` (0 = current).
    pub fn get(&self, key: &[u8], revision: i64) -> StorageResult<Option<KvRecord>> {
        self.read(|conn| {
            let current = current_revision(conn)?;
            let at = resolve_read_revision(conn, revision, current)?;
            live(conn, key, at)
        })
    }

    /// Read the live keys in `range` at `revision` (0 = current).
    pub fn range(
        &self,
        range: &KeyRange,
        revision: i64,
        limit: Option<usize>,
    ) -> StorageResult<RangeResult> {
        self.read(|conn| {
            let current = current_revision(conn)?;
            let at = resolve_read_revision(conn, revision, current)?;
            read_range(conn, range, at, limit, current)
        })
    }

    /// Log entries with a revision above `revision`, oldest first.
    pub fn after(&self, revision: i64, limit: usize) -> StorageResult<Vec<LogEvent>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {COLUMNS} FROM kv_log WHERE revision > ?1 ORDER BY revision ASC LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![revision, limit_param(Some(limit))], LogRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows.into_iter().map(LogRow::into_event).collect())
        })
    }

    /// Drop history at or below `revision` and raise the compaction floor.
    ///
    /// Returns the number of log rows removed.
    pub fn compact(&self, revision: i64) -> StorageResult<usize> {
        self.write(|batch| batch.compact(revision))
    }

    /// Lease by id.
    pub fn lease(&self, id: i64) -> StorageResult<Option<LeaseRecord>> {
        self.read(|conn| lease(conn, id))
    }

    /// All persisted leases.
    pub fn leases(&self) -> StorageResult<Vec<LeaseRecord>> {
        self.read(|conn| {
            let mut stmt = conn
                .prepare_cached("SELECT id, granted_ttl, expires_at_ms FROM leases ORDER BY id")?;
            let leases = stmt
                .query_map([], lease_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(leases)
        })
    }

    /// Ids of leases that expired at or before `now_ms`.
    pub fn expired_leases(&self, now_ms: i64) -> StorageResult<Vec<i64>> {
        self.read(|conn| {
            let mut stmt = conn
                .prepare_cached("SELECT id FROM leases WHERE expires_at_ms <= ?1 ORDER BY id")?;
            let ids = stmt
                .query_map(params![now_ms], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            Ok(ids)
        })
    }

    /// Keys currently attached to lease `id`.
    pub fn lease_keys(&self, id: i64) -> StorageResult<Vec<Vec<u8>>> {
        self.read(|conn| lease_keys(conn, id))
    }

    /// Size of the database in bytes.
    pub fn db_size(&self) -> StorageResult<i64> {
        self.read(|conn| {
            let pages: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
            Ok(pages * page_size)
        })
    }
}

/// Mutations available inside [`SqliteStore::write`].
pub struct WriteBatch<'a> {
    conn: &'a Connection,
}

impl WriteBatch<'_> {
    /// Latest revision, including writes made earlier in this batch.
    pub fn revision(&self) -> StorageResult<i64> {
        current_revision(self.conn)
    }

    /// Live value of `key`.
    pub fn get(&self, key: &[u8]) -> StorageResult<Option<KvRecord>> {
        live(self.conn, key, i64::MAX)
    }

    /// Live keys in `range` at `revision` (0 = current).
    pub fn range(
        &self,
        range: &KeyRange,
        revision: i64,
        limit: Option<usize>,
    ) -> StorageResult<RangeResult> {
        let current = current_revision(self.conn)?;
        let at = resolve_read_revision(self.conn, revision, current)?;
        read_range(self.conn, range, at, limit, current)
    }

    /// Write `value` to `key`. Returns the new revision and the previous value.
    pub fn put(
        &self,
        key: &[u8],
        value: &[u8],
        lease: i64,
    ) -> StorageResult<(i64, Option<KvRecord>)> {
        let latest = latest(self.conn, key, i64::MAX)?;
        let prev = latest.as_ref().filter(|row| !row.deleted).map(LogRow::record);
        let revision = current_revision(self.conn)? + 1;
        let prev_revision = latest.as_ref().map_or(0, |row| row.revision);

        let (created, create_revision, version, old_value) = match prev {
            Some(ref p) => (false, p.create_revision, p.version + 1, p.value.as_slice()),
            None => (true, revision, 1, &[][..]),
        };

        self.conn
            .prepare_cached(&format!("INSERT INTO kv_log ({COLUMNS}) VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?7, ?8, ?9)"))?
            .execute(params![
                revision,
                key,
                created as i64,
                create_revision,
                prev_revision,
                version,
                lease,
                value,
                old_value
            ])?;
        Ok((revision, prev))
    }

    /// Delete `key`. Returns the tombstone revision and the deleted value.
    pub fn delete(&self, key: &[u8]) -> StorageResult<Option<(i64, KvRecord)>> {
        let Some(prev) = live(self.conn, key, i64::MAX)? else {
            return Ok(None);
        };
        let revision = current_revision(self.conn)? + 1;
        self.conn
            .prepare_cached(&format!("INSERT INTO kv_log ({COLUMNS}) VALUES (?1, ?2, 0, 1, ?3, ?4, ?5, ?6, X'', ?7)"))?
            .execute(params![
                revision,
                key,
                prev.create_revision,
                prev.mod_revision,
                prev.version,
                prev.lease,
                prev.value
            ])?;
        Ok(Some((revision, prev)))
    }

    /// Delete every live key in `range`.
    pub fn delete_range(&self, range: &KeyRange) -> StorageResult<Vec<(i64, KvRecord)>> {
        let keys: Vec<Vec<u8>> = match range {
            KeyRange::Single(key) => vec![key.clone()],
            _ => self
                .range(range, 0, None)?
                .records
                .into_iter()
                .map(|record| record.key)
                .collect(),
        };
        let mut deleted = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.delete(&key)? {
                deleted.push(entry);
            }
        }
        Ok(deleted)
    }

    /// Raise the compaction floor to `revision`.
    pub fn compact(&self, revision: i64) -> StorageResult<usize> {
        let current = current_revision(self.conn)?;
        let floor = compact_revision(self.conn)?;
        if revision <= floor {
            return Err(StorageError::Compacted {
                revision,
                compact_revision: floor,
            });
        }
        if revision > current {
            return Err(StorageError::FutureRevision {
                revision,
                current_revision: current,
            });
        }
        let removed = self.conn.execute(COMPACT, params![revision])?;
        self.conn.execute(
            "INSERT INTO kv_meta (name, value) VALUES ('compact_revision', ?1)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            params![revision],
        )?;
        Ok(removed)
    }

    /// Check whether lease `id` exists.
    pub fn lease_exists(&self, id: i64) -> StorageResult<bool> {
        Ok(lease(self.conn, id)?.is_some())
    }

    /// Lease by id.
    pub fn lease(&self, id: i64) -> StorageResult<Option<LeaseRecord>> {
        lease(self.conn, id)
    }

    /// Persist a new lease. `id == 0` picks an unused id.
    pub fn grant_lease(&self, id: i64, ttl: i64, now_ms: i64) -> StorageResult<LeaseRecord> {
        if ttl <= 0 {
            return Err(StorageError::invalid("etcdserver: lease TTL must be positive"));
        }
        let id = if id == 0 {
            let max_id: i64 =
                self.conn
                    .query_row("SELECT COALESCE(MAX(id), 0) FROM leases", [], |row| row.get(0))?;
            now_ms.max(max_id + 1)
        } else if id < 0 {
            return Err(StorageError::invalid("etcdserver: lease ID must be positive"));
        } else {
            if lease(self.conn, id)?.is_some() {
                return Err(StorageError::LeaseExists { lease_id: id });
            }
            id
        };
        let record = LeaseRecord {
            id,
            granted_ttl: ttl,
            expires_at_ms: deadline_after(now_ms, ttl_duration(ttl)),
        };
        self.conn.execute(
            "INSERT INTO leases (id, granted_ttl, expires_at_ms) VALUES (?1, ?2, ?3)",
            params![record.id, record.granted_ttl, record.expires_at_ms],
        )?;
        Ok(record)
    }

    /// Push the expiry of lease `id` to `now + granted_ttl`.
    pub fn refresh_lease(&self, id: i64, now_ms: i64) -> StorageResult<LeaseRecord> {
        let Some(mut record) = lease(self.conn, id)? else {
            return Err(StorageError::LeaseNotFound { lease_id: id });
        };
        if record.expires_at_ms <= now_ms {
            return Err(StorageError::LeaseNotFound { lease_id: id });
        }
        record.expires_at_ms = deadline_after(now_ms, ttl_duration(record.granted_ttl));
        self.conn.execute(
            "UPDATE leases SET expires_at_ms = ?2 WHERE id = ?1",
            params![id, record.expires_at_ms],
        )?;
        Ok(record)
    }

    /// Remove lease `id` and delete every key attached to it.
    pub fn revoke_lease(&self, id: i64) -> StorageResult<Vec<(i64, KvRecord)>> {
        if lease(self.conn, id)?.is_none() {
            return Err(StorageError::LeaseNotFound { lease_id: id });
        }
        let mut deleted = Vec::new();
        for key in lease_keys(self.conn, id)? {
            if let Some(entry) = self.delete(&key)? {
                deleted.push(entry);
            }
        }
        self.conn
            .execute("DELETE FROM leases WHERE id = ?1", params![id])?;
        Ok(deleted)
    }
}

fn with_retry<T>(mut op: impl FnMut() -> StorageResult<T>) -> StorageResult<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(err) if is_lock_contention(&err) && attempt < LOCK_RETRY_ATTEMPTS => {
                attempt += 1;
                std::thread::sleep(LOCK_RETRY_BACKOFF * attempt);
            }
            other => return other,
        }
    }
}

fn is_lock_contention(err: &StorageError) -> bool {
    matches!(
        err,
        StorageError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn ttl_duration(ttl_secs: i64) -> Duration {
    Duration::from_secs(u64::try_from(ttl_secs).unwrap_or(0))
}

fn limit_param(limit: Option<usize>) -> i64 {
    limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX))
}

fn current_revision(conn: &Connection) -> StorageResult<i64> {
    let revision = conn
        .query_row(
            "SELECT seq FROM sqlite_sequence WHERE name = 'kv_log'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(revision.unwrap_or(0))
}

fn compact_revision(conn: &Connection) -> StorageResult<i64> {
    let revision = conn
        .query_row(
            "SELECT value FROM kv_meta WHERE name = 'compact_revision'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(revision.unwrap_or(0))
}

fn resolve_read_revision(conn: &Connection, revision: i64, current: i64) -> StorageResult<i64> {
    if revision <= 0 {
        return Ok(current);
    }
    if revision > current {
        return Err(StorageError::FutureRevision {
            revision,
            current_revision: current,
        });
    }
    let floor = compact_revision(conn)?;
    if revision < floor {
        return Err(StorageError::Compacted {
            revision,
            compact_revision: floor,
        });
    }
    Ok(revision)
}

fn latest(conn: &Connection, key: &[u8], revision: i64) -> StorageResult<Option<LogRow>> {
    let row = conn
        .prepare_cached(&format!(
            "SELECT {COLUMNS} FROM kv_log WHERE key = ?1 AND revision <= ?2 ORDER BY revision DESC LIMIT 1"
        ))?
        .query_row(params![key, revision], LogRow::from_row)
        .optional()?;
    Ok(row)
}

fn live(conn: &Connection, key: &[u8], revision: i64) -> StorageResult<Option<KvRecord>> {
    Ok(latest(conn, key, revision)?
        .filter(|row| !row.deleted)
        .map(|row| row.record()))
}

fn read_range(
    conn: &Connection,
    range: &KeyRange,
    at: i64,
    limit: Option<usize>,
    current: i64,
) -> StorageResult<RangeResult> {
    if let KeyRange::Single(key) = range {
        let records: Vec<KvRecord> = live(conn, key, at)?.into_iter().collect();
        return Ok(RangeResult {
            count: records.len() as i64,
            more: false,
            records,
            revision: current,
        });
    }

    let (start, end) = range.bounds();
    let records = conn
        .prepare_cached(LATEST_IN_RANGE)?
        .query_map(params![start, end, at, limit_param(limit)], |row| {
            LogRow::from_row(row).map(|r| r.record())
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let count = if limit.is_some() {
        conn.prepare_cached(COUNT_IN_RANGE)?
            .query_row(params![start, end, at], |row| row.get::<_, i64>(0))?
    } else {
        records.len() as i64
    };

    Ok(RangeResult {
        more: (records.len() as i64) < count,
        count,
        records,
        revision: current,
    })
}

fn lease_from_row(row: &Row<'_>) -> rusqlite::Result<LeaseRecord> {
    Ok(LeaseRecord {
        id: row.get(0)?,
        granted_ttl: row.get(1)?,
        expires_at_ms: row.get(2)?,
    })
}

fn lease(conn: &Connection, id: i64) -> StorageResult<Option<LeaseRecord>> {
    let record = conn
        .query_row(
            "SELECT id, granted_ttl, expires_at_ms FROM leases WHERE id = ?1",
            params![id],
            lease_from_row,
        )
        .optional()?;
    Ok(record)
}

fn lease_keys(conn: &Connection, id: i64) -> StorageResult<Vec<Vec<u8>>> {
    let keys = conn
        .prepare_cached(LEASE_KEYS)?
        .query_map(params![id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<Vec<u8>>>>()?;
    Ok(keys)
}
