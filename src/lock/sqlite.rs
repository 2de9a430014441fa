//! SQLite Lock Store
//!
//! Durable coordination store backed by a single SQLite file. Every
//! participant on a host opens the same file; the `version` column turns
//! each write into a compare-and-swap.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{LockEvent, LockKey, LockRecord, LockStore, LockVersion};
use crate::error::{Error, Result};

/// Audit events kept per election
const EVENT_RETENTION: i64 = 1000;

/// How long a writer waits on another process holding the database lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Lock store backed by SQLite
pub struct SqliteLockStore {
    /// Database connection, used from blocking tasks only
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLockStore {
    /// Create or open the lock database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;

        // Initialize schema
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS leases (
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                holder_identity TEXT NOT NULL,
                lease_duration_ms INTEGER NOT NULL,
                acquire_time TEXT NOT NULL,
                renew_time TEXT NOT NULL,
                leader_transitions INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (namespace, name)
            );

            CREATE TABLE IF NOT EXISTS lock_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                identity TEXT NOT NULL,
                component TEXT NOT NULL,
                host TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_lock_events_key
                ON lock_events(namespace, name);
            "#,
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Number of audit events stored for `key`
    pub async fn event_count(&self, key: &LockKey) -> Result<u64> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM lock_events WHERE namespace = ?1 AND name = ?2",
                params![key.namespace, key.name],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    /// Run `f` against the connection on the blocking pool, so a slow disk
    /// never stalls the runtime and callers can time the call out
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| Error::Internal("lock store connection poisoned".into()))?;
            f(&conn)
        })
        .await
        .map_err(|e| Error::Internal(format!("lock store task failed: {}", e)))?
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::StoreUnavailable(format!("corrupt timestamp {:?}: {}", raw, e)))
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Raw row as read from the `leases` table
struct LeaseRow {
    holder_identity: String,
    lease_duration_ms: i64,
    acquire_time: String,
    renew_time: String,
    leader_transitions: i64,
    version: i64,
}

impl LeaseRow {
    fn into_record(self, key: LockKey) -> Result<LockRecord> {
        Ok(LockRecord {
            key,
            holder_identity: self.holder_identity,
            lease_duration: Duration::from_millis(self.lease_duration_ms.max(0) as u64),
            acquire_time: parse_time(&self.acquire_time)?,
            renew_time: parse_time(&self.renew_time)?,
            leader_transitions: self.leader_transitions.max(0) as u64,
            version: LockVersion::from_raw(self.version.max(0) as u64),
        })
    }
}

#[async_trait]
impl LockStore for SqliteLockStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &LockKey) -> Result<Option<LockRecord>> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    r#"
                    SELECT holder_identity, lease_duration_ms, acquire_time,
                           renew_time, leader_transitions, version
                    FROM leases WHERE namespace = ?1 AND name = ?2
                    "#,
                    params![key.namespace, key.name],
                    |row| {
                        Ok(LeaseRow {
                            holder_identity: row.get(0)?,
                            lease_duration_ms: row.get(1)?,
                            acquire_time: row.get(2)?,
                            renew_time: row.get(3)?,
                            leader_transitions: row.get(4)?,
                            version: row.get(5)?,
                        })
                    },
                )
                .optional()?;

            row.map(|row| row.into_record(key)).transpose()
        })
        .await
    }

    async fn create_if_absent(&self, mut record: LockRecord) -> Result<LockRecord> {
        record.version = LockVersion::INITIAL;
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                r#"
                INSERT OR IGNORE INTO leases (
                    namespace, name, holder_identity, lease_duration_ms,
                    acquire_time, renew_time, leader_transitions, version
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    record.key.namespace,
                    record.key.name,
                    record.holder_identity,
                    record.lease_duration.as_millis() as i64,
                    format_time(&record.acquire_time),
                    format_time(&record.renew_time),
                    record.leader_transitions as i64,
                    record.version.raw() as i64,
                ],
            )?;

            if inserted == 0 {
                return Err(Error::AlreadyExists(record.key.to_string()));
            }
            Ok(record)
        })
        .await
    }

    async fn update_if_unchanged(
        &self,
        mut record: LockRecord,
        expected: LockVersion,
    ) -> Result<LockRecord> {
        record.version = expected.next();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                r#"
                UPDATE leases SET
                    holder_identity = ?3,
                    lease_duration_ms = ?4,
                    acquire_time = ?5,
                    renew_time = ?6,
                    leader_transitions = ?7,
                    version = ?8,
                    updated_at = CURRENT_TIMESTAMP
                WHERE namespace = ?1 AND name = ?2 AND version = ?9
                "#,
                params![
                    record.key.namespace,
                    record.key.name,
                    record.holder_identity,
                    record.lease_duration.as_millis() as i64,
                    format_time(&record.acquire_time),
                    format_time(&record.renew_time),
                    record.leader_transitions as i64,
                    record.version.raw() as i64,
                    expected.raw() as i64,
                ],
            )?;

            if updated == 0 {
                return Err(Error::Conflict {
                    key: record.key.to_string(),
                    expected: expected.to_string(),
                });
            }
            Ok(record)
        })
        .await
    }

    async fn record_event(&self, event: &LockEvent) -> Result<()> {
        let event = event.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO lock_events (
                    namespace, name, kind, identity, component, host, recorded_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    event.key.namespace,
                    event.key.name,
                    event.kind.to_string(),
                    event.identity,
                    event.component,
                    event.host,
                    format_time(&event.at),
                ],
            )?;

            // Retention
            conn.execute(
                r#"
                DELETE FROM lock_events
                WHERE namespace = ?1 AND name = ?2 AND id <= (
                    SELECT MAX(id) FROM lock_events WHERE namespace = ?1 AND name = ?2
                ) - ?3
                "#,
                params![event.key.namespace, event.key.name, EVENT_RETENTION],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockEventKind;
    use tempfile::tempdir;

    fn record(holder: &str) -> LockRecord {
        LockRecord::new(
            LockKey::new("default", "web"),
            holder,
            Duration::from_secs(10),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_sqlite_round_trip() {
        let dir = tempdir().unwrap();
        let store = SqliteLockStore::open(&dir.path().join("leases.db")).unwrap();
        let key = LockKey::new("default", "web");

        assert!(store.get(&key).await.unwrap().is_none());

        let created = store.create_if_absent(record("p1")).await.unwrap();
        let read = store.get(&key).await.unwrap().unwrap();
        assert_eq!(read.holder_identity, "p1");
        assert_eq!(read.version, created.version);
        assert_eq!(read.lease_duration, Duration::from_secs(10));
        assert_eq!(read.renew_time, created.renew_time);
    }

    #[tokio::test]
    async fn test_two_connections_share_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("leases.db");
        let first = SqliteLockStore::open(&path).unwrap();
        let second = SqliteLockStore::open(&path).unwrap();

        first.create_if_absent(record("p1")).await.unwrap();
        let err = second.create_if_absent(record("p2")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        let seen = second.get(&LockKey::new("default", "web")).await.unwrap().unwrap();
        assert_eq!(seen.holder_identity, "p1");
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let dir = tempdir().unwrap();
        let store = SqliteLockStore::open(&dir.path().join("leases.db")).unwrap();

        let created = store.create_if_absent(record("p1")).await.unwrap();
        let mut stolen = created.clone();
        stolen.holder_identity = "p2".to_string();
        let stolen = store
            .update_if_unchanged(stolen, created.version)
            .await
            .unwrap();
        assert_eq!(stolen.version, created.version.next());

        let err = store
            .update_if_unchanged(created.clone(), created.version)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        let current = store.get(&created.key).await.unwrap().unwrap();
        assert_eq!(current.holder_identity, "p2");
    }

    #[tokio::test]
    async fn test_record_event() {
        let dir = tempdir().unwrap();
        let store = SqliteLockStore::open(&dir.path().join("leases.db")).unwrap();
        let created = store.create_if_absent(record("p1")).await.unwrap();

        let event = LockEvent::new(LockEventKind::Acquired, &created, "p1", "host-a");
        store.record_event(&event).await.unwrap();
        store.record_event(&event).await.unwrap();

        assert_eq!(store.event_count(&created.key).await.unwrap(), 2);
    }
}
