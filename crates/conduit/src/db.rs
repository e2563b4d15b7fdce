//! SQLite persistence for jobs, job logs, synchronizations, contracts and
//! internal-store objects.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use conduit_scheduler::{Arguments, Job, JobLog, JobLogStore, JobStore, LogLevel, StoreError};
use conduit_sync::{
    ContractStore, ObjectStore, Synchronization, SynchronizationContract, SynchronizationStore,
    WrittenState,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        action TEXT NOT NULL,
        arguments TEXT NOT NULL DEFAULT '{}',
        interval INTEGER NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        single_run INTEGER NOT NULL DEFAULT 0,
        is_time_sensitive INTEGER NOT NULL DEFAULT 0,
        allow_parallel_runs INTEGER NOT NULL DEFAULT 0,
        user_id TEXT,
        last_run TEXT,
        next_run TEXT,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_jobs_next_run ON jobs(enabled, next_run);

    CREATE TABLE IF NOT EXISTS job_claims (
        job_id TEXT PRIMARY KEY,
        claimed_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS job_logs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        job_id TEXT NOT NULL,
        level TEXT NOT NULL,
        message TEXT NOT NULL,
        trace TEXT NOT NULL DEFAULT '[]',
        execution_time_ms INTEGER NOT NULL DEFAULT 0,
        arguments TEXT NOT NULL DEFAULT '{}',
        next_run TEXT,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs(job_id, seq);
    CREATE INDEX IF NOT EXISTS idx_job_logs_created ON job_logs(created_at);

    CREATE TABLE IF NOT EXISTS synchronizations (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        source_type TEXT NOT NULL,
        source_ref TEXT NOT NULL,
        target_type TEXT NOT NULL,
        target_ref TEXT NOT NULL,
        mapping_id TEXT,
        direction TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_synchronizations_source
        ON synchronizations(source_type, source_ref);

    CREATE TABLE IF NOT EXISTS synchronization_contracts (
        id TEXT PRIMARY KEY,
        synchronization_id TEXT NOT NULL,
        source_id TEXT NOT NULL,
        source_hash TEXT,
        target_hash TEXT,
        target_id TEXT,
        last_checked TEXT,
        last_synced TEXT,
        created_at TEXT NOT NULL,
        UNIQUE(synchronization_id, source_id)
    );

    CREATE TABLE IF NOT EXISTS objects (
        register TEXT NOT NULL,
        id TEXT NOT NULL,
        data TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (register, id)
    );
";

const JOB_COLUMNS: &str = "id, name, action, arguments, interval, enabled, single_run,
    is_time_sensitive, allow_parallel_runs, user_id, last_run, next_run, created_at";

const LOG_COLUMNS: &str =
    "id, job_id, level, message, trace, execution_time_ms, arguments, next_run, created_at";

const SYNC_COLUMNS: &str = "id, name, source_type, source_ref, target_type, target_ref,
    mapping_id, direction, created_at";

const CONTRACT_COLUMNS: &str = "id, synchronization_id, source_id, source_hash, target_hash,
    target_id, last_checked, last_synced, created_at";

/// SQLite-backed store for every conduit record type.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path`.
    pub fn open(path: &str) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %path, "conduit database initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(at: Option<DateTime<Utc>>) -> Option<String> {
    at.map(ts)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", raw, e)))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.as_deref().map(parse_ts).transpose()
}

fn parse_arguments(raw: &str) -> Result<Arguments, StoreError> {
    Ok(serde_json::from_str(raw)?)
}

struct JobRow {
    id: String,
    name: String,
    action: String,
    arguments: String,
    interval: i64,
    enabled: bool,
    single_run: bool,
    is_time_sensitive: bool,
    allow_parallel_runs: bool,
    user_id: Option<String>,
    last_run: Option<String>,
    next_run: Option<String>,
    created_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            action: row.get(2)?,
            arguments: row.get(3)?,
            interval: row.get(4)?,
            enabled: row.get(5)?,
            single_run: row.get(6)?,
            is_time_sensitive: row.get(7)?,
            allow_parallel_runs: row.get(8)?,
            user_id: row.get(9)?,
            last_run: row.get(10)?,
            next_run: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    fn into_job(self) -> Result<Job, StoreError> {
        Ok(Job {
            arguments: parse_arguments(&self.arguments)?,
            interval: u64::try_from(self.interval)
                .map_err(|_| StoreError::Corrupt(format!("job {} has interval {}", self.id, self.interval)))?,
            last_run: parse_opt_ts(self.last_run)?,
            next_run: parse_opt_ts(self.next_run)?,
            created_at: parse_ts(&self.created_at)?,
            id: self.id,
            name: self.name,
            action: self.action,
            enabled: self.enabled,
            single_run: self.single_run,
            is_time_sensitive: self.is_time_sensitive,
            allow_parallel_runs: self.allow_parallel_runs,
            user_id: self.user_id,
        })
    }
}

struct JobLogRow {
    id: String,
    job_id: String,
    level: String,
    message: String,
    trace: String,
    execution_time_ms: i64,
    arguments: String,
    next_run: Option<String>,
    created_at: String,
}

impl JobLogRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_id: row.get(1)?,
            level: row.get(2)?,
            message: row.get(3)?,
            trace: row.get(4)?,
            execution_time_ms: row.get(5)?,
            arguments: row.get(6)?,
            next_run: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_log(self) -> Result<JobLog, StoreError> {
        Ok(JobLog {
            level: self.level.parse::<LogLevel>().map_err(StoreError::Corrupt)?,
            trace: serde_json::from_str(&self.trace)?,
            execution_time_ms: u64::try_from(self.execution_time_ms).unwrap_or(0),
            arguments: parse_arguments(&self.arguments)?,
            next_run: parse_opt_ts(self.next_run)?,
            created_at: parse_ts(&self.created_at)?,
            id: self.id,
            job_id: self.job_id,
            message: self.message,
        })
    }
}

struct SynchronizationRow {
    id: String,
    name: String,
    source_type: String,
    source_ref: String,
    target_type: String,
    target_ref: String,
    mapping_id: Option<String>,
    direction: String,
    created_at: String,
}

impl SynchronizationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            source_type: row.get(2)?,
            source_ref: row.get(3)?,
            target_type: row.get(4)?,
            target_ref: row.get(5)?,
            mapping_id: row.get(6)?,
            direction: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_synchronization(self) -> Result<Synchronization, StoreError> {
        Ok(Synchronization {
            direction: self.direction.parse().map_err(StoreError::Corrupt)?,
            created_at: parse_ts(&self.created_at)?,
            id: self.id,
            name: self.name,
            source_type: self.source_type,
            source_ref: self.source_ref,
            target_type: self.target_type,
            target_ref: self.target_ref,
            mapping_id: self.mapping_id,
        })
    }
}

struct ContractRow {
    id: String,
    synchronization_id: String,
    source_id: String,
    source_hash: Option<String>,
    target_hash: Option<String>,
    target_id: Option<String>,
    last_checked: Option<String>,
    last_synced: Option<String>,
    created_at: String,
}

impl ContractRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            synchronization_id: row.get(1)?,
            source_id: row.get(2)?,
            source_hash: row.get(3)?,
            target_hash: row.get(4)?,
            target_id: row.get(5)?,
            last_checked: row.get(6)?,
            last_synced: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_contract(self) -> Result<SynchronizationContract, StoreError> {
        Ok(SynchronizationContract {
            last_checked: parse_opt_ts(self.last_checked)?,
            last_synced: parse_opt_ts(self.last_synced)?,
            created_at: parse_ts(&self.created_at)?,
            id: self.id,
            synchronization_id: self.synchronization_id,
            source_id: self.source_id,
            source_hash: self.source_hash,
            target_hash: self.target_hash,
            target_id: self.target_id,
        })
    }
}

#[async_trait]
impl JobStore for Database {
    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                JobRow::from_row,
            )
            .optional()
            .map_err(backend)?;
        row.map(JobRow::into_job).transpose()
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM jobs ORDER BY created_at, id", JOB_COLUMNS))
            .map_err(backend)?;
        let rows = stmt
            .query_map([], JobRow::from_row)
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        let arguments = serde_json::to_string(&job.arguments)?;
        let interval = i64::try_from(job.interval)
            .map_err(|_| StoreError::Corrupt(format!("job {} has interval {}", job.id, job.interval)))?;

        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                JOB_COLUMNS
            ),
            params![
                job.id,
                job.name,
                job.action,
                arguments,
                interval,
                job.enabled,
                job.single_run,
                job.is_time_sensitive,
                job.allow_parallel_runs,
                job.user_id,
                opt_ts(job.last_run),
                opt_ts(job.next_run),
                ts(job.created_at),
            ],
        )
        .map_err(backend)?;
        Ok(())
    }

    async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM jobs
                 WHERE enabled = 1 AND (next_run IS NULL OR next_run <= ?1)
                 ORDER BY created_at, id",
                JOB_COLUMNS
            ))
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![ts(now)], JobRow::from_row)
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn try_claim(
        &self,
        job_id: &str,
        at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "INSERT INTO job_claims (job_id, claimed_at) VALUES (?1, ?2)
                 ON CONFLICT(job_id) DO UPDATE SET claimed_at = excluded.claimed_at
                 WHERE job_claims.claimed_at < ?3",
                params![job_id, ts(at), ts(stale_before)],
            )
            .map_err(backend)?;
        Ok(changed == 1)
    }

    async fn release_claim(&self, job_id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM job_claims WHERE job_id = ?1", params![job_id])
            .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl JobLogStore for Database {
    async fn append_log(&self, log: &JobLog) -> Result<(), StoreError> {
        let trace = serde_json::to_string(&log.trace)?;
        let arguments = serde_json::to_string(&log.arguments)?;

        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO job_logs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                LOG_COLUMNS
            ),
            params![
                log.id,
                log.job_id,
                log.level.as_str(),
                log.message,
                trace,
                i64::try_from(log.execution_time_ms).unwrap_or(i64::MAX),
                arguments,
                opt_ts(log.next_run),
                ts(log.created_at),
            ],
        )
        .map_err(backend)?;
        Ok(())
    }

    async fn logs_for_job(&self, job_id: &str, limit: usize) -> Result<Vec<JobLog>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM job_logs WHERE job_id = ?1 ORDER BY seq DESC LIMIT ?2",
                LOG_COLUMNS
            ))
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![job_id, limit as i64], JobLogRow::from_row)
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;
        rows.into_iter().map(JobLogRow::into_log).collect()
    }

    async fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM job_logs WHERE created_at < ?1", params![ts(cutoff)])
            .map_err(backend)
    }
}

#[async_trait]
impl SynchronizationStore for Database {
    async fn get_synchronization(&self, id: &str) -> Result<Option<Synchronization>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM synchronizations WHERE id = ?1", SYNC_COLUMNS),
                params![id],
                SynchronizationRow::from_row,
            )
            .optional()
            .map_err(backend)?;
        row.map(SynchronizationRow::into_synchronization).transpose()
    }

    async fn list_synchronizations(&self) -> Result<Vec<Synchronization>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM synchronizations ORDER BY created_at, id",
                SYNC_COLUMNS
            ))
            .map_err(backend)?;
        let rows = stmt
            .query_map([], SynchronizationRow::from_row)
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;
        rows.into_iter()
            .map(SynchronizationRow::into_synchronization)
            .collect()
    }

    async fn save_synchronization(&self, sync: &Synchronization) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO synchronizations ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                SYNC_COLUMNS
            ),
            params![
                sync.id,
                sync.name,
                sync.source_type,
                sync.source_ref,
                sync.target_type,
                sync.target_ref,
                sync.mapping_id,
                sync.direction.as_str(),
                ts(sync.created_at),
            ],
        )
        .map_err(backend)?;
        Ok(())
    }

    async fn watching(
        &self,
        source_type: &str,
        source_ref: &str,
    ) -> Result<Vec<Synchronization>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM synchronizations
                 WHERE source_type = ?1 AND source_ref = ?2
                 ORDER BY created_at, id",
                SYNC_COLUMNS
            ))
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![source_type, source_ref], SynchronizationRow::from_row)
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;
        rows.into_iter()
            .map(SynchronizationRow::into_synchronization)
            .collect()
    }
}

#[async_trait]
impl ContractStore for Database {
    async fn get_contract(
        &self,
        synchronization_id: &str,
        source_id: &str,
    ) -> Result<Option<SynchronizationContract>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM synchronization_contracts
                     WHERE synchronization_id = ?1 AND source_id = ?2",
                    CONTRACT_COLUMNS
                ),
                params![synchronization_id, source_id],
                ContractRow::from_row,
            )
            .optional()
            .map_err(backend)?;
        row.map(ContractRow::into_contract).transpose()
    }

    async fn ensure_contract(
        &self,
        synchronization_id: &str,
        source_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SynchronizationContract, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "INSERT INTO synchronization_contracts
                        (id, synchronization_id, source_id, last_checked, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)
                     ON CONFLICT(synchronization_id, source_id)
                        DO UPDATE SET last_checked = excluded.last_checked
                     RETURNING {}",
                    CONTRACT_COLUMNS
                ),
                params![
                    Uuid::new_v4().to_string(),
                    synchronization_id,
                    source_id,
                    ts(now)
                ],
                ContractRow::from_row,
            )
            .map_err(backend)?;
        row.into_contract()
    }

    async fn record_write(
        &self,
        synchronization_id: &str,
        source_id: &str,
        written: &WrittenState,
    ) -> Result<SynchronizationContract, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "INSERT INTO synchronization_contracts
                        (id, synchronization_id, source_id, source_hash, target_hash, target_id,
                         last_checked, last_synced, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?7)
                     ON CONFLICT(synchronization_id, source_id) DO UPDATE SET
                        source_hash = excluded.source_hash,
                        target_hash = excluded.target_hash,
                        target_id = excluded.target_id,
                        last_checked = excluded.last_checked,
                        last_synced = excluded.last_synced
                     RETURNING {}",
                    CONTRACT_COLUMNS
                ),
                params![
                    Uuid::new_v4().to_string(),
                    synchronization_id,
                    source_id,
                    written.source_hash,
                    written.target_hash,
                    written.target_id,
                    ts(written.synced_at),
                ],
                ContractRow::from_row,
            )
            .map_err(backend)?;
        row.into_contract()
    }

    async fn delete_contract(
        &self,
        synchronization_id: &str,
        source_id: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM synchronization_contracts WHERE synchronization_id = ?1 AND source_id = ?2",
                params![synchronization_id, source_id],
            )
            .map_err(backend)?;
        Ok(removed > 0)
    }

    async fn contracts_for_synchronization(
        &self,
        synchronization_id: &str,
    ) -> Result<Vec<SynchronizationContract>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM synchronization_contracts
                 WHERE synchronization_id = ?1 ORDER BY source_id",
                CONTRACT_COLUMNS
            ))
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![synchronization_id], ContractRow::from_row)
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;
        rows.into_iter().map(ContractRow::into_contract).collect()
    }
}

#[async_trait]
impl ObjectStore for Database {
    async fn list_objects(&self, register: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, data FROM objects WHERE register = ?1 ORDER BY id")
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![register], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;

        rows.into_iter()
            .map(|(id, data)| Ok((id, serde_json::from_str(&data)?)))
            .collect()
    }

    async fn get_object(&self, register: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let conn = self.conn()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM objects WHERE register = ?1 AND id = ?2",
                params![register, id],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        Ok(data.map(|d| serde_json::from_str(&d)).transpose()?)
    }

    async fn put_object(&self, register: &str, id: &str, value: &Value) -> Result<(), StoreError> {
        let data = serde_json::to_string(value)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO objects (register, id, data, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(register, id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
            params![register, id, data, ts(Utc::now())],
        )
        .map_err(backend)?;
        Ok(())
    }

    async fn delete_object(&self, register: &str, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM objects WHERE register = ?1 AND id = ?2",
                params![register, id],
            )
            .map_err(backend)?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conduit.db");
        let db = Database::open(path.to_str().unwrap()).unwrap();
        (dir, db)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_800_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_job_roundtrip() {
        let (_dir, db) = open_temp();
        let mut job = Job::new("nightly", "conduit.ping", 900)
            .with_argument("sourceType", json!("internal"))
            .with_argument("sourceRef", json!("people"));
        job.user_id = Some("admin".into());
        job.last_run = Some(at(0));
        job.next_run = Some(at(900));
        job.is_time_sensitive = true;

        db.save_job(&job).await.unwrap();

        // Stored timestamps are truncated to microseconds.
        let loaded = db.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.arguments, job.arguments);
        assert_eq!(loaded.next_run, job.next_run);
        assert_eq!(loaded.user_id.as_deref(), Some("admin"));
        assert!(loaded.is_time_sensitive);
        assert!(db.get_job("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_job_replaces() {
        let db = Database::open_in_memory().unwrap();
        let mut job = Job::new("a", "conduit.ping", 60);
        db.save_job(&job).await.unwrap();

        job.enabled = false;
        db.save_job(&job).await.unwrap();

        let jobs = db.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(!jobs[0].enabled);
    }

    #[tokio::test]
    async fn test_due_jobs_query() {
        let db = Database::open_in_memory().unwrap();
        let now = at(1000);

        let unset = Job::new("unset", "a", 60);
        let mut past = Job::new("past", "a", 60);
        past.next_run = Some(now - Duration::seconds(1));
        let mut exact = Job::new("exact", "a", 60);
        exact.next_run = Some(now);
        let mut future = Job::new("future", "a", 60);
        future.next_run = Some(now + Duration::milliseconds(1));
        let mut disabled = Job::new("disabled", "a", 60);
        disabled.enabled = false;

        for job in [&unset, &past, &exact, &future, &disabled] {
            db.save_job(job).await.unwrap();
        }

        let mut names: Vec<String> = db
            .due_jobs(now)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["exact", "past", "unset"]);
    }

    #[tokio::test]
    async fn test_job_claims_shared_across_connections() {
        let (dir, db) = open_temp();
        let other = Database::open(dir.path().join("conduit.db").to_str().unwrap()).unwrap();
        let cutoff = at(0);

        assert!(db.try_claim("job", at(10), cutoff).await.unwrap());
        assert!(!other.try_claim("job", at(20), cutoff).await.unwrap());

        db.release_claim("job").await.unwrap();
        assert!(other.try_claim("job", at(30), cutoff).await.unwrap());

        // Stale once the cutoff passes the stored claim.
        assert!(db.try_claim("job", at(100), at(31)).await.unwrap());
        assert!(!other.try_claim("job", at(110), at(31)).await.unwrap());
    }

    #[tokio::test]
    async fn test_logs_newest_first_and_purge() {
        let db = Database::open_in_memory().unwrap();
        for i in 0..4 {
            let log = JobLog::new("job-1", LogLevel::Warning, format!("run {}", i))
                .with_trace(vec![format!("step {}", i)])
                .created_at(at(i * 86_400));
            db.append_log(&log).await.unwrap();
        }
        db.append_log(&JobLog::new("job-2", LogLevel::Error, "other").created_at(at(0)))
            .await
            .unwrap();

        let logs = db.logs_for_job("job-1", 2).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "run 3");
        assert_eq!(logs[0].trace, vec!["step 3".to_string()]);
        assert_eq!(logs[0].level, LogLevel::Warning);

        let purged = db.purge_logs_before(at(2 * 86_400)).await.unwrap();
        assert_eq!(purged, 3);
        assert_eq!(db.logs_for_job("job-1", 10).await.unwrap().len(), 2);
        assert!(db.logs_for_job("job-2", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_synchronization_watching() {
        let db = Database::open_in_memory().unwrap();
        let a = Synchronization::new("a", "internal", "people", "api", "/contacts")
            .with_mapping("people-to-contacts", conduit_sync::MappingDirection::TargetToSource);
        let b = Synchronization::new("b", "internal", "orders", "internal", "archive");
        db.save_synchronization(&a).await.unwrap();
        db.save_synchronization(&b).await.unwrap();

        let watching = db.watching("internal", "people").await.unwrap();
        assert_eq!(watching.len(), 1);
        assert_eq!(watching[0].id, a.id);
        assert_eq!(watching[0].mapping_id, a.mapping_id);
        assert_eq!(watching[0].direction, a.direction);
        assert_eq!(db.list_synchronizations().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_contract_upserts() {
        let db = Database::open_in_memory().unwrap();

        let created = db.ensure_contract("sync-1", "obj-1", at(0)).await.unwrap();
        assert!(created.source_hash.is_none());
        assert_eq!(created.created_at, at(0));

        let again = db.ensure_contract("sync-1", "obj-1", at(10)).await.unwrap();
        assert_eq!(again.id, created.id);
        assert_eq!(again.last_checked, Some(at(10)));
        assert_eq!(again.created_at, at(0));

        let written = db
            .record_write(
                "sync-1",
                "obj-1",
                &WrittenState {
                    source_hash: "sha256:aa".into(),
                    target_hash: "sha256:bb".into(),
                    target_id: "t-1".into(),
                    synced_at: at(20),
                },
            )
            .await
            .unwrap();
        assert_eq!(written.id, created.id);
        assert!(written.is_current("sha256:aa"));
        assert_eq!(written.last_synced, Some(at(20)));

        let fetched = db.get_contract("sync-1", "obj-1").await.unwrap().unwrap();
        assert_eq!(fetched, written);

        assert!(db.delete_contract("sync-1", "obj-1").await.unwrap());
        assert!(!db.delete_contract("sync-1", "obj-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_contracts_for_synchronization_sorted() {
        let db = Database::open_in_memory().unwrap();
        for id in ["c", "a", "b"] {
            db.ensure_contract("sync-1", id, at(0)).await.unwrap();
        }
        db.ensure_contract("sync-2", "z", at(0)).await.unwrap();

        let ids: Vec<String> = db
            .contracts_for_synchronization("sync-1")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.source_id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_objects() {
        let db = Database::open_in_memory().unwrap();
        db.put_object("people", "2", &json!({"name": "b"})).await.unwrap();
        db.put_object("people", "1", &json!({"name": "a"})).await.unwrap();
        db.put_object("people", "1", &json!({"name": "a2"})).await.unwrap();

        let objects = db.list_objects("people").await.unwrap();
        assert_eq!(
            objects,
            vec![
                ("1".to_string(), json!({"name": "a2"})),
                ("2".to_string(), json!({"name": "b"})),
            ]
        );
        assert!(db.list_objects("empty").await.unwrap().is_empty());

        assert!(db.delete_object("people", "1").await.unwrap());
        assert!(db.get_object("people", "1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conduit.db");
        let path = path.to_str().unwrap();

        let job = Job::new("persisted", "conduit.ping", 60);
        {
            let db = Database::open(path).unwrap();
            db.save_job(&job).await.unwrap();
        }

        let db = Database::open(path).unwrap();
        assert_eq!(db.get_job(&job.id).await.unwrap().unwrap().name, "persisted");
    }
}
