//! Job and job log persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;

use crate::{Job, JobLog, StoreError};

/// Persistence for job definitions.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError>;

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// Insert or replace a job.
    async fn save_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Jobs eligible to run at `now`.
    async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .list_jobs()
            .await?
            .into_iter()
            .filter(|job| job.is_due(now))
            .collect())
    }

    /// Mark a job as running at `at`.
    ///
    /// Returns `false` while another execution holds a claim taken at or
    /// after `stale_before`. Older claims are taken over.
    async fn try_claim(
        &self,
        job_id: &str,
        at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn release_claim(&self, job_id: &str) -> Result<(), StoreError>;
}

/// Append-only persistence for job logs.
#[async_trait]
pub trait JobLogStore: Send + Sync {
    async fn append_log(&self, log: &JobLog) -> Result<(), StoreError>;

    /// Most recent logs for a job, newest first.
    async fn logs_for_job(&self, job_id: &str, limit: usize) -> Result<Vec<JobLog>, StoreError>;

    /// Delete logs created before `cutoff`. Returns how many were removed.
    async fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// In-memory job store.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: DashMap<String, Job>,
    claims: DashMap<String, DateTime<Utc>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.get(id).map(|j| j.clone()))
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|j| j.value().clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn try_claim(
        &self,
        job_id: &str,
        at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        match self.claims.entry(job_id.to_string()) {
            Entry::Occupied(mut held) if *held.get() < stale_before => {
                held.insert(at);
                Ok(true)
            }
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(at);
                Ok(true)
            }
        }
    }

    async fn release_claim(&self, job_id: &str) -> Result<(), StoreError> {
        self.claims.remove(job_id);
        Ok(())
    }
}

/// In-memory job log store.
#[derive(Default)]
pub struct MemoryJobLogStore {
    logs: RwLock<Vec<JobLog>>,
}

impl MemoryJobLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored log, oldest first.
    pub async fn all(&self) -> Vec<JobLog> {
        self.logs.read().await.clone()
    }
}

#[async_trait]
impl JobLogStore for MemoryJobLogStore {
    async fn append_log(&self, log: &JobLog) -> Result<(), StoreError> {
        self.logs.write().await.push(log.clone());
        Ok(())
    }

    async fn logs_for_job(&self, job_id: &str, limit: usize) -> Result<Vec<JobLog>, StoreError> {
        Ok(self
            .logs
            .read()
            .await
            .iter()
            .rev()
            .filter(|log| log.job_id == job_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut logs = self.logs.write().await;
        let before = logs.len();
        logs.retain(|log| log.created_at >= cutoff);
        Ok(before - logs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LogLevel;
    use chrono::Duration;

    #[tokio::test]
    async fn test_due_jobs_filters() {
        let store = MemoryJobStore::new();
        let now = Utc::now();

        let due = Job::new("due", "conduit.ping", 60);
        let mut later = Job::new("later", "conduit.ping", 60);
        later.next_run = Some(now + Duration::minutes(5));
        let mut disabled = Job::new("disabled", "conduit.ping", 60);
        disabled.enabled = false;

        for job in [&due, &later, &disabled] {
            store.save_job(job).await.unwrap();
        }

        let jobs = store.due_jobs(now).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, due.id);
    }

    #[tokio::test]
    async fn test_claim_held_until_released_or_stale() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let cutoff = now - Duration::minutes(10);

        assert!(store.try_claim("job", now, cutoff).await.unwrap());
        assert!(!store.try_claim("job", now, cutoff).await.unwrap());
        assert!(store.try_claim("other", now, cutoff).await.unwrap());

        store.release_claim("job").await.unwrap();
        assert!(store.try_claim("job", now, cutoff).await.unwrap());

        // A claim older than the cutoff belongs to a dead run.
        let later = now + Duration::minutes(30);
        assert!(store.try_claim("job", later, later - Duration::minutes(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_logs_newest_first_and_limited() {
        let store = MemoryJobLogStore::new();
        for i in 0..5 {
            let log = JobLog::new("job-1", LogLevel::Info, format!("run {}", i));
            store.append_log(&log).await.unwrap();
        }
        store
            .append_log(&JobLog::new("job-2", LogLevel::Info, "other"))
            .await
            .unwrap();

        let logs = store.logs_for_job("job-1", 2).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "run 4");
        assert_eq!(logs[1].message, "run 3");
    }

    #[tokio::test]
    async fn test_purge_before_cutoff() {
        let store = MemoryJobLogStore::new();
        let now = Utc::now();

        let old = JobLog::new("job", LogLevel::Info, "old").created_at(now - Duration::days(40));
        let fresh = JobLog::new("job", LogLevel::Info, "fresh").created_at(now);
        store.append_log(&old).await.unwrap();
        store.append_log(&fresh).await.unwrap();

        let purged = store
            .purge_logs_before(now - Duration::days(30))
            .await
            .unwrap();

        assert_eq!(purged, 1);
        assert_eq!(store.all().await, vec![fresh]);
    }
}
