//! In-memory job store.
//!
//! Thread-safe backend for tests and single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{DeadLetterRecord, JobFilter, JobStore, StorageError, sort_for_dispatch};
use crate::core::job::{Job, JobStatus, JobType};
use crate::core::log::ExecutionLog;
use crate::core::schedule::JobSchedule;
use crate::core::state::Transition;
use crate::core::types::JobId;

/// In-memory job store.
///
/// Conditional updates are applied under the jobs write lock, which makes
/// them atomic. Data is not persisted across restarts.
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    schedules: RwLock<HashMap<JobId, JobSchedule>>,
    logs: RwLock<HashMap<JobId, Vec<ExecutionLog>>>,
    dead_letters: RwLock<Vec<DeadLetterRecord>>,
}

impl InMemoryJobStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            schedules: RwLock::new(HashMap::new()),
            logs: RwLock::new(HashMap::new()),
            dead_letters: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, job: Job) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(StorageError::DuplicateKey(format!("job: {}", job.id)));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Job, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        jobs.get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        sort_for_dispatch(&mut result);
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn transition(
        &self,
        id: &JobId,
        transition: &Transition,
        at: DateTime<Utc>,
    ) -> Result<Job, StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;
        job.apply(transition, at)?;
        Ok(job.clone())
    }

    async fn delete_job(&self, id: &JobId) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        jobs.remove(id)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;
        drop(jobs);

        self.schedules
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .remove(id);
        self.logs
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .remove(id);
        Ok(())
    }

    async fn count_by_status(&self) -> Result<BTreeMap<JobStatus, u64>, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut counts = BTreeMap::new();
        for job in jobs.values() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn count_by_type(&self) -> Result<BTreeMap<JobType, u64>, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut counts = BTreeMap::new();
        for job in jobs.values() {
            *counts.entry(job.job_type).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn save_schedule(&self, schedule: JobSchedule) -> Result<(), StorageError> {
        if !self
            .jobs
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .contains_key(&schedule.job_id)
        {
            return Err(StorageError::NotFound(format!("job: {}", schedule.job_id)));
        }

        let mut schedules = self
            .schedules
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        if schedules.contains_key(&schedule.job_id) {
            return Err(StorageError::DuplicateKey(format!(
                "schedule: {}",
                schedule.job_id
            )));
        }
        schedules.insert(schedule.job_id, schedule);
        Ok(())
    }

    async fn get_schedule(&self, job_id: &JobId) -> Result<Option<JobSchedule>, StorageError> {
        let schedules = self
            .schedules
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(schedules.get(job_id).cloned())
    }

    async fn update_schedule(&self, schedule: JobSchedule) -> Result<(), StorageError> {
        let mut schedules = self
            .schedules
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        match schedules.get_mut(&schedule.job_id) {
            Some(existing) => {
                *existing = schedule;
                Ok(())
            }
            None => Err(StorageError::NotFound(format!(
                "schedule: {}",
                schedule.job_id
            ))),
        }
    }

    async fn advance_schedule(
        &self,
        schedule: JobSchedule,
        expected_next: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let mut schedules = self
            .schedules
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let existing = schedules
            .get_mut(&schedule.job_id)
            .ok_or_else(|| StorageError::NotFound(format!("schedule: {}", schedule.job_id)))?;
        if !existing.is_active || existing.next_execution != expected_next {
            return Err(StorageError::Conflict(format!(
                "schedule {} already advanced",
                schedule.job_id
            )));
        }
        *existing = schedule;
        Ok(())
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<JobSchedule>, StorageError> {
        let schedules = self
            .schedules
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut due: Vec<_> = schedules.values().filter(|s| s.is_due(now)).cloned().collect();
        due.sort_by_key(|s| s.next_execution);
        Ok(due)
    }

    async fn append_log(&self, log: ExecutionLog) -> Result<(), StorageError> {
        if !self
            .jobs
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .contains_key(&log.job_id)
        {
            return Err(StorageError::NotFound(format!("job: {}", log.job_id)));
        }

        let mut logs = self.logs.write().map_err(|_| StorageError::LockPoisoned)?;
        logs.entry(log.job_id).or_default().push(log);
        Ok(())
    }

    async fn list_logs(&self, job_id: &JobId) -> Result<Vec<ExecutionLog>, StorageError> {
        let logs = self.logs.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(logs.get(job_id).cloned().unwrap_or_default())
    }

    async fn record_dead_letter(&self, record: DeadLetterRecord) -> Result<(), StorageError> {
        let mut dead_letters = self
            .dead_letters
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        dead_letters.push(record);
        Ok(())
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterRecord>, StorageError> {
        let dead_letters = self
            .dead_letters
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(dead_letters.clone())
    }

    async fn dead_letters_for(&self, job_id: &JobId) -> Result<Vec<DeadLetterRecord>, StorageError> {
        let dead_letters = self
            .dead_letters
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(dead_letters
            .iter()
            .filter(|record| record.job_id == *job_id)
            .cloned()
            .collect())
    }
}
