//! Append-only job records keyed by a unique idempotency key.
//!
//! `begin` refuses a key that already exists, which is what keeps two
//! overlapping runs from working the same logical unit at once. Records move
//! RUNNING -> SUCCESS | FAILED exactly once and are never edited afterwards.

use crate::models::normalize_keyword;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStage {
    Scrape,
    Analyze,
    Generate,
    List,
}

impl JobStage {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStage::Scrape => "SCRAPE",
            JobStage::Analyze => "ANALYZE",
            JobStage::Generate => "GENERATE",
            JobStage::List => "LIST",
        }
    }

    pub fn key_prefix(self) -> &'static str {
        match self {
            JobStage::Scrape => "scrape",
            JobStage::Analyze => "analyze",
            JobStage::Generate => "generate",
            JobStage::List => "list",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_uppercase().as_str() {
            "SCRAPE" => Some(JobStage::Scrape),
            "ANALYZE" => Some(JobStage::Analyze),
            "GENERATE" => Some(JobStage::Generate),
            "LIST" => Some(JobStage::List),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_uppercase().as_str() {
            "RUNNING" => Some(JobStatus::Running),
            "SUCCESS" => Some(JobStatus::Success),
            "FAILED" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub job_key: String,
    pub stage: JobStage,
    pub status: JobStatus,
    pub attempts: u32,
    pub metadata: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub parent_job_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LedgerError {
    #[error("job `{0}` already exists")]
    DuplicateJob(String),
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {id} is already {status:?}")]
    AlreadyTerminal { id: Uuid, status: JobStatus },
}

#[derive(Default)]
struct LedgerState {
    jobs: HashMap<Uuid, Job>,
    by_key: HashMap<String, Uuid>,
    finished: HashMap<String, usize>,
    order: Vec<Uuid>,
}

#[derive(Clone, Default)]
pub struct JobLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl JobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key for the next attempt on `unit`: `{stage}:{unit}:{n}` where `n`
    /// counts the unit's terminal jobs. While an attempt is RUNNING every
    /// caller computes the same key, so only one of them can `begin`.
    pub async fn next_key(&self, stage: JobStage, unit: &str) -> String {
        let series = format!("{}:{}", stage.key_prefix(), key_fragment(unit));
        let finished = self
            .state
            .lock()
            .await
            .finished
            .get(&series)
            .copied()
            .unwrap_or(0);
        format!("{series}:{finished}")
    }

    pub async fn begin(
        &self,
        job_key: &str,
        stage: JobStage,
        metadata: Value,
        parent_job_id: Option<Uuid>,
    ) -> Result<Job, LedgerError> {
        let mut guard = self.state.lock().await;
        if guard.by_key.contains_key(job_key) {
            warn!(target = "trendforge.ledger", job_key, "duplicate_job_rejected");
            return Err(LedgerError::DuplicateJob(job_key.to_string()));
        }
        let job = Job {
            id: Uuid::new_v4(),
            job_key: job_key.to_string(),
            stage,
            status: JobStatus::Running,
            attempts: 0,
            metadata,
            result: None,
            error: None,
            parent_job_id,
            started_at: Utc::now(),
            completed_at: None,
        };
        guard.by_key.insert(job.job_key.clone(), job.id);
        guard.order.push(job.id);
        guard.jobs.insert(job.id, job.clone());
        debug!(target = "trendforge.ledger", job_key, stage = stage.as_str(), "job_started");
        crate::metrics::job_transition(stage.as_str(), JobStatus::Running.as_str());
        Ok(job)
    }

    /// Records how many tries the wrapped operation needed. Only valid while
    /// the job is still running.
    pub async fn record_attempts(&self, job_id: Uuid, attempts: u32) -> Result<(), LedgerError> {
        let mut guard = self.state.lock().await;
        let job = guard.jobs.get_mut(&job_id).ok_or(LedgerError::NotFound(job_id))?;
        if job.status.is_terminal() {
            return Err(LedgerError::AlreadyTerminal {
                id: job_id,
                status: job.status,
            });
        }
        job.attempts = attempts;
        Ok(())
    }

    pub async fn complete(&self, job_id: Uuid, result: Value) -> Result<Job, LedgerError> {
        self.finish(job_id, JobStatus::Success, Some(result), None)
            .await
    }

    pub async fn fail(&self, job_id: Uuid, error: impl Into<String>) -> Result<Job, LedgerError> {
        self.finish(job_id, JobStatus::Failed, None, Some(error.into()))
            .await
    }

    async fn finish(
        &self,
        job_id: Uuid,
        status: JobStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<Job, LedgerError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let job = state.jobs.get_mut(&job_id).ok_or(LedgerError::NotFound(job_id))?;
        if job.status.is_terminal() {
            return Err(LedgerError::AlreadyTerminal {
                id: job_id,
                status: job.status,
            });
        }
        if let Some((series, _)) = job.job_key.rsplit_once(':') {
            *state.finished.entry(series.to_string()).or_insert(0) += 1;
        }
        job.status = status;
        job.result = result;
        job.error = error;
        job.completed_at = Some(Utc::now());
        if job.attempts == 0 {
            job.attempts = 1;
        }
        info!(
            target = "trendforge.ledger",
            job_key = %job.job_key,
            stage = job.stage.as_str(),
            status = status.as_str(),
            "job_finished"
        );
        crate::metrics::job_transition(job.stage.as_str(), status.as_str());
        Ok(job.clone())
    }

    pub async fn get(&self, job_id: Uuid) -> Option<Job> {
        self.state.lock().await.jobs.get(&job_id).cloned()
    }

    pub async fn get_by_key(&self, job_key: &str) -> Option<Job> {
        let guard = self.state.lock().await;
        guard
            .by_key
            .get(job_key)
            .and_then(|id| guard.jobs.get(id))
            .cloned()
    }

    pub async fn list_by_status(&self, status: JobStatus) -> Vec<Job> {
        self.collect(|job| job.status == status).await
    }

    pub async fn list_by_stage(&self, stage: JobStage) -> Vec<Job> {
        self.collect(|job| job.stage == stage).await
    }

    pub async fn list_children(&self, parent: Uuid) -> Vec<Job> {
        self.collect(|job| job.parent_job_id == Some(parent)).await
    }

    pub async fn list_all(&self) -> Vec<Job> {
        self.collect(|_| true).await
    }

    async fn collect(&self, keep: impl Fn(&Job) -> bool) -> Vec<Job> {
        let guard = self.state.lock().await;
        guard
            .order
            .iter()
            .filter_map(|id| guard.jobs.get(id))
            .filter(|job| keep(job))
            .cloned()
            .collect()
    }
}

/// Percent-encoded normalized unit. The fragment never contains `:`, so
/// distinct units never share a key series.
fn key_fragment(unit: &str) -> String {
    urlencoding::encode(&normalize_keyword(unit)).into_owned()
}
