//! Where job state transitions are reported.
//!
//! The store owns job state; the runner only asks it to advance. A store
//! must refuse any transition that would move a job backwards and report
//! the refusal as `Ok(false)`.

use async_trait::async_trait;
use prajna_common::types::{JobRecord, JobState};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("submission store unavailable: {0}")]
    Unavailable(String),
    #[error("failed to encode job state: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Advance `job_id` to `state`. `Ok(false)` when refused as a regression.
    async fn transition(&self, job_id: Uuid, state: JobState) -> Result<bool, StoreError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError>;
}

/// Process-local store, for single-process embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<Uuid, JobRecord>>,
    history: Mutex<Vec<(Uuid, JobState)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every accepted transition of `job_id`, oldest first.
    pub fn history(&self, job_id: Uuid) -> Vec<JobState> {
        self.history
            .lock()
            .map(|history| {
                history
                    .iter()
                    .filter(|(id, _)| *id == job_id)
                    .map(|(_, state)| state.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("store lock poisoned".to_string())
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn transition(&self, job_id: Uuid, state: JobState) -> Result<bool, StoreError> {
        let mut records = self.records.lock().map_err(poisoned)?;

        if let Some(current) = records.get(&job_id) {
            if !current.state.can_advance_to(&state) {
                return Ok(false);
            }
        }

        records.insert(job_id, JobRecord::new(job_id, state.clone()));
        self.history.lock().map_err(poisoned)?.push((job_id, state));
        Ok(true)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.records.lock().map_err(poisoned)?.get(&job_id).cloned())
    }
}
