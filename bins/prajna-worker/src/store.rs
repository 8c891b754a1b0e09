// Redis-backed submission store
use async_trait::async_trait;
use prajna_common::redis as queue;
use prajna_common::types::{JobRecord, JobState};
use prajna_engine::store::{StoreError, SubmissionStore};
use redis::aio::ConnectionManager;
use uuid::Uuid;

/// Job state lives under `prajna:state:<id>` / `prajna:record:<id>`,
/// advanced through the monotonic transition script.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    ttl_secs: u64,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager, ttl_secs: u64) -> Self {
        Self { conn, ttl_secs }
    }
}

fn unavailable(e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

#[async_trait]
impl SubmissionStore for RedisStore {
    async fn transition(&self, job_id: Uuid, state: JobState) -> Result<bool, StoreError> {
        // ConnectionManager is a cheap multiplexed handle
        let mut conn = self.conn.clone();
        queue::transition(&mut conn, &job_id, &state, self.ttl_secs)
            .await
            .map_err(unavailable)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        let mut conn = self.conn.clone();
        queue::get_record(&mut conn, &job_id).await.map_err(unavailable)
    }
}
