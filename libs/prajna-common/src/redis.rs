use crate::types::{ExecutionOutcome, ExecutionRequest, Job, JobRecord, JobState, RunRequest};
use redis::{AsyncCommands, RedisResult};
use std::time::Duration;
use uuid::Uuid;

/// Redis queue semantics shared by intake, worker and CLI.
/// Keys are deterministic so every side agrees on where jobs, states and
/// ad-hoc replies live.

pub const QUEUE_PREFIX: &str = "prajna:queue";
pub const STATE_PREFIX: &str = "prajna:state";
pub const RECORD_PREFIX: &str = "prajna:record";
pub const REPLY_PREFIX: &str = "prajna:reply";

/// Atomically advance a job state, refusing any regression.
///
/// KEYS[1] = state key, KEYS[2] = record key
/// ARGV[1] = new state label, ARGV[2] = record JSON, ARGV[3] = ttl seconds
const TRANSITION_SCRIPT: &str = r#"
local rank = { pending = 0, running = 1, terminal = 2 }
local current = redis.call('GET', KEYS[1])
if current and rank[current] ~= nil and rank[current] >= rank[ARGV[1]] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[3])
redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[3])
return 1
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    /// Persisted judge jobs.
    Judge,
    /// Ad-hoc single runs.
    Run,
}

impl Queue {
    pub fn name(&self) -> String {
        match self {
            Queue::Judge => format!("{}:judge", QUEUE_PREFIX),
            Queue::Run => format!("{}:run", QUEUE_PREFIX),
        }
    }
}

/// Work item popped by a worker.
#[derive(Debug, Clone)]
pub enum Work {
    Judge(Job),
    Run(RunRequest),
}

pub fn state_key(job_id: &Uuid) -> String {
    format!("{}:{}", STATE_PREFIX, job_id)
}

pub fn record_key(job_id: &Uuid) -> String {
    format!("{}:{}", RECORD_PREFIX, job_id)
}

pub fn reply_key(run_id: &Uuid) -> String {
    format!("{}:{}", REPLY_PREFIX, run_id)
}

fn serialization_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
}

fn deserialization_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "deserialization error", e.to_string()))
}

/// Apply a state transition. Returns `false` when it would move the job backwards.
pub async fn transition(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &Uuid,
    state: &JobState,
    ttl_secs: u64,
) -> RedisResult<bool> {
    let record = JobRecord::new(*job_id, state.clone());
    let payload = serde_json::to_string(&record).map_err(serialization_error)?;

    let applied: i32 = redis::Script::new(TRANSITION_SCRIPT)
        .key(state_key(job_id))
        .key(record_key(job_id))
        .arg(state.label())
        .arg(payload)
        .arg(ttl_secs)
        .invoke_async(conn)
        .await?;

    Ok(applied == 1)
}

/// Fetch the latest persisted record for a job.
pub async fn get_record(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &Uuid,
) -> RedisResult<Option<JobRecord>> {
    let payload: Option<String> = conn.get(record_key(job_id)).await?;

    match payload {
        Some(data) => {
            let record: JobRecord = serde_json::from_str(&data).map_err(deserialization_error)?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

/// Record a job as Pending and push it onto the judge queue.
/// Uses RPUSH for FIFO semantics.
pub async fn enqueue_job(
    conn: &mut redis::aio::ConnectionManager,
    job: &Job,
    ttl_secs: u64,
) -> RedisResult<()> {
    transition(conn, &job.id, &JobState::Pending, ttl_secs).await?;

    let payload = serde_json::to_string(job).map_err(serialization_error)?;
    conn.rpush(Queue::Judge.name(), payload).await
}

/// Pop the next judge job or ad-hoc run, whichever arrives first.
/// BLPOP with a timeout so the caller can notice shutdown.
pub async fn pop_work(
    conn: &mut redis::aio::ConnectionManager,
    timeout_seconds: f64,
) -> RedisResult<Option<Work>> {
    let queues = [Queue::Judge.name(), Queue::Run.name()];
    let result: Option<(String, String)> = conn.blpop(&queues[..], timeout_seconds).await?;

    match result {
        Some((key, payload)) if key == queues[0] => {
            let job: Job = serde_json::from_str(&payload).map_err(deserialization_error)?;
            Ok(Some(Work::Judge(job)))
        }
        Some((_key, payload)) => {
            let run: RunRequest = serde_json::from_str(&payload).map_err(deserialization_error)?;
            Ok(Some(Work::Run(run)))
        }
        None => Ok(None),
    }
}

/// Deliver the outcome of an ad-hoc run to the waiting caller.
pub async fn push_reply(
    conn: &mut redis::aio::ConnectionManager,
    run_id: &Uuid,
    outcome: &ExecutionOutcome,
    ttl_secs: u64,
) -> RedisResult<()> {
    let key = reply_key(run_id);
    let payload = serde_json::to_string(outcome).map_err(serialization_error)?;

    let _: () = conn.rpush(&key, payload).await?;
    // Nobody may be listening any more; don't let the reply linger.
    let _: () = redis::cmd("EXPIRE")
        .arg(&key)
        .arg(ttl_secs)
        .query_async(conn)
        .await?;
    Ok(())
}

/// Caller side of an ad-hoc run: enqueue and wait for the reply.
///
/// When `wait` elapses first the run is reported as Time-Limit-Exceeded,
/// even though the worker may still finish it later.
pub async fn request_run(
    conn: &mut redis::aio::ConnectionManager,
    request: ExecutionRequest,
    wait: Duration,
) -> RedisResult<ExecutionOutcome> {
    let run = RunRequest {
        id: Uuid::new_v4(),
        request,
    };
    let payload = serde_json::to_string(&run).map_err(serialization_error)?;
    let _: () = conn.rpush(Queue::Run.name(), payload).await?;

    let reply: Option<(String, String)> = conn
        .blpop(reply_key(&run.id), wait.as_secs_f64())
        .await?;

    match reply {
        Some((_key, data)) => serde_json::from_str(&data).map_err(deserialization_error),
        None => {
            tracing::warn!(run_id = %run.id, wait_ms = wait.as_millis() as u64, "No reply before caller timeout");
            Ok(ExecutionOutcome::time_limit_exceeded())
        }
    }
}
