/// Async Job Runner - bounded worker pool in front of the judge
///
/// **Responsibility:**
/// Accept judge jobs and ad-hoc runs without waiting for them, execute them
/// on a fixed number of workers, and report job state to the store.
///
/// **State contract:**
/// - Pending is recorded on submission
/// - Running is recorded before the first case starts
/// - Terminal is recorded exactly once, even when judging itself panics
///   (the judge runs in its own task and a failed join becomes IE)
///
/// Ad-hoc runs are not persisted. The caller waits on a reply channel with
/// its own deadline; a missed deadline is reported as Time-Limit-Exceeded
/// while the worker may still be finishing the run.

use crate::judge::Judge;
use crate::store::{StoreError, SubmissionStore};
use prajna_common::types::{ExecutionOutcome, ExecutionRequest, Job, JobState, JudgeVerdict};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, instrument, warn};

const TERMINAL_WRITE_ATTEMPTS: u32 = 3;
const TERMINAL_WRITE_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("job runner is shut down")]
    Closed,
    #[error(transparent)]
    Store(#[from] StoreError),
}

enum Task {
    Judge(Job),
    Run {
        request: ExecutionRequest,
        reply: oneshot::Sender<ExecutionOutcome>,
    },
}

pub struct JobRunner {
    sender: mpsc::Sender<Task>,
    store: Arc<dyn SubmissionStore>,
    workers: Vec<JoinHandle<()>>,
}

impl JobRunner {
    /// Spawn `workers` workers sharing one queue of `capacity` slots.
    pub fn start(
        judge: Arc<Judge>,
        store: Arc<dyn SubmissionStore>,
        workers: usize,
        capacity: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers.max(1))
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    receiver.clone(),
                    judge.clone(),
                    store.clone(),
                ))
            })
            .collect::<Vec<_>>();

        info!(workers = workers.len(), capacity, "Job runner started");

        Self {
            sender,
            store,
            workers,
        }
    }

    /// Record `job` as Pending and queue it. Waits only for a free queue slot.
    pub async fn submit(&self, job: Job) -> Result<(), RunnerError> {
        let job_id = job.id;
        if !self.store.transition(job_id, JobState::Pending).await? {
            // Intake already recorded it
            debug!(job_id = %job_id, "Job already pending");
        }

        self.sender
            .send(Task::Judge(job))
            .await
            .map_err(|_| RunnerError::Closed)?;

        debug!(job_id = %job_id, "Job queued");
        Ok(())
    }

    /// Queue an ad-hoc run and hand back the channel its outcome arrives on.
    pub async fn dispatch_run(
        &self,
        request: ExecutionRequest,
    ) -> Result<oneshot::Receiver<ExecutionOutcome>, RunnerError> {
        let (reply, outcome) = oneshot::channel();
        self.sender
            .send(Task::Run { request, reply })
            .await
            .map_err(|_| RunnerError::Closed)?;
        Ok(outcome)
    }

    /// Ad-hoc run with a caller-side deadline.
    pub async fn run(&self, request: ExecutionRequest, wait: Duration) -> ExecutionOutcome {
        let outcome = match self.dispatch_run(request).await {
            Ok(outcome) => outcome,
            Err(e) => return ExecutionOutcome::internal_error(e.to_string()),
        };

        match tokio::time::timeout(wait, outcome).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => ExecutionOutcome::system_error("worker dropped the run"),
            Err(_) => {
                warn!(wait_ms = wait.as_millis() as u64, "No result before caller deadline");
                ExecutionOutcome::time_limit_exceeded()
            }
        }
    }

    /// Stop accepting work, let queued and in-flight work finish, join the pool.
    pub async fn shutdown(self) {
        drop(self.sender);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker task failed");
            }
        }
        info!("Job runner stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Task>>>,
    judge: Arc<Judge>,
    store: Arc<dyn SubmissionStore>,
) {
    loop {
        // Lock is released before the task runs
        let task = receiver.lock().await.recv().await;
        let Some(task) = task else { break };

        match task {
            Task::Judge(job) => process_job(&judge, store.as_ref(), job).await,
            Task::Run { request, reply } => {
                let outcome = judge.executor().execute(&request).await;
                if reply.send(outcome).is_err() {
                    debug!(worker_id, "Ad-hoc caller stopped waiting");
                }
            }
        }
    }
    debug!(worker_id, "Worker exiting");
}

#[instrument(skip_all, fields(job_id = %job.id, problem_id = %job.problem_id))]
async fn process_job(judge: &Arc<Judge>, store: &dyn SubmissionStore, job: Job) {
    let job_id = job.id;

    match store.transition(job_id, JobState::Running).await {
        Ok(true) => {}
        Ok(false) => {
            warn!("Job is past Pending, skipping duplicate delivery");
            return;
        }
        // Judge anyway; the terminal write below may still land
        Err(e) => error!(error = %e, "Failed to record Running"),
    }

    let started = Instant::now();
    let task_judge = judge.clone();
    let handle = tokio::spawn(async move {
        task_judge
            .judge(&job.code, job.language, &job.problem_id)
            .await
    });
    let verdict = verdict_from_join(handle.await);

    info!(
        verdict = %verdict.verdict,
        passed_cases = verdict.passed_cases,
        total_cases = verdict.total_cases,
        cumulative_time_ms = verdict.cumulative_time_ms,
        judge_ms = started.elapsed().as_millis() as u64,
        "Job finished"
    );

    record_terminal(store, job_id, verdict).await;
}

fn verdict_from_join(result: Result<JudgeVerdict, JoinError>) -> JudgeVerdict {
    match result {
        Ok(verdict) => verdict,
        Err(e) => {
            error!(error = %e, "Judging task failed");
            JudgeVerdict::internal_error(format!("Judging task failed: {}", e))
        }
    }
}

async fn record_terminal(store: &dyn SubmissionStore, job_id: uuid::Uuid, verdict: JudgeVerdict) {
    let state = JobState::Terminal(verdict);

    for attempt in 1..=TERMINAL_WRITE_ATTEMPTS {
        match store.transition(job_id, state.clone()).await {
            Ok(true) => return,
            Ok(false) => {
                warn!(job_id = %job_id, "Job already terminal");
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, attempt, error = %e, "Failed to record verdict");
                if attempt < TERMINAL_WRITE_ATTEMPTS {
                    tokio::time::sleep(TERMINAL_WRITE_BACKOFF * attempt).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;
    use crate::executor::tests::fake_executor;
    use crate::problem::ProblemStore;
    use crate::store::MemoryStore;
    use prajna_common::types::{Language, StatusCode, VerdictCode};
    use std::fs;
    use std::path::Path;

    fn judge(root: &Path, backend: Arc<FakeBackend>) -> Arc<Judge> {
        let problems = root.join("problems").join("echo");
        fs::create_dir_all(&problems).unwrap();
        fs::write(problems.join("input_1.txt"), "hi").unwrap();
        fs::write(problems.join("output_1.txt"), "hi").unwrap();

        let executor = Arc::new(fake_executor(&root.join("work"), backend));
        Arc::new(Judge::new(executor, ProblemStore::new(root.join("problems"))))
    }

    #[tokio::test]
    async fn test_job_moves_pending_running_terminal() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let runner = JobRunner::start(judge(root.path(), Arc::new(FakeBackend::echo())), store.clone(), 2, 8);

        let job = Job::new("print(input())", Language::Python, "echo");
        let job_id = job.id;
        runner.submit(job).await.unwrap();
        runner.shutdown().await;

        let history = store.history(job_id);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0], JobState::Pending);
        assert_eq!(history[1], JobState::Running);
        match &history[2] {
            JobState::Terminal(verdict) => assert_eq!(verdict.verdict, VerdictCode::Accepted),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_problem_still_reaches_terminal() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let runner = JobRunner::start(judge(root.path(), Arc::new(FakeBackend::echo())), store.clone(), 1, 8);

        let job = Job::new("print(1)", Language::Python, "unknown");
        let job_id = job.id;
        runner.submit(job).await.unwrap();
        runner.shutdown().await;

        let record = store.get(job_id).await.unwrap().unwrap();
        match record.state {
            JobState::Terminal(verdict) => {
                assert_eq!(verdict.verdict, VerdictCode::InternalError);
                assert_eq!(verdict.total_cases, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::echo());
        let store = Arc::new(MemoryStore::new());
        let job = Job::new("print(input())", Language::Python, "echo");
        store.transition(job.id, JobState::Running).await.unwrap();

        let runner = JobRunner::start(judge(root.path(), backend.clone()), store.clone(), 1, 8);
        runner.submit(job).await.unwrap();
        runner.shutdown().await;

        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_adhoc_run_returns_outcome() {
        let root = tempfile::tempdir().unwrap();
        let runner = JobRunner::start(
            judge(root.path(), Arc::new(FakeBackend::echo())),
            Arc::new(MemoryStore::new()),
            1,
            8,
        );

        let outcome = runner
            .run(
                ExecutionRequest::new("print(input())", Language::Python, "ping\n"),
                Duration::from_secs(5),
            )
            .await;

        assert_eq!(outcome.status, StatusCode::Success);
        assert_eq!(outcome.stdout, "ping\n");
        runner.shutdown().await;
    }

    #[tokio::test]
    async fn test_adhoc_caller_deadline_is_tle() {
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::echo().with_delay(Duration::from_millis(500)));
        let runner = JobRunner::start(judge(root.path(), backend.clone()), Arc::new(MemoryStore::new()), 1, 8);

        let outcome = runner
            .run(
                ExecutionRequest::new("print(1)", Language::Python, ""),
                Duration::from_millis(50),
            )
            .await;

        assert_eq!(outcome.status, StatusCode::TimeLimitExceeded);
        // The worker still finishes the run
        runner.shutdown().await;
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_judging_task_becomes_internal_error() {
        let handle: JoinHandle<JudgeVerdict> = tokio::spawn(async { panic!("judge crashed") });
        let verdict = verdict_from_join(handle.await);

        assert_eq!(verdict.verdict, VerdictCode::InternalError);
        assert!(verdict.diagnostic.unwrap().contains("panic"));
    }
}
