// Queue intake: Redis lists into the job runner
use anyhow::Result;
use async_trait::async_trait;
use prajna_common::redis::{self as queue, Work};
use prajna_common::types::{ExecutionOutcome, RunRequest};
use prajna_engine::JobRunner;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

/// Ad-hoc replies nobody collected expire after this.
pub const REPLY_TTL_SECS: u64 = 60;

/// BLPOP timeout, so the intake loop wakes up regularly.
pub const POP_TIMEOUT_SECS: f64 = 5.0;

#[async_trait]
pub trait WorkSource: Send {
    /// Next item, or `None` when nothing arrived in time.
    async fn next(&mut self) -> Result<Option<Work>>;
}

#[async_trait]
pub trait ReplySink: Clone + Send + Sync + 'static {
    async fn deliver(&mut self, run_id: &Uuid, outcome: &ExecutionOutcome) -> Result<()>;
}

/// Blocking pops on a connection nothing else uses: Redis serves nothing
/// queued behind a BLPOP on the same socket until it returns.
pub struct RedisIntake {
    conn: ConnectionManager,
}

impl RedisIntake {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl WorkSource for RedisIntake {
    async fn next(&mut self) -> Result<Option<Work>> {
        Ok(queue::pop_work(&mut self.conn, POP_TIMEOUT_SECS).await?)
    }
}

#[derive(Clone)]
pub struct RedisReplies {
    conn: ConnectionManager,
}

impl RedisReplies {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ReplySink for RedisReplies {
    async fn deliver(&mut self, run_id: &Uuid, outcome: &ExecutionOutcome) -> Result<()> {
        Ok(queue::push_reply(&mut self.conn, run_id, outcome, REPLY_TTL_SECS).await?)
    }
}

/// Move work from `source` into the runner until `shutdown` flips.
///
/// Shutdown is only observed between pops: an item that has left the queue
/// is always handed to the runner first.
#[instrument(skip_all)]
pub async fn intake_loop<S, R>(
    source: &mut S,
    replies: R,
    runner: &JobRunner,
    mut shutdown: watch::Receiver<bool>,
) where
    S: WorkSource,
    R: ReplySink,
{
    loop {
        if *shutdown.borrow() {
            info!("Intake stopped");
            return;
        }

        match source.next().await {
            Ok(Some(Work::Judge(job))) => {
                let job_id = job.id;
                info!(
                    job_id = %job_id,
                    language = %job.language,
                    problem_id = %job.problem_id,
                    source_size = job.code.len(),
                    "Received job"
                );
                if let Err(e) = runner.submit(job).await {
                    error!(job_id = %job_id, error = %e, "Failed to queue job");
                }
            }
            Ok(Some(Work::Run(run))) => {
                debug!(run_id = %run.id, language = %run.request.language, "Received ad-hoc run");
                dispatch_run(runner, replies.clone(), run).await;
            }
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

/// Queue an ad-hoc run; its reply is delivered from a detached task so
/// intake never waits on execution.
async fn dispatch_run<R: ReplySink>(runner: &JobRunner, mut replies: R, run: RunRequest) {
    let RunRequest { id, request } = run;

    let outcome = match runner.dispatch_run(request).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(run_id = %id, error = %e, "Failed to queue ad-hoc run");
            return;
        }
    };

    tokio::spawn(async move {
        let outcome = outcome
            .await
            .unwrap_or_else(|_| ExecutionOutcome::system_error("worker dropped the run"));

        match replies.deliver(&id, &outcome).await {
            Ok(()) => debug!(run_id = %id, status = ?outcome.status, "Reply delivered"),
            Err(e) => error!(run_id = %id, error = %e, "Failed to deliver reply"),
        }
    });
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use prajna_common::types::{
        ExecutionRequest, Job, JobState, Language, StatusCode, VerdictCode,
    };
    use prajna_engine::language::{LanguageConfig, DEFAULT_IMAGE};
    use prajna_engine::{
        Executor, ExecutorSettings, Judge, LanguageConfigManager, MemoryStore, ProblemStore,
        ProcessBackend, SubmissionStore,
    };
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// Hands out queued items, then idles like a BLPOP on an empty list.
    struct QueuedSource {
        items: VecDeque<Work>,
        idle: Duration,
        pops: usize,
        stop_after_pop: Option<watch::Sender<bool>>,
    }

    impl QueuedSource {
        fn new(items: Vec<Work>, idle: Duration) -> Self {
            Self {
                items: items.into(),
                idle,
                pops: 0,
                stop_after_pop: None,
            }
        }
    }

    #[async_trait]
    impl WorkSource for QueuedSource {
        async fn next(&mut self) -> Result<Option<Work>> {
            self.pops += 1;
            match self.items.pop_front() {
                Some(work) => {
                    if let Some(stop) = &self.stop_after_pop {
                        stop.send(true).unwrap();
                    }
                    Ok(Some(work))
                }
                None => {
                    tokio::time::sleep(self.idle).await;
                    Ok(None)
                }
            }
        }
    }

    #[derive(Clone)]
    struct ChannelReplies(mpsc::UnboundedSender<(Uuid, ExecutionOutcome)>);

    #[async_trait]
    impl ReplySink for ChannelReplies {
        async fn deliver(&mut self, run_id: &Uuid, outcome: &ExecutionOutcome) -> Result<()> {
            self.0.send((*run_id, outcome.clone()))?;
            Ok(())
        }
    }

    fn runner(root: &Path, store: Arc<MemoryStore>) -> JobRunner {
        let languages = LanguageConfigManager::from_configs(vec![LanguageConfig {
            name: Language::Python,
            image: DEFAULT_IMAGE.to_string(),
            source_extension: "py".to_string(),
            compile: None,
            run: vec!["/bin/sh".to_string(), "{source}".to_string()],
            memory_limit_mb: None,
            cpu_limit: None,
        }])
        .unwrap();
        let settings = ExecutorSettings {
            work_root: root.join("work"),
            ..ExecutorSettings::default()
        };
        let executor = Arc::new(Executor::new(
            Arc::new(ProcessBackend::new(Duration::from_millis(10))),
            languages,
            settings,
        ));
        let judge = Arc::new(Judge::new(executor, ProblemStore::new(root.join("problems"))));
        JobRunner::start(judge, store, 2, 8)
    }

    #[tokio::test]
    async fn test_popped_job_is_submitted_before_stopping() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let runner = runner(root.path(), store.clone());
        let (stop, shutdown) = watch::channel(false);
        let (replies, _rx) = mpsc::unbounded_channel();

        let job = Job::new("echo 1", Language::Python, "missing");
        let job_id = job.id;
        let mut source = QueuedSource::new(vec![Work::Judge(job)], Duration::from_millis(10));
        // Shutdown lands while the item is in flight
        source.stop_after_pop = Some(stop);

        intake_loop(&mut source, ChannelReplies(replies), &runner, shutdown).await;
        runner.shutdown().await;

        assert_eq!(source.pops, 1);
        match store.get(job_id).await.unwrap().unwrap().state {
            JobState::Terminal(verdict) => assert_eq!(verdict.verdict, VerdictCode::InternalError),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reply_does_not_wait_for_idle_pop() {
        let root = tempfile::tempdir().unwrap();
        let runner = runner(root.path(), Arc::new(MemoryStore::new()));
        let (_stop, shutdown) = watch::channel(false);
        let (replies, mut rx) = mpsc::unbounded_channel();

        let run = RunRequest {
            id: Uuid::new_v4(),
            request: ExecutionRequest::new("echo hi", Language::Python, ""),
        };
        let run_id = run.id;
        let mut source = QueuedSource::new(vec![Work::Run(run)], Duration::from_secs(30));

        tokio::select! {
            _ = intake_loop(&mut source, ChannelReplies(replies), &runner, shutdown) => {
                panic!("intake returned without shutdown");
            }
            delivered = tokio::time::timeout(Duration::from_secs(3), rx.recv()) => {
                let (id, outcome) = delivered.expect("reply held back by idle pop").unwrap();
                assert_eq!(id, run_id);
                assert_eq!(outcome.status, StatusCode::Success);
                assert_eq!(outcome.stdout, "hi\n");
            }
        }
    }
}
