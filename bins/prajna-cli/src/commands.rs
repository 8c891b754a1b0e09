// CLI commands for running and judging submissions
use crate::{LocalArgs, SourceArgs};
use anyhow::{bail, Context, Result};
use prajna_common::config::Config;
use prajna_common::redis as queue;
use prajna_common::types::{ExecutionOutcome, ExecutionRequest, Job, JobState, JudgeVerdict, Language};
use prajna_engine::{backend, Executor, ExecutorSettings, Judge, LanguageConfigManager, ProblemStore};
use redis::aio::ConnectionManager;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Language from the flag, else from the file extension.
fn resolve_language(source: &SourceArgs) -> Result<Language> {
    if let Some(language) = source.language {
        return Ok(language);
    }

    let ext = source
        .file
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();

    match ext {
        "cpp" | "cc" | "cxx" => Ok(Language::Cpp),
        "py" => Ok(Language::Python),
        _ => bail!(
            "Cannot infer language of {}; pass --language",
            source.file.display()
        ),
    }
}

fn read_source(source: &SourceArgs) -> Result<(String, Language)> {
    let code = fs::read_to_string(&source.file)
        .with_context(|| format!("Failed to read {}", source.file.display()))?;
    Ok((code, resolve_language(source)?))
}

fn read_stdin(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read stdin file {}", path.display())),
        None => Ok(String::new()),
    }
}

fn local_config(local: &LocalArgs) -> Result<Config> {
    let mut config = Config::from_env().context("Invalid PRAJNA_* configuration")?;

    if let Some(backend) = local.backend {
        config.backend = backend;
    }
    if let Some(time_limit_ms) = local.time_limit_ms {
        config.time_limit_ms = time_limit_ms;
    }
    if let Some(memory_limit_mb) = local.memory_limit_mb {
        config.memory_limit_mb = memory_limit_mb;
    }

    config.validated()
}

async fn local_executor(config: &Config) -> Result<Arc<Executor>> {
    let languages = LanguageConfigManager::load_or_builtin(&config.languages_path)?;
    let backend = backend::from_config(config)
        .await
        .with_context(|| format!("Failed to initialize {:?} isolation backend", config.backend))?;

    let executor = Executor::new(backend, languages, ExecutorSettings::from_config(config));
    if !executor.capabilities().native_memory_limit {
        eprintln!("⚠️  The {} backend enforces memory by sampling; short spikes may slip through", executor.backend_name());
    }
    Ok(Arc::new(executor))
}

async fn connect(config: &Config) -> Result<ConnectionManager> {
    let client = redis::Client::open(config.redis_url.as_str())?;
    ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))
}

fn print_outcome(outcome: &ExecutionOutcome) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(())
}

fn print_verdict(verdict: &JudgeVerdict) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(verdict)?);
    Ok(())
}

/// Execute once with a locally built backend
pub async fn run_local(source: &SourceArgs, stdin: Option<&Path>, local: &LocalArgs) -> Result<()> {
    let (code, language) = read_source(source)?;
    let config = local_config(local)?;
    let executor = local_executor(&config).await?;

    eprintln!("▶ Running {} on the {} backend", source.file.display(), executor.backend_name());

    let outcome = executor
        .execute(&ExecutionRequest::new(code, language, read_stdin(stdin)?))
        .await;
    print_outcome(&outcome)
}

/// Judge against a problem directory with a locally built backend
pub async fn judge_local(
    source: &SourceArgs,
    problem_id: &str,
    problems_root: Option<PathBuf>,
    local: &LocalArgs,
) -> Result<()> {
    let (code, language) = read_source(source)?;
    let config = local_config(local)?;
    let executor = local_executor(&config).await?;
    let problems = ProblemStore::new(problems_root.unwrap_or_else(|| config.problems_root.clone()));

    eprintln!("⚖️  Judging {} against '{}'", source.file.display(), problem_id);

    let judge = Judge::new(executor, problems);
    let verdict = judge.judge(&code, language, problem_id).await;

    eprintln!(
        "{} {} ({}/{} cases, {} ms)",
        if verdict.is_accepted() { "✅" } else { "❌" },
        verdict.verdict,
        verdict.passed_cases,
        verdict.total_cases,
        verdict.cumulative_time_ms
    );
    print_verdict(&verdict)
}

/// Queue a judge job for the workers
pub async fn submit(source: &SourceArgs, problem_id: &str) -> Result<()> {
    let (code, language) = read_source(source)?;
    ProblemStore::validate_id(problem_id)?;

    let config = Config::from_env()?;
    let mut conn = connect(&config).await?;

    let job = Job::new(code, language, problem_id);
    queue::enqueue_job(&mut conn, &job, config.result_ttl_secs).await?;

    eprintln!("📨 Job queued on {}", queue::Queue::Judge.name());
    println!("{}", job.id);
    Ok(())
}

/// Ad-hoc run through a worker with a caller-side deadline
pub async fn exec_remote(source: &SourceArgs, stdin: Option<&Path>, wait_ms: Option<u64>) -> Result<()> {
    let (code, language) = read_source(source)?;
    let config = Config::from_env()?;
    let wait = wait_ms.map(Duration::from_millis).unwrap_or_else(|| config.adhoc_wait());

    if wait < config.time_limit() {
        eprintln!(
            "⚠️  Waiting {} ms, less than the {} ms run limit: slow runs will read as TLE",
            wait.as_millis(),
            config.time_limit_ms
        );
    }

    let mut conn = connect(&config).await?;
    let request = ExecutionRequest::new(code, language, read_stdin(stdin)?);
    let outcome = queue::request_run(&mut conn, request, wait).await?;
    print_outcome(&outcome)
}

/// Print the latest recorded state of a job
pub async fn status(job_id: Uuid) -> Result<()> {
    let config = Config::from_env()?;
    let mut conn = connect(&config).await?;

    let Some(record) = queue::get_record(&mut conn, &job_id).await? else {
        bail!("No record for job {} (unknown or expired)", job_id);
    };

    match &record.state {
        JobState::Pending => eprintln!("⏳ pending"),
        JobState::Running => eprintln!("🔄 running"),
        JobState::Terminal(verdict) => eprintln!(
            "🏁 {} ({}/{} cases)",
            verdict.verdict, verdict.passed_cases, verdict.total_cases
        ),
    }
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
