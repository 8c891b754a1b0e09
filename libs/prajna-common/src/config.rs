// Process-wide configuration, read once from the environment at startup.
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Which isolation strategy a deployment runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// One disposable container per command, native cgroup limits.
    Docker,
    /// Plain child processes with a polling memory monitor.
    Process,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(BackendKind::Docker),
            "process" => Ok(BackendKind::Process),
            other => bail!("unknown backend '{}' (expected docker or process)", other),
        }
    }
}

/// How compiled languages are built before running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileMode {
    /// Build and run as two separate isolated commands.
    TwoPhase,
    /// One `compile && run` shell pipeline; compile errors are recognized
    /// from the exit code and diagnostic text.
    Pipeline,
}

impl FromStr for CompileMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "two_phase" | "two-phase" => Ok(CompileMode::TwoPhase),
            "pipeline" => Ok(CompileMode::Pipeline),
            other => bail!("unknown compile mode '{}' (expected two_phase or pipeline)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub backend: BackendKind,
    pub work_root: PathBuf,
    /// Host-side path of `work_root`, for bind mounts when the worker is itself containerized.
    pub host_work_root: Option<PathBuf>,
    pub problems_root: PathBuf,
    pub languages_path: PathBuf,
    pub workers: usize,
    pub queue_capacity: usize,
    pub time_limit_ms: u64,
    pub compile_time_limit_ms: u64,
    pub memory_limit_mb: u64,
    pub cpu_limit: f64,
    pub adhoc_wait_ms: u64,
    pub monitor_interval_ms: u64,
    pub compile_mode: CompileMode,
    pub pull_images: bool,
    pub result_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            backend: BackendKind::Docker,
            work_root: PathBuf::from("temp_codes"),
            host_work_root: None,
            problems_root: PathBuf::from("problems"),
            languages_path: PathBuf::from("config/languages.json"),
            workers: 4,
            queue_capacity: 64,
            time_limit_ms: 5000,
            compile_time_limit_ms: 10_000,
            memory_limit_mb: 256,
            cpu_limit: 0.5,
            adhoc_wait_ms: 6000,
            monitor_interval_ms: 10,
            compile_mode: CompileMode::TwoPhase,
            pull_images: false,
            result_ttl_secs: 86_400,
        }
    }
}

impl Config {
    /// Build the configuration from `REDIS_URL` and the `PRAJNA_*` variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            redis_url: env_or("REDIS_URL", defaults.redis_url)?,
            backend: env_or("PRAJNA_BACKEND", defaults.backend)?,
            work_root: env_or("PRAJNA_WORK_ROOT", defaults.work_root)?,
            host_work_root: env_opt("PRAJNA_HOST_WORK_ROOT")?,
            problems_root: env_or("PRAJNA_PROBLEMS_ROOT", defaults.problems_root)?,
            languages_path: env_or("PRAJNA_LANGUAGES", defaults.languages_path)?,
            workers: env_or("PRAJNA_WORKERS", defaults.workers)?,
            queue_capacity: env_or("PRAJNA_QUEUE_CAPACITY", defaults.queue_capacity)?,
            time_limit_ms: env_or("PRAJNA_TIME_LIMIT_MS", defaults.time_limit_ms)?,
            compile_time_limit_ms: env_or(
                "PRAJNA_COMPILE_TIME_LIMIT_MS",
                defaults.compile_time_limit_ms,
            )?,
            memory_limit_mb: env_or("PRAJNA_MEMORY_LIMIT_MB", defaults.memory_limit_mb)?,
            cpu_limit: env_or("PRAJNA_CPU_LIMIT", defaults.cpu_limit)?,
            adhoc_wait_ms: env_or("PRAJNA_ADHOC_WAIT_MS", defaults.adhoc_wait_ms)?,
            monitor_interval_ms: env_or(
                "PRAJNA_MONITOR_INTERVAL_MS",
                defaults.monitor_interval_ms,
            )?,
            compile_mode: env_or("PRAJNA_COMPILE_MODE", defaults.compile_mode)?,
            pull_images: env_or("PRAJNA_PULL_IMAGES", defaults.pull_images)?,
            result_ttl_secs: env_or("PRAJNA_RESULT_TTL_SECS", defaults.result_ttl_secs)?,
        };

        config.validated()
    }

    /// Reject nonsensical limits and keep the caller-side wait at or above
    /// the backend's own ceiling.
    pub fn validated(mut self) -> Result<Self> {
        if self.workers == 0 {
            bail!("PRAJNA_WORKERS must be at least 1");
        }
        if self.queue_capacity == 0 {
            bail!("PRAJNA_QUEUE_CAPACITY must be at least 1");
        }
        if self.time_limit_ms == 0 || self.memory_limit_mb == 0 {
            bail!("time and memory limits must be positive");
        }
        if !(self.cpu_limit > 0.0) {
            bail!("PRAJNA_CPU_LIMIT must be positive");
        }
        if self.monitor_interval_ms == 0 {
            bail!("PRAJNA_MONITOR_INTERVAL_MS must be positive");
        }
        if self.adhoc_wait_ms < self.time_limit_ms {
            warn!(
                adhoc_wait_ms = self.adhoc_wait_ms,
                time_limit_ms = self.time_limit_ms,
                "Ad-hoc wait shorter than the run time limit, raising it"
            );
            self.adhoc_wait_ms = self.time_limit_ms;
        }
        Ok(self)
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_millis(self.time_limit_ms)
    }

    pub fn compile_time_limit(&self) -> Duration {
        Duration::from_millis(self.compile_time_limit_ms)
    }

    pub fn adhoc_wait(&self) -> Duration {
        Duration::from_millis(self.adhoc_wait_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

fn env_opt<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        _ => Ok(None),
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(env_opt(key)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_judge_limits() {
        let config = Config::default();
        assert_eq!(config.time_limit(), Duration::from_secs(5));
        assert_eq!(config.memory_limit_mb, 256);
        assert_eq!(config.backend, BackendKind::Docker);
        assert_eq!(config.compile_mode, CompileMode::TwoPhase);
        assert!(config.adhoc_wait_ms >= config.time_limit_ms);
    }

    #[test]
    fn test_adhoc_wait_is_raised_to_time_limit() {
        let config = Config {
            adhoc_wait_ms: 1000,
            time_limit_ms: 5000,
            ..Config::default()
        }
        .validated()
        .unwrap();
        assert_eq!(config.adhoc_wait_ms, 5000);
    }

    #[test]
    fn test_rejects_zero_workers() {
        let config = Config {
            workers: 0,
            ..Config::default()
        };
        assert!(config.validated().is_err());
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("Process".parse::<BackendKind>().unwrap(), BackendKind::Process);
        assert!("podman".parse::<BackendKind>().is_err());
        assert_eq!("pipeline".parse::<CompileMode>().unwrap(), CompileMode::Pipeline);
        assert_eq!("two-phase".parse::<CompileMode>().unwrap(), CompileMode::TwoPhase);
    }
}
