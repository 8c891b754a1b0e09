/// Isolation Backend - one disposable execution context per command
///
/// **Core Responsibility:**
/// Run a single command against a per-run workspace under CPU, memory and
/// wall-clock caps with networking off, and hand back raw output.
///
/// **Boundary:**
/// - Backend knows HOW to isolate (containers, plain processes)
/// - Backend does NOT know about languages, compilers or verdicts
/// - Backend always tears its context down before returning
///
/// Two strategies implement the same trait and are picked per deployment:
/// [`DockerBackend`] (native cgroup limits) and [`ProcessBackend`]
/// (soft memory limit through [`crate::monitor::MemoryMonitor`]).

mod docker;
mod process;

#[cfg(test)]
pub(crate) mod fake;

pub use docker::DockerBackend;
pub use process::ProcessBackend;

use async_trait::async_trait;
use prajna_common::config::{BackendKind, Config};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Per-stream capture ceiling; anything beyond is discarded.
pub const MAX_OUTPUT_BYTES: usize = 8 * 1024 * 1024;

/// Resource caps applied to one execution context.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    pub wall_clock: Duration,
    pub memory_mb: u64,
    /// Fraction of one CPU.
    pub cpu: f64,
}

impl Limits {
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb as i64) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpu * 1_000_000_000.0) as i64
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            wall_clock: Duration::from_secs(5),
            memory_mb: 256,
            cpu: 0.5,
        }
    }
}

/// One command to run in a fresh execution context.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Container image; ignored by backends that don't use one.
    pub image: String,
    /// Host directory holding exactly the files this run needs.
    pub workspace: PathBuf,
    /// Only a standalone build step may write into the workspace.
    pub writable: bool,
    /// Command line, with paths already expressed via [`IsolationBackend::mount_point`].
    pub argv: Vec<String>,
    /// File inside the workspace fed to the command's stdin.
    pub stdin_file: Option<String>,
    pub limits: Limits,
}

/// Raw result of one command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub elapsed: Duration,
    pub timed_out: bool,
    pub memory_exceeded: bool,
}

impl RunOutput {
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }

    /// Stdout and stderr joined, the way a combined log would read.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("isolation backend unavailable: {0}")]
    Unavailable(String),
    #[error("execution image '{0}' not found. Did you build it?")]
    ImageMissing(String),
    #[error("failed to set up execution context: {0}")]
    Setup(String),
    #[error("execution context lost: {0}")]
    Lost(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

impl BackendError {
    /// Faults of the judging infrastructure itself rather than of the run.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            BackendError::Unavailable(_) | BackendError::ImageMissing(_) | BackendError::Setup(_)
        )
    }
}

/// What a backend can enforce natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub native_memory_limit: bool,
    pub network_isolation: bool,
}

#[async_trait]
pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Where `workspace` is visible to the executed command.
    fn mount_point(&self, workspace: &Path) -> PathBuf;

    /// Writable directory private to one execution context, for build
    /// artifacts of commands that must not write into the workspace.
    fn scratch_dir(&self, workspace: &Path) -> PathBuf {
        self.mount_point(workspace)
    }

    /// Run one command. The execution context is gone when this returns,
    /// whatever the result.
    async fn run(&self, spec: &RunSpec) -> Result<RunOutput, BackendError>;
}

/// Build the strategy the deployment selected. Done once at startup; the
/// result is shared by every run.
pub async fn from_config(config: &Config) -> Result<Arc<dyn IsolationBackend>, BackendError> {
    let backend: Arc<dyn IsolationBackend> = match config.backend {
        BackendKind::Docker => Arc::new(
            DockerBackend::connect(
                config.work_root.clone(),
                config.host_work_root.clone(),
                config.pull_images,
            )
            .await?,
        ),
        BackendKind::Process => Arc::new(ProcessBackend::new(config.monitor_interval())),
    };
    Ok(backend)
}

/// Append `chunk` to `buf` without growing past [`MAX_OUTPUT_BYTES`].
pub(crate) fn push_capped(buf: &mut Vec<u8>, chunk: &[u8]) {
    let room = MAX_OUTPUT_BYTES.saturating_sub(buf.len());
    buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_conversions() {
        let limits = Limits::default();
        assert_eq!(limits.memory_bytes(), 256 * 1024 * 1024);
        assert_eq!(limits.nano_cpus(), 500_000_000);
    }

    #[test]
    fn test_push_capped_stops_at_ceiling() {
        let mut buf = vec![0u8; MAX_OUTPUT_BYTES - 2];
        push_capped(&mut buf, b"abcdef");
        assert_eq!(buf.len(), MAX_OUTPUT_BYTES);
        push_capped(&mut buf, b"more");
        assert_eq!(buf.len(), MAX_OUTPUT_BYTES);
    }

    #[test]
    fn test_combined_output() {
        let output = RunOutput {
            stdout: "partial\n".to_string(),
            stderr: "Traceback".to_string(),
            ..Default::default()
        };
        assert_eq!(output.combined(), "partial\nTraceback");

        let quiet = RunOutput {
            stderr: "only err".to_string(),
            ..Default::default()
        };
        assert_eq!(quiet.combined(), "only err");
    }

    #[test]
    fn test_infrastructure_errors() {
        assert!(BackendError::ImageMissing("x".into()).is_infrastructure());
        assert!(BackendError::Unavailable("x".into()).is_infrastructure());
        assert!(!BackendError::Lost("x".into()).is_infrastructure());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "x");
        assert!(!BackendError::from(io).is_infrastructure());
    }
}
