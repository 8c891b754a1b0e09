//! Scripted backend for unit tests.

use super::{BackendError, Capabilities, IsolationBackend, RunOutput, RunSpec};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Scratch directory reported for every context.
pub const SCRATCH_DIR: &str = "/scratch";

type Script = dyn Fn(&RunSpec, &str) -> Result<RunOutput, BackendError> + Send + Sync;

/// Answers every run through `script`, which sees the spec and the stdin
/// file's contents.
pub struct FakeBackend {
    script: Box<Script>,
    delay: Option<Duration>,
    calls: Mutex<Vec<RunSpec>>,
}

impl FakeBackend {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&RunSpec, &str) -> Result<RunOutput, BackendError> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Echo stdin back as stdout with exit 0.
    pub fn echo() -> Self {
        Self::new(|_, stdin| Ok(RunOutput::exited(0, stdin, "")))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RunSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Commands that ran with a read-only workspace.
    pub fn run_calls(&self) -> usize {
        self.calls().iter().filter(|spec| !spec.writable).count()
    }
}

impl RunOutput {
    pub fn exited(code: i64, stdout: &str, stderr: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code: Some(code),
            elapsed: Duration::from_millis(5),
            ..Default::default()
        }
    }
}

#[async_trait]
impl IsolationBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_memory_limit: true,
            network_isolation: true,
        }
    }

    fn mount_point(&self, workspace: &Path) -> PathBuf {
        workspace.to_path_buf()
    }

    fn scratch_dir(&self, _workspace: &Path) -> PathBuf {
        PathBuf::from(SCRATCH_DIR)
    }

    async fn run(&self, spec: &RunSpec) -> Result<RunOutput, BackendError> {
        self.calls.lock().unwrap().push(spec.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let stdin = match &spec.stdin_file {
            Some(name) => std::fs::read_to_string(spec.workspace.join(name)).unwrap_or_default(),
            None => String::new(),
        };
        (self.script)(spec, &stdin)
    }
}
