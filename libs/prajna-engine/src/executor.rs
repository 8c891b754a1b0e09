/// Single-Run Executor - one request in, one outcome out
///
/// **Responsibility:**
/// Turn an [`ExecutionRequest`] into exactly one [`ExecutionOutcome`]:
/// materialize a private workspace, build if the language needs it, run
/// under the configured limits and classify what came back.
///
/// **Guarantees:**
/// - Never returns an error and never unwinds: faults become Internal-Error
///   or System-Error outcomes
/// - The workspace is removed on every path (it is dropped, not deleted
///   explicitly), and each backend call tears its own context down
/// - A failed build never reaches the run phase
///
/// The backend is injected once at startup and shared by every run.

use crate::backend::{BackendError, Capabilities, IsolationBackend, Limits, RunOutput, RunSpec};
use crate::compile::{self, looks_like_compiler_error, shell_join, CompileResult};
use crate::language::{LanguageConfig, LanguageConfigManager, RunFiles};
use crate::workspace::Workspace;
use futures_util::FutureExt;
use prajna_common::config::{CompileMode, Config};
use prajna_common::types::{ExecutionOutcome, ExecutionRequest, StatusCode};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

pub const MAX_SOURCE_BYTES: usize = 1024 * 1024;
pub const MAX_STDIN_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Parent of every per-run workspace.
    pub work_root: PathBuf,
    /// Run-phase limits; languages may override memory and CPU.
    pub limits: Limits,
    pub compile_time_limit: Duration,
    pub compile_mode: CompileMode,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            work_root: config.work_root.clone(),
            limits: Limits {
                wall_clock: config.time_limit(),
                memory_mb: config.memory_limit_mb,
                cpu: config.cpu_limit,
            },
            compile_time_limit: config.compile_time_limit(),
            compile_mode: config.compile_mode,
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct Executor {
    backend: Arc<dyn IsolationBackend>,
    languages: LanguageConfigManager,
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(
        backend: Arc<dyn IsolationBackend>,
        languages: LanguageConfigManager,
        settings: ExecutorSettings,
    ) -> Self {
        let capabilities = backend.capabilities();
        if !capabilities.native_memory_limit {
            warn!(backend = backend.name(), "Memory limit is soft: enforced by sampling, not by the kernel");
        }
        if !capabilities.network_isolation {
            warn!(backend = backend.name(), "Network is NOT isolated for executed code");
        }
        info!(
            backend = backend.name(),
            languages = ?languages.list_languages(),
            compile_mode = ?settings.compile_mode,
            "Executor ready"
        );
        Self {
            backend,
            languages,
            settings,
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// What the injected backend enforces natively.
    pub fn capabilities(&self) -> Capabilities {
        self.backend.capabilities()
    }

    /// Execute `request` once. Always yields an outcome.
    #[instrument(skip_all, fields(language = %request.language))]
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionOutcome {
        let outcome = match AssertUnwindSafe(self.try_execute(request))
            .catch_unwind()
            .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) if e.is_infrastructure() => {
                error!(error = %e, "Execution infrastructure fault");
                ExecutionOutcome::internal_error(e.to_string())
            }
            Ok(Err(e)) => {
                error!(error = %e, "Execution failed unexpectedly");
                ExecutionOutcome::system_error(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "Execution panicked");
                ExecutionOutcome::system_error(message)
            }
        };

        debug!(status = ?outcome.status, elapsed_ms = ?outcome.elapsed_ms, "Execution finished");
        outcome
    }

    async fn try_execute(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionOutcome, BackendError> {
        if request.code.len() > MAX_SOURCE_BYTES {
            return Ok(ExecutionOutcome::internal_error(format!(
                "Source exceeds {} bytes",
                MAX_SOURCE_BYTES
            )));
        }
        if request.stdin.len() > MAX_STDIN_BYTES {
            return Ok(ExecutionOutcome::internal_error(format!(
                "Input exceeds {} bytes",
                MAX_STDIN_BYTES
            )));
        }

        let config = match self.languages.get_config(&request.language) {
            Ok(config) => config,
            Err(e) => return Ok(ExecutionOutcome::internal_error(e.to_string())),
        };

        // Dropped at the end of this function, on every path
        let workspace = Workspace::create(&self.settings.work_root)
            .map_err(|e| BackendError::Setup(format!("failed to create workspace: {}", e)))?;

        let source_name = workspace.file_name(&config.source_extension);
        let stdin_name = workspace.file_name("in");
        workspace
            .write(&source_name, &request.code)
            .and_then(|_| workspace.write(&stdin_name, &request.stdin))
            .map_err(|e| BackendError::Setup(format!("failed to write workspace files: {}", e)))?;

        let mount = self.backend.mount_point(workspace.path());
        // A pipelined build shares the run's read-only context, so its
        // artifact goes to the backend's scratch space instead
        let binary_dir = match self.settings.compile_mode {
            CompileMode::TwoPhase => mount.clone(),
            CompileMode::Pipeline => self.backend.scratch_dir(workspace.path()),
        };
        let files = RunFiles {
            source: mount.join(&source_name).display().to_string(),
            binary: binary_dir.join(workspace.file_name("out")).display().to_string(),
        };
        let limits = self.limits_for(config);

        debug!(run_id = workspace.id(), "Workspace ready");

        let compile_argv = config.compile_command(&files);
        let run_argv = config.run_command(&files);

        let base = RunSpec {
            image: config.image.clone(),
            workspace: workspace.path().to_path_buf(),
            writable: false,
            argv: run_argv.clone(),
            stdin_file: Some(stdin_name),
            limits,
        };

        let (spec, pipeline) = match (compile_argv, self.settings.compile_mode) {
            (None, _) => (base, false),
            (Some(compile_argv), CompileMode::TwoPhase) => {
                let build = RunSpec {
                    writable: true,
                    argv: compile_argv,
                    stdin_file: None,
                    limits: Limits {
                        wall_clock: self.settings.compile_time_limit,
                        ..limits
                    },
                    ..base.clone()
                };
                if let CompileResult::Failed { diagnostic } =
                    compile::compile(self.backend.as_ref(), &build).await?
                {
                    return Ok(ExecutionOutcome::failure(
                        StatusCode::CompilationError,
                        diagnostic,
                    ));
                }
                (base, false)
            }
            (Some(compile_argv), CompileMode::Pipeline) => {
                let script = format!("{} && {}", shell_join(&compile_argv), shell_join(&run_argv));
                let spec = RunSpec {
                    argv: vec!["/bin/sh".to_string(), "-c".to_string(), script],
                    ..base
                };
                (spec, true)
            }
        };

        let output = self.backend.run(&spec).await?;
        Ok(classify(output, &limits, pipeline))
    }

    fn limits_for(&self, config: &LanguageConfig) -> Limits {
        Limits {
            memory_mb: config.memory_limit_mb.unwrap_or(self.settings.limits.memory_mb),
            cpu: config.cpu_limit.unwrap_or(self.settings.limits.cpu),
            ..self.settings.limits
        }
    }
}

/// Map raw backend output to a run status.
///
/// Order matters: a killed process also exits non-zero, so the limit flags
/// are checked before the exit code.
fn classify(output: RunOutput, limits: &Limits, pipeline: bool) -> ExecutionOutcome {
    let elapsed_ms = output.elapsed_ms();

    if output.timed_out {
        warn!(elapsed_ms, "Time limit exceeded");
        return ExecutionOutcome::time_limit_exceeded().with_elapsed(elapsed_ms);
    }

    if output.memory_exceeded {
        warn!(memory_limit_mb = limits.memory_mb, "Memory limit exceeded");
        return ExecutionOutcome::memory_limit_exceeded(limits.memory_mb)
            .with_exit_code(output.exit_code)
            .with_elapsed(elapsed_ms);
    }

    match output.exit_code {
        Some(0) => ExecutionOutcome::success(output.stdout, elapsed_ms),
        Some(code) if pipeline && looks_like_compiler_error(&output.combined()) => {
            ExecutionOutcome::failure(StatusCode::CompilationError, output.combined())
                .with_exit_code(Some(code))
        }
        Some(code) => {
            let diagnostic = if output.stderr.trim().is_empty() {
                format!("Process exited with code {}", code)
            } else {
                output.stderr
            };
            ExecutionOutcome {
                status: StatusCode::RuntimeError,
                stdout: output.stdout,
                diagnostic: Some(diagnostic),
                elapsed_ms: Some(elapsed_ms),
                exit_code: Some(code),
            }
        }
        None => ExecutionOutcome::system_error("execution ended without an exit code"),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
