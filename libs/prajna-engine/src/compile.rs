//! Build phase for compiled languages.
//!
//! Runs the toolchain once in its own execution context, under the same
//! isolation as the program itself. A failed build ends the request with a
//! Compilation-Error; the run phase is never started.

use crate::backend::{BackendError, IsolationBackend, RunOutput, RunSpec};
use tracing::{info, warn};

/// Markers that identify compiler output when the build and the run share
/// one command and only the exit code is left to go by.
const COMPILER_MARKERS: &[&str] = &[
    "error:",
    "compilation terminated",
    "ld returned",
    "undefined reference",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileResult {
    Built,
    Failed { diagnostic: String },
}

impl CompileResult {
    fn from_output(output: &RunOutput) -> Self {
        if output.timed_out {
            return CompileResult::Failed {
                diagnostic: "Compilation exceeded time limit.".to_string(),
            };
        }
        if output.memory_exceeded {
            return CompileResult::Failed {
                diagnostic: "Compilation exceeded memory limit.".to_string(),
            };
        }
        match output.exit_code {
            Some(0) => CompileResult::Built,
            code => {
                let mut diagnostic = output.combined();
                if diagnostic.trim().is_empty() {
                    diagnostic = format!("Compiler exited with status {:?}", code);
                }
                CompileResult::Failed { diagnostic }
            }
        }
    }
}

/// Run the build command described by `spec`.
///
/// Only a backend fault is an `Err`; a broken program is `Ok(Failed)`.
pub async fn compile(
    backend: &dyn IsolationBackend,
    spec: &RunSpec,
) -> Result<CompileResult, BackendError> {
    let output = backend.run(spec).await?;
    let result = CompileResult::from_output(&output);

    match &result {
        CompileResult::Built => info!(
            compilation_time_ms = output.elapsed_ms(),
            "Compilation succeeded"
        ),
        CompileResult::Failed { diagnostic } => warn!(
            compilation_time_ms = output.elapsed_ms(),
            error_preview = diagnostic.lines().next().unwrap_or(""),
            "Compilation failed"
        ),
    }

    Ok(result)
}

/// Exit-code heuristic for single-command `compile && run` pipelines.
///
/// Fragile by nature: a program that prints `error:` and exits non-zero is
/// indistinguishable from a failed build.
pub fn looks_like_compiler_error(output: &str) -> bool {
    let lowered = output.to_lowercase();
    COMPILER_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Quote `argv` for `/bin/sh -c`.
pub fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| format!("'{}'", arg.replace('\'', r"'\''")))
        .collect::<Vec<_>>()
        .join(" ")
}
