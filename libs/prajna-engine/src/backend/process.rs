use super::{push_capped, BackendError, Capabilities, IsolationBackend, RunOutput, RunSpec};
use crate::monitor::MemoryMonitor;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How long output readers may lag behind a dead process.
const READER_GRACE: Duration = Duration::from_secs(1);

/// Plain child processes with a polling memory ceiling.
///
/// Fallback for hosts without Docker. The memory limit is soft (see
/// [`MemoryMonitor`]), CPU share is not enforced and the network is not
/// cut off; only the wall clock and the memory ceiling are.
pub struct ProcessBackend {
    monitor_interval: Duration,
}

impl ProcessBackend {
    pub fn new(monitor_interval: Duration) -> Self {
        Self { monitor_interval }
    }
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self::new(Duration::from_millis(10))
    }
}

/// Read a pipe to the end, keeping at most the capture ceiling.
async fn read_capped<R: AsyncRead + Unpin>(mut pipe: R) -> Vec<u8> {
    let mut captured = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => push_capped(&mut captured, &chunk[..n]),
        }
    }
    captured
}

async fn join_reader(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    match tokio::time::timeout(READER_GRACE, &mut reader).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader failed");
            String::new()
        }
        Err(_) => {
            // A detached grandchild still holds the pipe open
            reader.abort();
            String::new()
        }
    }
}

/// Kill the whole process group; an already-gone group is fine.
fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "Failed to kill process group"),
    }
}

#[async_trait]
impl IsolationBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_memory_limit: false,
            network_isolation: false,
        }
    }

    fn mount_point(&self, workspace: &Path) -> PathBuf {
        workspace.to_path_buf()
    }

    async fn run(&self, spec: &RunSpec) -> Result<RunOutput, BackendError> {
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| BackendError::Setup("empty command".to_string()))?;

        let stdin = match &spec.stdin_file {
            Some(name) => Stdio::from(std::fs::File::open(spec.workspace.join(name))?),
            None => Stdio::null(),
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&spec.workspace)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", &spec.workspace)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| BackendError::Setup(format!("failed to spawn '{}': {}", program, e)))?;
        let started = Instant::now();
        let pid = child.id();

        let stdout_reader = child.stdout.take().map(|pipe| tokio::spawn(read_capped(pipe)));
        let stderr_reader = child.stderr.take().map(|pipe| tokio::spawn(read_capped(pipe)));

        let monitor = MemoryMonitor::new(spec.limits.memory_mb, self.monitor_interval);
        let watched = tokio::time::timeout(spec.limits.wall_clock, monitor.watch(&mut child)).await;
        let elapsed = started.elapsed();

        // Leftover children of the program die with the group on every path
        kill_group(pid);

        let watch = match watched {
            Ok(watch) => watch?,
            Err(_) => {
                warn!(pid = ?pid, timeout_ms = spec.limits.wall_clock.as_millis() as u64, "Execution timed out, killing process");
                if let Err(e) = child.kill().await {
                    warn!(pid = ?pid, error = %e, "Failed to kill timed-out process");
                }
                join_reader(stdout_reader).await;
                join_reader(stderr_reader).await;

                return Ok(RunOutput {
                    elapsed,
                    timed_out: true,
                    ..Default::default()
                });
            }
        };

        let stdout = join_reader(stdout_reader).await;
        let stderr = join_reader(stderr_reader).await;

        // Mirror the shell convention for signal deaths: 128 + signal
        let exit_code = watch
            .status
            .code()
            .or_else(|| watch.status.signal().map(|sig| 128 + sig))
            .map(i64::from);

        debug!(pid = ?pid, exit_code = ?exit_code, peak_kb = watch.peak_kb, elapsed_ms = elapsed.as_millis() as u64, "Process exited");

        Ok(RunOutput {
            stdout,
            stderr,
            exit_code,
            elapsed,
            timed_out: false,
            memory_exceeded: watch.exceeded,
        })
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::backend::Limits;
    use tempfile::TempDir;

    fn sh(dir: &TempDir, script: &str, stdin: Option<&str>) -> RunSpec {
        if let Some(input) = stdin {
            std::fs::write(dir.path().join("case.in"), input).unwrap();
        }
        RunSpec {
            image: String::new(),
            workspace: dir.path().to_path_buf(),
            writable: false,
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            stdin_file: stdin.map(|_| "case.in".to_string()),
            limits: Limits {
                wall_clock: Duration::from_millis(1500),
                ..Limits::default()
            },
        }
    }

    /// Live and not a zombie, polled briefly so a just-killed process can settle.
    async fn still_running(pid: u32) -> bool {
        for _ in 0..50 {
            let alive = std::fs::read_to_string(format!("/proc/{}/stat", pid))
                .ok()
                .and_then(|stat| {
                    let rest = &stat[stat.rfind(')')? + 1..];
                    rest.split_whitespace().next().map(|state| state != "Z")
                })
                .unwrap_or(false);
            if !alive {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }

    #[tokio::test]
    async fn test_background_children_die_with_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::default();

        let output = backend.run(&sh(&dir, "sleep 30 & echo $!", None)).await.unwrap();

        assert_eq!(output.exit_code, Some(0));
        let pid: u32 = output.stdout.trim().parse().unwrap();
        assert!(!still_running(pid).await);
    }

    #[tokio::test]
    async fn test_background_children_die_on_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::default();

        let output = backend
            .run(&sh(&dir, "sleep 30 & echo $! > bg.pid; sleep 10", None))
            .await
            .unwrap();

        assert!(output.timed_out);
        let pid: u32 = std::fs::read_to_string(dir.path().join("bg.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(!still_running(pid).await);
    }

    #[tokio::test]
    async fn test_captures_stdout_from_stdin_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::default();

        let output = backend.run(&sh(&dir, "read n; echo $((n * 2))", Some("21\n"))).await.unwrap();

        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout, "42\n");
        assert!(!output.timed_out);
        assert!(!output.memory_exceeded);
    }

    #[tokio::test]
    async fn test_nonzero_exit_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::default();

        let output = backend.run(&sh(&dir, "echo boom >&2; exit 7", None)).await.unwrap();

        assert_eq!(output.exit_code, Some(7));
        assert_eq!(output.stderr, "boom\n");
    }

    #[tokio::test]
    async fn test_sleeping_process_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::default();

        let started = Instant::now();
        let output = backend.run(&sh(&dir, "echo early; sleep 10", None)).await.unwrap();

        assert!(output.timed_out);
        assert_eq!(output.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_signal_death_reports_128_plus_signal() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::default();

        let output = backend.run(&sh(&dir, "kill -SEGV $$", None)).await.unwrap();

        assert_eq!(output.exit_code, Some(139));
    }

    #[tokio::test]
    async fn test_environment_is_scrubbed() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::default();
        std::env::set_var("PRAJNA_SECRET_FOR_TEST", "leak");

        let output = backend
            .run(&sh(&dir, "echo \"[$PRAJNA_SECRET_FOR_TEST]\"", None))
            .await
            .unwrap();

        assert_eq!(output.stdout, "[]\n");
    }

    #[tokio::test]
    async fn test_missing_program_is_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::default();
        let mut spec = sh(&dir, "", None);
        spec.argv = vec!["/nonexistent/compiler".to_string()];

        let err = backend.run(&spec).await.unwrap_err();
        assert!(err.is_infrastructure());
    }
}
