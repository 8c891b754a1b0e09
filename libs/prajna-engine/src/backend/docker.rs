use super::{push_capped, BackendError, Capabilities, IsolationBackend, RunOutput, RunSpec};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Mount point of the run workspace inside every container.
const SANDBOX_DIR: &str = "/sandbox";

/// Per-container tmpfs; gone with the container.
const SCRATCH_DIR: &str = "/tmp";

/// Container cleanup guard - guarantees container removal
///
/// `release` removes the container and waits for it. If the guard is dropped
/// without being released (panic, cancelled future) removal is spawned
/// best-effort on the current runtime.
struct ContainerGuard<'a> {
    docker: &'a Docker,
    container_id: String,
    released: bool,
}

impl<'a> ContainerGuard<'a> {
    fn new(docker: &'a Docker, container_id: String) -> Self {
        Self {
            docker,
            container_id,
            released: false,
        }
    }

    async fn release(mut self) {
        self.released = true;
        remove_container(self.docker, &self.container_id).await;
    }
}

impl<'a> Drop for ContainerGuard<'a> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    remove_container(&docker, &container_id).await;
                });
            }
            Err(_) => warn!(container_id = %container_id, "No runtime to remove container, leaking it"),
        }
    }
}

async fn remove_container(docker: &Docker, container_id: &str) {
    let remove_options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };

    if let Err(e) = docker.remove_container(container_id, Some(remove_options)).await {
        warn!(container_id = %container_id, error = %e, "Failed to remove container");
    }
}

/// Docker-based isolation
///
/// **Container Rules:**
/// 1. Image must exist locally (pulled on miss only when allowed)
/// 2. Network disabled, `network_mode = none`
/// 3. Memory capped without swap, CPU capped via nano-CPUs, pids capped
/// 4. Read-only root filesystem with a private `/tmp`
/// 5. Workspace bind-mounted at `/sandbox`, read-only unless building;
///    pipelined builds write to the `/tmp` scratch tmpfs instead
/// 6. Container force-removed after every command
pub struct DockerBackend {
    docker: Docker,
    work_root: PathBuf,
    host_work_root: Option<PathBuf>,
    pull_images: bool,
}

impl DockerBackend {
    /// Connect to the local daemon and make sure it answers.
    ///
    /// `host_work_root` is the host-side path of `work_root` when this
    /// process itself runs inside a container sharing the daemon.
    pub async fn connect(
        work_root: PathBuf,
        host_work_root: Option<PathBuf>,
        pull_images: bool,
    ) -> Result<Self, BackendError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        docker
            .ping()
            .await
            .map_err(|e| BackendError::Unavailable(format!("Docker daemon not reachable: {}", e)))?;

        std::fs::create_dir_all(&work_root)?;
        let work_root = std::fs::canonicalize(&work_root)?;

        info!(work_root = %work_root.display(), pull_images, "Connected to Docker daemon");

        Ok(Self {
            docker,
            work_root,
            host_work_root,
            pull_images,
        })
    }

    /// Translate a workspace path to the path the daemon sees.
    fn host_dir(&self, dir: &Path) -> PathBuf {
        match (&self.host_work_root, dir.strip_prefix(&self.work_root)) {
            (Some(host_root), Ok(relative)) => host_root.join(relative),
            _ => dir.to_path_buf(),
        }
    }

    /// Ensure the image is available locally
    ///
    /// A miss is an infrastructure fault unless pulling was enabled.
    async fn ensure_image(&self, image: &str) -> Result<(), BackendError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        if !self.pull_images {
            return Err(BackendError::ImageMissing(image.to_string()));
        }

        warn!(image = %image, "Image cache miss, pulling now");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| BackendError::Setup(format!("failed to pull image '{}': {}", image, e)))?;
        }

        info!(image = %image, "Image pulled successfully");
        Ok(())
    }

    fn container_config(&self, spec: &RunSpec) -> Config<String> {
        let mode = if spec.writable { "rw" } else { "ro" };
        let bind = format!("{}:{}:{}", self.host_dir(&spec.workspace).display(), SANDBOX_DIR, mode);

        let mut tmpfs = HashMap::new();
        tmpfs.insert(SCRATCH_DIR.to_string(), "rw,exec,nosuid,size=64m".to_string());

        Config {
            image: Some(spec.image.clone()),
            cmd: Some(shell_command(&spec.argv, spec.stdin_file.as_deref())),
            entrypoint: Some(vec![]),
            working_dir: Some(SANDBOX_DIR.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                binds: Some(vec![bind]),
                network_mode: Some("none".to_string()),
                memory: Some(spec.limits.memory_bytes()),
                memory_swap: Some(spec.limits.memory_bytes()),
                nano_cpus: Some(spec.limits.nano_cpus()),
                pids_limit: Some(64),
                readonly_rootfs: Some(true),
                tmpfs: Some(tmpfs),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Wait for the container to stop and return its exit code.
    async fn wait_exit(&self, container_id: &str) -> Result<i64, BackendError> {
        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut wait_stream = self.docker.wait_container(container_id, Some(wait_options));
        match wait_stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(BackendError::Lost("no wait response from container".to_string())),
        }
    }

    async fn collect_logs(&self, container_id: &str) -> Result<(String, String), BackendError> {
        let logs_options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        });

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut logs_stream = self.docker.logs(container_id, logs_options);

        while let Some(output) = logs_stream.next().await {
            match output? {
                LogOutput::StdOut { message } => push_capped(&mut stdout, &message),
                LogOutput::StdErr { message } => push_capped(&mut stderr, &message),
                _ => {}
            }
        }

        Ok((
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
        ))
    }

    async fn oom_killed(&self, container_id: &str) -> bool {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect.state.and_then(|s| s.oom_killed).unwrap_or(false),
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "Failed to inspect container");
                false
            }
        }
    }

    async fn run_in_container(
        &self,
        container_id: &str,
        spec: &RunSpec,
    ) -> Result<RunOutput, BackendError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| BackendError::Setup(format!("failed to start container: {}", e)))?;

        let started = Instant::now();

        // HARD TIMEOUT: the daemon's wait is bounded by the wall-clock ceiling
        let exit_code = match tokio::time::timeout(spec.limits.wall_clock, self.wait_exit(container_id)).await {
            Ok(result) => result?,
            Err(_) => {
                let elapsed = started.elapsed();
                warn!(
                    container_id = %container_id,
                    timeout_ms = spec.limits.wall_clock.as_millis() as u64,
                    "Execution timed out, killing container"
                );

                if let Err(e) = self
                    .docker
                    .kill_container(container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(container_id = %container_id, error = %e, "Failed to kill timed-out container");
                }

                return Ok(RunOutput {
                    elapsed,
                    timed_out: true,
                    ..Default::default()
                });
            }
        };
        let elapsed = started.elapsed();

        let memory_exceeded = self.oom_killed(container_id).await;
        let (stdout, mut stderr) = self.collect_logs(container_id).await?;

        if exit_code == 137 && !memory_exceeded {
            stderr.push_str("\n[Container killed]");
        } else if exit_code == 139 {
            stderr.push_str("\n[Container killed: segmentation fault]");
        }

        debug!(container_id = %container_id, exit_code, elapsed_ms = elapsed.as_millis() as u64, memory_exceeded, "Container exited");

        Ok(RunOutput {
            stdout,
            stderr,
            exit_code: Some(exit_code),
            elapsed,
            timed_out: false,
            memory_exceeded,
        })
    }
}

#[async_trait]
impl IsolationBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_memory_limit: true,
            network_isolation: true,
        }
    }

    fn mount_point(&self, _workspace: &Path) -> PathBuf {
        PathBuf::from(SANDBOX_DIR)
    }

    fn scratch_dir(&self, _workspace: &Path) -> PathBuf {
        PathBuf::from(SCRATCH_DIR)
    }

    async fn run(&self, spec: &RunSpec) -> Result<RunOutput, BackendError> {
        self.ensure_image(&spec.image).await?;

        let container_name = format!("prajna-{}", uuid::Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), self.container_config(spec))
            .await
            .map_err(|e| BackendError::Setup(format!("failed to create container: {}", e)))?;

        // Set up the guard immediately so every later exit path removes it
        let guard = ContainerGuard::new(&self.docker, container.id.clone());
        let result = self.run_in_container(&container.id, spec).await;
        guard.release().await;

        result
    }
}

/// Wrap `argv` so stdin comes from a workspace file, without a shell
/// re-parsing the user-facing arguments.
fn shell_command(argv: &[String], stdin_file: Option<&str>) -> Vec<String> {
    let source = match stdin_file {
        Some(name) => format!("{}/{}", SANDBOX_DIR, name),
        None => "/dev/null".to_string(),
    };

    let mut cmd = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!("exec \"$@\" < {}", source),
        "sh".to_string(),
    ];
    cmd.extend(argv.iter().cloned());
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Limits;
    use std::time::Duration;

    #[test]
    fn test_shell_command_redirects_stdin() {
        let argv = vec!["python3".to_string(), "/sandbox/abc.py".to_string()];
        let cmd = shell_command(&argv, Some("abc.in"));

        assert_eq!(cmd[0], "/bin/sh");
        assert_eq!(cmd[2], "exec \"$@\" < /sandbox/abc.in");
        assert_eq!(cmd[3], "sh");
        assert_eq!(&cmd[4..], &argv[..]);
    }

    #[test]
    fn test_shell_command_without_stdin() {
        let cmd = shell_command(&["/sandbox/a.out".to_string()], None);
        assert!(cmd[2].ends_with("< /dev/null"));
    }

    fn spec(workspace: &Path, writable: bool) -> RunSpec {
        RunSpec {
            image: "online-judge-env".to_string(),
            workspace: workspace.to_path_buf(),
            writable,
            argv: vec!["python3".to_string(), "/sandbox/x.py".to_string()],
            stdin_file: Some("x.in".to_string()),
            limits: Limits::default(),
        }
    }

    async fn connect() -> DockerBackend {
        DockerBackend::connect(PathBuf::from("/tmp/prajna"), None, false)
            .await
            .expect("Failed to connect to Docker")
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_container_config_is_locked_down() {
        let backend = connect().await;
        let config = backend.container_config(&spec(Path::new("/tmp/prajna/abc"), false));
        let host = config.host_config.unwrap();

        assert_eq!(config.network_disabled, Some(true));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.memory, host.memory_swap);
        assert_eq!(host.binds.unwrap(), vec!["/tmp/prajna/abc:/sandbox:ro".to_string()]);
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_host_dir_translation() {
        let backend = DockerBackend {
            host_work_root: Some(PathBuf::from("/srv/oj/temp_codes")),
            ..connect().await
        };
        assert_eq!(
            backend.host_dir(Path::new("/tmp/prajna/abc")),
            PathBuf::from("/srv/oj/temp_codes/abc")
        );
        assert_eq!(backend.host_dir(Path::new("/elsewhere")), PathBuf::from("/elsewhere"));
    }

    #[tokio::test]
    #[ignore] // Requires Docker and the online-judge-env image
    async fn test_sleeping_container_times_out() {
        let backend = connect().await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.in"), "").unwrap();

        let mut spec = spec(dir.path(), false);
        spec.argv = vec!["sleep".to_string(), "10".to_string()];
        spec.limits.wall_clock = Duration::from_millis(500);

        let output = backend.run(&spec).await.unwrap();
        assert!(output.timed_out);
        assert!(output.stdout.is_empty());
    }
}
