//! Isolated execution environments.
//!
//! A `Sandbox` wraps either a Docker container (zero network, capped memory
//! and CPU, the repository bind-mounted read-only at `/workspace`) or a
//! plain process over a private temporary directory when no Docker daemon
//! is reachable. Both backings expose the same API, so the rest of the
//! pipeline never branches on the mode.
//!
//! Sandboxes are owned by the pool (`pool::SandboxPool`) and handed out as
//! `Arc` handles; callers must not destroy a sandbox directly, only release
//! it back to the pool.

pub mod pool;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bollard::container::{Config, CreateContainerOptions, RemoveContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::SandboxSettings;
use crate::errors::SandboxError;

/// Result of one command run inside a sandbox.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Sentinel exit code for a command that hit its timeout, matching the
/// shell convention for `timeout(1)`.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

enum Backing {
    Container {
        docker: Docker,
        container_id: String,
    },
    Local {
        workdir: tempfile::TempDir,
    },
}

/// One isolated sandbox instance.
pub struct Sandbox {
    id: String,
    backing: Backing,
    alive: AtomicBool,
    created_at: Instant,
    exec_timeout: Duration,
}

impl Sandbox {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether this sandbox is backed by a container (as opposed to the
    /// local-process fallback).
    pub fn is_container(&self) -> bool {
        matches!(self.backing, Backing::Container { .. })
    }

    /// Run a shell command inside the sandbox with the configured timeout.
    /// A timeout is a structured result (exit code 124), not an error.
    pub async fn exec(&self, command: &str) -> Result<ExecOutput, SandboxError> {
        self.exec_with_timeout(command, self.exec_timeout).await
    }

    pub async fn exec_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError> {
        if !self.is_alive() {
            return Err(SandboxError::Dead {
                id: self.id.clone(),
            });
        }
        let start = Instant::now();
        let result = match &self.backing {
            Backing::Container {
                docker,
                container_id,
            } => {
                match tokio::time::timeout(
                    timeout,
                    container_exec(docker, container_id, command, None),
                )
                .await
                {
                    Ok(inner) => inner,
                    Err(_) => Ok(timed_out(command, timeout)),
                }
            }
            Backing::Local { workdir } => {
                local_exec(command, workdir.path(), timeout).await
            }
        };
        result.map(|mut output| {
            output.elapsed = start.elapsed();
            debug!(
                sandbox = %self.id,
                exit = output.exit_code,
                elapsed_ms = output.elapsed.as_millis() as u64,
                "command finished"
            );
            output
        })
    }

    /// Write a file under the workspace root, creating parent directories.
    /// Paths are workspace-relative; absolute paths and `..` are rejected.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        if !self.is_alive() {
            return Err(SandboxError::Dead {
                id: self.id.clone(),
            });
        }
        let relative = sanitize_path(path)?;
        match &self.backing {
            Backing::Container {
                docker,
                container_id,
            } => {
                let target = format!("/workspace/{}", relative.display());
                let parent = Path::new(&target)
                    .parent()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "/workspace".to_string());
                let command = format!("mkdir -p '{}' && cat > '{}'", parent, target);
                let output = tokio::time::timeout(
                    self.exec_timeout,
                    container_exec(docker, container_id, &command, Some(content)),
                )
                .await
                .map_err(|_| SandboxError::Timeout(self.exec_timeout))??;
                if !output.success() {
                    return Err(SandboxError::Exec {
                        reason: format!("write to {} exited {}", target, output.exit_code),
                    });
                }
                Ok(())
            }
            Backing::Local { workdir } => {
                let full = workdir.path().join(&relative);
                if let Some(parent) = full.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| SandboxError::Workspace {
                            path: parent.to_path_buf(),
                            source: e,
                        })?;
                }
                tokio::fs::write(&full, content)
                    .await
                    .map_err(|e| SandboxError::Workspace {
                        path: full.clone(),
                        source: e,
                    })
            }
        }
    }

    /// Read a workspace file. A missing file is an `Exec` error with the
    /// failing output, not a panic.
    pub async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let relative = sanitize_path(path)?;
        match &self.backing {
            Backing::Container { .. } => {
                let output = self
                    .exec(&format!("cat '/workspace/{}'", relative.display()))
                    .await?;
                if output.success() {
                    Ok(output.stdout)
                } else {
                    Err(SandboxError::Exec {
                        reason: format!("cat {}: {}", relative.display(), output.stderr.trim()),
                    })
                }
            }
            Backing::Local { workdir } => {
                let full = workdir.path().join(&relative);
                tokio::fs::read_to_string(&full)
                    .await
                    .map_err(|e| SandboxError::Workspace {
                        path: full.clone(),
                        source: e,
                    })
            }
        }
    }

    /// Lint one file: ruff, falling back to flake8 when ruff is absent.
    pub async fn run_linter(&self, filepath: &str) -> Result<ExecOutput, SandboxError> {
        self.exec(&format!(
            "ruff check {filepath} --output-format=text || flake8 {filepath}"
        ))
        .await
    }

    /// Run pytest on a selected set of test files. An empty selection runs
    /// the whole `tests/` tree when one exists; a workspace with no test
    /// tree has nothing to gate on and passes vacuously.
    pub async fn run_tests(&self, test_paths: &[String]) -> Result<ExecOutput, SandboxError> {
        if test_paths.is_empty() {
            return self
                .exec(
                    "if [ -d tests ]; then python -m pytest tests/ --tb=short --no-header -q; \
                     else echo 'no test tree'; fi",
                )
                .await;
        }
        self.exec(&format!(
            "python -m pytest {} --tb=short --no-header -q",
            test_paths.join(" ")
        ))
        .await
    }

    pub async fn run_type_check(&self, module: &str) -> Result<ExecOutput, SandboxError> {
        self.exec(&format!("mypy {module} --ignore-missing-imports"))
            .await
    }

    pub async fn run_coverage(&self, test_paths: &[String]) -> Result<ExecOutput, SandboxError> {
        if test_paths.is_empty() {
            return self
                .exec(
                    "if [ -d tests ]; then python -m pytest tests/ --cov \
                     --cov-report=term-missing -q --no-header; else echo 'no test tree'; fi",
                )
                .await;
        }
        self.exec(&format!(
            "python -m pytest {} --cov --cov-report=term-missing -q --no-header",
            test_paths.join(" ")
        ))
        .await
    }

    pub async fn git_status(&self) -> Result<ExecOutput, SandboxError> {
        self.exec("git status --short").await
    }

    pub async fn git_diff(&self) -> Result<ExecOutput, SandboxError> {
        self.exec("git diff HEAD").await
    }

    /// Reset workspace state between reuses.
    pub async fn reset(&self) -> Result<(), SandboxError> {
        match &self.backing {
            Backing::Container { .. } => {
                self.exec("git checkout -- . 2>/dev/null; git clean -fd 2>/dev/null; true")
                    .await?;
            }
            Backing::Local { workdir } => {
                let root = workdir.path().to_path_buf();
                let mut entries =
                    tokio::fs::read_dir(&root)
                        .await
                        .map_err(|e| SandboxError::Workspace {
                            path: root.clone(),
                            source: e,
                        })?;
                while let Some(entry) = entries.next_entry().await.map_err(SandboxError::Io)? {
                    let path = entry.path();
                    let result = if entry.file_type().await.map_err(SandboxError::Io)?.is_dir() {
                        tokio::fs::remove_dir_all(&path).await
                    } else {
                        tokio::fs::remove_file(&path).await
                    };
                    if let Err(e) = result {
                        warn!(path = %path.display(), error = %e, "workspace reset left residue");
                    }
                }
            }
        }
        Ok(())
    }

    /// Tear the sandbox down. Best-effort and idempotent: a second call is
    /// a no-op, and failures are logged rather than returned.
    pub async fn destroy(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Backing::Container {
            docker,
            container_id,
        } = &self.backing
        {
            let result = docker
                .remove_container(
                    container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            match result {
                Ok(()) => info!(sandbox = %self.id, "sandbox destroyed"),
                Err(e) => warn!(sandbox = %self.id, error = %e, "failed to remove container"),
            }
        }
    }
}

/// Builds sandboxes against a Docker daemon when one is reachable,
/// otherwise against private local workspaces.
pub struct Provisioner {
    settings: SandboxSettings,
    source_root: PathBuf,
    docker: Option<Docker>,
}

impl Provisioner {
    /// Probe for a Docker daemon; fall back to local mode when the probe
    /// fails.
    pub async fn detect(settings: SandboxSettings, source_root: PathBuf) -> Self {
        let docker = match Docker::connect_with_local_defaults() {
            Ok(docker) => {
                if docker.ping().await.is_ok() {
                    info!("Docker daemon connected");
                    Some(docker)
                } else {
                    warn!("Docker daemon unreachable, sandboxes run in local mode");
                    None
                }
            }
            Err(e) => {
                warn!(error = %e, "Docker unavailable, sandboxes run in local mode");
                None
            }
        };
        Self {
            settings,
            source_root,
            docker,
        }
    }

    /// Local-only provisioner. Used when isolation is explicitly disabled
    /// and by the test suite.
    pub fn local(settings: SandboxSettings, source_root: PathBuf) -> Self {
        Self {
            settings,
            source_root,
            docker: None,
        }
    }

    pub fn is_container_mode(&self) -> bool {
        self.docker.is_some()
    }

    /// Provision one sandbox. Container creation failures degrade to a
    /// local sandbox rather than propagating, so the pool always fills.
    pub async fn provision(&self) -> Result<Sandbox, SandboxError> {
        let id = new_sandbox_id();
        if let Some(docker) = &self.docker {
            match self.provision_container(docker, &id).await {
                Ok(container_id) => {
                    info!(sandbox = %id, "container sandbox ready");
                    return Ok(Sandbox {
                        id,
                        backing: Backing::Container {
                            docker: docker.clone(),
                            container_id,
                        },
                        alive: AtomicBool::new(true),
                        created_at: Instant::now(),
                        exec_timeout: self.settings.exec_timeout,
                    });
                }
                Err(e) => {
                    warn!(sandbox = %id, error = %e, "container creation failed, using local backing");
                }
            }
        }
        self.provision_local(id)
    }

    fn provision_local(&self, id: String) -> Result<Sandbox, SandboxError> {
        let workdir = tempfile::Builder::new()
            .prefix("mender-sandbox-")
            .tempdir()
            .map_err(|e| SandboxError::Provisioning {
                reason: format!("failed to create local workspace: {e}"),
            })?;
        debug!(sandbox = %id, workdir = %workdir.path().display(), "local sandbox ready");
        Ok(Sandbox {
            id,
            backing: Backing::Local { workdir },
            alive: AtomicBool::new(true),
            created_at: Instant::now(),
            exec_timeout: self.settings.exec_timeout,
        })
    }

    async fn provision_container(
        &self,
        docker: &Docker,
        id: &str,
    ) -> Result<String, SandboxError> {
        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:/workspace:ro",
                self.source_root.display()
            )]),
            memory: Some(self.settings.memory_bytes),
            cpu_quota: Some((self.settings.cpus * 100_000.0) as i64),
            // The isolation boundary: no network, ever.
            network_mode: Some("none".to_string()),
            ..Default::default()
        };
        let config = Config {
            image: Some(self.settings.image.clone()),
            cmd: Some(vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ]),
            working_dir: Some("/workspace".to_string()),
            host_config: Some(host_config),
            labels: Some(
                [
                    ("managed_by".to_string(), "mender".to_string()),
                    ("sandbox_id".to_string(), id.to_string()),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        };

        let response = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: id.to_string(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(|e| SandboxError::Docker(e.to_string()))?;

        docker
            .start_container::<String>(&response.id, None)
            .await
            .map_err(|e| SandboxError::Docker(e.to_string()))?;

        // Gate tooling; the image may already carry it.
        let _ = container_exec(
            docker,
            &response.id,
            "pip install ruff pytest mypy --quiet",
            None,
        )
        .await;

        Ok(response.id)
    }
}

fn new_sandbox_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("mender-{}", &hex[..8])
}

fn timed_out(command: &str, timeout: Duration) -> ExecOutput {
    ExecOutput {
        exit_code: TIMEOUT_EXIT_CODE,
        stdout: String::new(),
        stderr: format!("Command timed out after {:?}: {}", timeout, command),
        elapsed: timeout,
    }
}

fn sanitize_path(path: &str) -> Result<PathBuf, SandboxError> {
    let candidate = Path::new(path);
    if candidate.is_absolute()
        || candidate
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(SandboxError::Exec {
            reason: format!("path escapes workspace: {path}"),
        });
    }
    Ok(candidate.to_path_buf())
}

async fn local_exec(
    command: &str,
    workdir: &Path,
    timeout: Duration,
) -> Result<ExecOutput, SandboxError> {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(workdir)
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1) as i64,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            elapsed: Duration::ZERO,
        }),
        Ok(Err(e)) => Err(SandboxError::Exec {
            reason: format!("failed to spawn shell: {e}"),
        }),
        Err(_) => Ok(timed_out(command, timeout)),
    }
}

async fn container_exec(
    docker: &Docker,
    container_id: &str,
    command: &str,
    stdin: Option<&str>,
) -> Result<ExecOutput, SandboxError> {
    let exec = docker
        .create_exec(
            container_id,
            CreateExecOptions {
                cmd: Some(vec!["sh", "-c", command]),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                attach_stdin: Some(stdin.is_some()),
                working_dir: Some("/workspace"),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| SandboxError::Docker(format!("exec create failed: {e}")))?;

    let start = docker
        .start_exec(&exec.id, None)
        .await
        .map_err(|e| SandboxError::Docker(format!("exec start failed: {e}")))?;

    let mut stdout = String::new();
    let mut stderr = String::new();
    if let StartExecResults::Attached {
        mut output,
        mut input,
    } = start
    {
        if let Some(content) = stdin {
            input
                .write_all(content.as_bytes())
                .await
                .map_err(SandboxError::Io)?;
            input.shutdown().await.map_err(SandboxError::Io)?;
        }
        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(bollard::container::LogOutput::StdOut { message }) => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(bollard::container::LogOutput::StdErr { message }) => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "error reading exec output"),
            }
        }
    }

    let inspect = docker
        .inspect_exec(&exec.id)
        .await
        .map_err(|e| SandboxError::Docker(format!("exec inspect failed: {e}")))?;

    Ok(ExecOutput {
        exit_code: inspect.exit_code.unwrap_or(-1),
        stdout,
        stderr,
        elapsed: Duration::ZERO,
    })
}
