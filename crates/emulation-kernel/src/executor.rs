//! Action executors: how a handler performs one schedule entry.
//!
//! Exit codes are never classified as errors. Only failing to start an action
//! is [`ActionOutcome::ExecutionFailed`]; a reboot request is a control signal.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ActionConfig;
use crate::schedule::{Action, EntryId, ExecutableRef};

/// One action to perform on behalf of a vertex.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub vertex: String,
    pub entry: EntryId,
    pub action: Action,
    /// `None` waits for the action indefinitely
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The action ran; any exit code counts
    Success {
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    /// The action could not be started or delivered
    ExecutionFailed { reason: String },
    /// The action was killed at its deadline; output up to that point is kept
    Timeout {
        after: Duration,
        stdout: String,
        stderr: String,
    },
    /// The action asked for a host reboot
    RebootRequested {
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

/// Performs actions for handlers.
///
/// Implementations must be shareable across every handler of an experiment.
pub trait ActionExecutor: Send + Sync {
    /// Unique name for this executor.
    fn name(&self) -> &str;

    /// Perform one non-control action.
    fn execute(&self, request: ActionRequest) -> BoxFuture<'_, ActionOutcome>;

    /// Reboot the host of `vertex`; resolves once it is back.
    fn reboot(&self, vertex: &str) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Runs actions as local processes under a per-vertex directory tree.
///
/// `<work_root>/<vertex>/root` stands in for the vertex filesystem and
/// `<work_root>/<vertex>/actions/<entry>` is each action's working directory.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    config: ActionConfig,
}

impl ProcessExecutor {
    pub fn new(config: ActionConfig) -> Self {
        Self { config }
    }

    pub fn vertex_root(&self, vertex: &str) -> PathBuf {
        self.config.work_root.join(vertex).join("root")
    }

    pub fn action_dir(&self, vertex: &str, entry: EntryId) -> PathBuf {
        self.config
            .work_root
            .join(vertex)
            .join("actions")
            .join(entry.to_string())
    }

    fn target(&self, vertex: &str, path: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("path `{path}` escapes the vertex root");
        }
        Ok(self.vertex_root(vertex).join(relative))
    }

    async fn drop_content(
        &self,
        vertex: &str,
        path: &str,
        content: &[u8],
        mode: Option<u32>,
    ) -> anyhow::Result<()> {
        let target = self.target(vertex, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        tokio::fs::write(&target, content)
            .await
            .with_context(|| format!("write {}", target.display()))?;
        if let Some(mode) = mode {
            set_mode(&target, mode).await?;
        }
        Ok(())
    }

    async fn drop_file(&self, vertex: &str, source: &Path, dest: &str) -> anyhow::Result<()> {
        let content = tokio::fs::read(source)
            .await
            .with_context(|| format!("read {}", source.display()))?;
        self.drop_content(vertex, dest, &content, None).await
    }

    async fn run(
        &self,
        request: &ActionRequest,
        program: &ExecutableRef,
        args: &[String],
    ) -> ActionOutcome {
        let cwd = self.action_dir(&request.vertex, request.entry);
        let prepared = async {
            tokio::fs::create_dir_all(&cwd)
                .await
                .with_context(|| format!("create {}", cwd.display()))?;
            let program = match program {
                ExecutableRef::Path(path) => PathBuf::from(path),
                ExecutableRef::Inline { name, bytes } => {
                    let file = cwd.join(name);
                    tokio::fs::write(&file, bytes)
                        .await
                        .with_context(|| format!("write {}", file.display()))?;
                    set_mode(&file, 0o755).await?;
                    file
                }
            };
            anyhow::Ok(program)
        };
        let program = match prepared.await {
            Ok(program) => program,
            Err(e) => {
                return ActionOutcome::ExecutionFailed {
                    reason: format!("{e:#}"),
                };
            }
        };

        let child = Command::new(&program)
            .args(args)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                return ActionOutcome::ExecutionFailed {
                    reason: format!("spawn {}: {e}", program.display()),
                };
            }
        };

        let stdout = Captured::default();
        let stderr = Captured::default();
        let mut readers = JoinSet::new();
        if let Some(pipe) = child.stdout.take() {
            readers.spawn(stdout.clone().drain(pipe));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.spawn(stderr.clone().drain(pipe));
        }

        let status = match request.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(
                        vertex = %request.vertex,
                        entry = request.entry,
                        timeout_secs = limit.as_secs_f64(),
                        "Action timed out, process killed"
                    );
                    if let Err(e) = child.kill().await {
                        warn!(vertex = %request.vertex, error = %e, "Failed to kill timed out action");
                    }
                    readers.abort_all();
                    while readers.join_next().await.is_some() {}
                    return ActionOutcome::Timeout {
                        after: limit,
                        stdout: stdout.text().await,
                        stderr: stderr.text().await,
                    };
                }
            },
            None => child.wait().await,
        };
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                return ActionOutcome::ExecutionFailed {
                    reason: format!("wait for {}: {e}", program.display()),
                };
            }
        };
        while readers.join_next().await.is_some() {}

        let exit_code = status.code();
        let stdout = stdout.text().await;
        let stderr = stderr.text().await;

        let sentinel = cwd.join(&self.config.reboot_sentinel);
        let sentinel_found = tokio::fs::try_exists(&sentinel).await.unwrap_or(false);
        if sentinel_found {
            // consumed so a replay does not request another reboot by accident
            if let Err(e) = tokio::fs::remove_file(&sentinel).await {
                warn!(path = %sentinel.display(), error = %e, "Failed to clear reboot sentinel");
            }
        }
        if sentinel_found || exit_code == Some(self.config.reboot_exit_code) {
            return ActionOutcome::RebootRequested {
                exit_code,
                stdout,
                stderr,
            };
        }
        ActionOutcome::Success {
            exit_code,
            stdout,
            stderr,
        }
    }
}

/// Output of one child pipe, readable while the child is still running.
#[derive(Debug, Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    async fn drain<R: AsyncRead + Unpin>(self, mut pipe: R) {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => self.0.lock().await.extend_from_slice(&chunk[..n]),
            }
        }
    }

    async fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().await).into_owned()
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .with_context(|| format!("chmod {:o} {}", mode, path.display()))
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> anyhow::Result<()> {
    Ok(())
}

impl ActionExecutor for ProcessExecutor {
    fn name(&self) -> &str {
        "process"
    }

    fn execute(&self, request: ActionRequest) -> BoxFuture<'_, ActionOutcome> {
        Box::pin(async move {
            debug!(
                vertex = %request.vertex,
                entry = request.entry,
                kind = ?request.action.kind(),
                "Executing action"
            );
            let dropped = match &request.action {
                Action::DropContent {
                    path,
                    content,
                    mode,
                } => self.drop_content(&request.vertex, path, content, *mode).await,
                Action::DropFile { source, dest } => {
                    self.drop_file(&request.vertex, source, dest).await
                }
                Action::RunExecutable { program, args, .. } => {
                    return self.run(&request, program, args).await;
                }
                other => Err(anyhow::anyhow!(
                    "{:?} is a control entry, not an action",
                    other.kind()
                )),
            };
            match dropped {
                Ok(()) => ActionOutcome::Success {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                },
                Err(e) => ActionOutcome::ExecutionFailed {
                    reason: format!("{e:#}"),
                },
            }
        })
    }

    fn reboot(&self, vertex: &str) -> BoxFuture<'_, anyhow::Result<()>> {
        let vertex = vertex.to_string();
        Box::pin(async move {
            // local vertices have no host to restart; the replay still happens
            info!(vertex = %vertex, executor = self.name(), "Host reboot completed");
            Ok(())
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn executor(root: &Path) -> ProcessExecutor {
        ProcessExecutor::new(ActionConfig {
            work_root: root.to_path_buf(),
            ..ActionConfig::default()
        })
    }

    fn shell(entry: EntryId, script: &str, timeout: Option<Duration>) -> ActionRequest {
        ActionRequest {
            vertex: "h1".into(),
            entry,
            action: Action::RunExecutable {
                program: ExecutableRef::Path("/bin/sh".into()),
                args: vec!["-c".into(), script.into()],
                timeout_seconds: None,
            },
            timeout,
        }
    }

    #[tokio::test]
    async fn non_zero_exit_is_still_success_with_output() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = executor(dir.path())
            .execute(shell(0, "echo out; echo err >&2; exit 3", None))
            .await;
        assert_eq!(
            outcome,
            ActionOutcome::Success {
                exit_code: Some(3),
                stdout: "out\n".into(),
                stderr: "err\n".into(),
            }
        );
    }

    #[tokio::test]
    async fn missing_program_is_an_execution_failure() {
        let dir = tempfile::tempdir().unwrap();
        let request = ActionRequest {
            vertex: "h1".into(),
            entry: 0,
            action: Action::RunExecutable {
                program: ExecutableRef::Path("/nonexistent/tool".into()),
                args: Vec::new(),
                timeout_seconds: None,
            },
            timeout: None,
        };
        let outcome = executor(dir.path()).execute(request).await;
        assert!(matches!(outcome, ActionOutcome::ExecutionFailed { .. }));
    }

    #[tokio::test]
    async fn timeout_kills_the_action() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = executor(dir.path())
            .execute(shell(0, "sleep 5", Some(Duration::from_millis(100))))
            .await;
        assert!(matches!(outcome, ActionOutcome::Timeout { .. }));
    }

    #[tokio::test]
    async fn timeout_keeps_output_written_before_the_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = executor(dir.path())
            .execute(shell(
                0,
                "echo started; echo warming >&2; exec sleep 5",
                Some(Duration::from_millis(500)),
            ))
            .await;
        match outcome {
            ActionOutcome::Timeout { stdout, stderr, .. } => {
                assert_eq!(stdout, "started\n");
                assert_eq!(stderr, "warming\n");
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reboot_signals_are_detected_and_sentinel_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());

        let by_exit = exec.execute(shell(0, "exit 199", None)).await;
        assert!(matches!(by_exit, ActionOutcome::RebootRequested { .. }));

        let by_file = exec.execute(shell(1, "touch .reboot-requested", None)).await;
        assert!(matches!(by_file, ActionOutcome::RebootRequested { .. }));
        assert!(!exec.action_dir("h1", 1).join(".reboot-requested").exists());
    }

    #[tokio::test]
    async fn drop_content_lands_under_the_vertex_root() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let request = ActionRequest {
            vertex: "h1".into(),
            entry: 0,
            action: Action::DropContent {
                path: "/etc/app/config".into(),
                content: vec![1, 2, 255],
                mode: Some(0o600),
            },
            timeout: None,
        };
        let outcome = exec.execute(request).await;
        assert!(matches!(outcome, ActionOutcome::Success { exit_code: None, .. }));
        let written = std::fs::read(exec.vertex_root("h1").join("etc/app/config")).unwrap();
        assert_eq!(written, vec![1, 2, 255]);
    }

    #[tokio::test]
    async fn drop_paths_cannot_escape() {
        let dir = tempfile::tempdir().unwrap();
        let request = ActionRequest {
            vertex: "h1".into(),
            entry: 0,
            action: Action::DropContent {
                path: "../outside".into(),
                content: Vec::new(),
                mode: None,
            },
            timeout: None,
        };
        let outcome = executor(dir.path()).execute(request).await;
        assert!(matches!(outcome, ActionOutcome::ExecutionFailed { .. }));
    }

    #[tokio::test]
    async fn inline_executables_are_materialized() {
        let dir = tempfile::tempdir().unwrap();
        let request = ActionRequest {
            vertex: "h1".into(),
            entry: 4,
            action: Action::RunExecutable {
                program: ExecutableRef::Inline {
                    name: "hello.sh".into(),
                    bytes: b"#!/bin/sh\necho hello $1\n".to_vec(),
                },
                args: vec!["world".into()],
                timeout_seconds: None,
            },
            timeout: None,
        };
        let outcome = executor(dir.path()).execute(request).await;
        assert!(matches!(
            outcome,
            ActionOutcome::Success { exit_code: Some(0), ref stdout, .. } if stdout == "hello world\n"
        ));
    }
}
