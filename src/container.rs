//! Per-conversation container command construction and execution (spec.md
//! §4.5). Grounded on `crates/session-manager/src/container.rs`'s
//! `shell_escape`-wrapped `docker run` argv assembly and piped-stdio
//! scanning, generalized from an interactive `docker exec` session kept
//! alive across multiple messages to a single-shot `docker run --rm` per
//! conversation, and from remote SSH execution (`ssh::command()`) to a
//! direct local `tokio::process::Command`.

use shell_escape::escape;
use std::borrow::Cow;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::errors::ContainerError;
use crate::log_sink::BatchLogSink;
use crate::mask::mask;
use crate::models::{ConversationId, DevEnvironment, DevEnvironmentType, TaskId};
use crate::repositories::SystemConfig;
use crate::shellquote;

const MAX_LINE_BYTES: usize = 1024 * 1024;
const STDERR_EXCERPT_LIMIT: usize = 1000;

fn shell_escape(s: &str) -> Cow<'_, str> {
    escape(Cow::Borrowed(s))
}

pub fn container_name(task_id: TaskId, conversation_id: ConversationId) -> String {
    format!("xsha-task-{task_id}-conv-{conversation_id}")
}

/// True if this process is itself running inside a container (spec.md
/// §4.5's volume-mounting-strategy detection).
pub fn is_running_in_container() -> bool {
    if std::path::Path::new("/.dockerenv").exists() {
        return true;
    }
    if let Ok(cgroup) = std::fs::read_to_string("/proc/1/cgroup") {
        if ["docker", "containerd", "/docker/", "/lxc/", "/kubepods/"]
            .iter()
            .any(|needle| cgroup.contains(needle))
        {
            return true;
        }
    }
    std::env::var("XSHA_WORKSPACE_BASE_DIR").as_deref() == Ok("/app/workspaces")
}

/// Everything `Build` needs that is not already carried on the
/// conversation/task/devEnv models themselves.
pub struct BuildParams<'a> {
    pub task_id: TaskId,
    pub conversation_id: ConversationId,
    pub content: &'a str,
    pub model: Option<&'a str>,
    pub is_plan_mode: bool,
    pub session_id: Option<&'a str>,
    pub project_system_prompt: Option<&'a str>,
    pub workspace_rel: &'a str,
    pub workspace_abs: &'a std::path::Path,
    pub session_dir_abs: Option<&'a std::path::Path>,
    pub container_name: Option<&'a str>,
    pub with_stdin: bool,
}

/// Output of [`ContainerExecutor::build`]: the command actually executed,
/// and the env-masked form persisted to the execution log.
pub struct BuiltCommand {
    pub exec: String,
    pub sanitized: String,
}

pub struct ContainerExecutor<S> {
    config: Arc<S>,
    runtime: String,
}

impl<S: SystemConfig> ContainerExecutor<S> {
    pub fn new(config: Arc<S>, runtime: impl Into<String>) -> Self {
        Self {
            config,
            runtime: runtime.into(),
        }
    }

    /// Builds the full `docker run ...` shell command line, once unmasked
    /// (for execution) and once with env-var values masked (for
    /// persistence), per spec.md §4.5/§4.6.
    pub fn build(&self, dev_env: &DevEnvironment, params: &BuildParams<'_>) -> BuiltCommand {
        BuiltCommand {
            exec: self.build_one(dev_env, params, false),
            sanitized: self.build_one(dev_env, params, true),
        }
    }

    fn build_one(&self, dev_env: &DevEnvironment, params: &BuildParams<'_>, mask_envs: bool) -> String {
        let mut tokens: Vec<String> = vec![self.runtime.clone(), "run".to_string(), "--rm".to_string()];

        if params.with_stdin {
            tokens.push("-i".to_string());
        }
        if let Some(name) = params.container_name {
            tokens.push(format!("--name={}", shell_escape(name)));
        }

        let container_mode = is_running_in_container();
        if container_mode {
            tokens.push("-v".to_string());
            tokens.push("xsha_workspaces:/app".to_string());
            tokens.push("-v".to_string());
            tokens.push("xsha_dev_sessions:/xsha_dev_sessions".to_string());
            tokens.push("-w".to_string());
            tokens.push(format!("/app/{}", params.workspace_rel));
        } else {
            tokens.push("-v".to_string());
            tokens.push(format!(
                "{}:/app/{}",
                shell_escape(&params.workspace_abs.to_string_lossy()),
                params.workspace_rel
            ));
            if let Some(session_dir) = params.session_dir_abs {
                tokens.push("-v".to_string());
                tokens.push(format!("{}:/home/xsha", shell_escape(&session_dir.to_string_lossy())));
            }
            tokens.push("-w".to_string());
            tokens.push(format!("/app/{}", params.workspace_rel));
        }

        if dev_env.cpu_limit > 0.0 {
            tokens.push(format!("--cpus={:.2}", dev_env.cpu_limit));
        }
        if dev_env.memory_limit_mb > 0 {
            tokens.push(format!("--memory={}m", dev_env.memory_limit_mb));
        }

        for (k, v) in dev_env.parsed_env_vars() {
            let value = if mask_envs { mask(&v) } else { v };
            tokens.push("-e".to_string());
            tokens.push(format!("{}={}", k, shell_escape(&value)));
        }

        tokens.push(shell_escape(&dev_env.docker_image).into_owned());

        match dev_env.env_type {
            DevEnvironmentType::ClaudeCode => {
                let mut inner: Vec<String> = vec![
                    "claude".to_string(),
                    "-p".to_string(),
                    "--output-format=stream-json".to_string(),
                    "--dangerously-skip-permissions".to_string(),
                    "--verbose".to_string(),
                ];
                if let Some(sid) = params.session_id {
                    inner.push("-r".to_string());
                    inner.push(sid.to_string());
                }
                if let Some(model) = params.model {
                    if model != "default" {
                        inner.push("--model".to_string());
                        inner.push(model.to_string());
                    }
                }
                if params.is_plan_mode {
                    inner.push("--permission-mode".to_string());
                    inner.push("plan".to_string());
                }
                for prompt in [params.project_system_prompt, dev_env.system_prompt.as_deref()]
                    .into_iter()
                    .flatten()
                {
                    inner.push("--append-system-prompt".to_string());
                    inner.push(shellquote::quote(prompt));
                }
                inner.push(shellquote::quote(params.content));

                let inner_joined = inner.join(" ");

                if container_mode {
                    if let Some(session_dir) = dev_env.session_dir.as_deref() {
                        tokens.push("-d".to_string());
                        tokens.push(format!("/xsha_dev_sessions/{session_dir}"));
                    }
                }
                tokens.push("--command".to_string());
                tokens.push(shellquote::quote(&inner_joined));
            }
            DevEnvironmentType::Opencode | DevEnvironmentType::GeminiCli => {
                tokens.push(shellquote::quote(params.content));
            }
        }

        tokens.join(" ")
    }

    /// Verifies `docker version` succeeds within a short timeout.
    pub async fn check_availability(&self) -> Result<(), ContainerError> {
        let probe = Command::new(&self.runtime).arg("version").output();
        let timeout = Duration::from_secs(crate::config::settings().docker_probe_timeout_secs);
        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => Err(ContainerError::DockerUnavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
            Ok(Err(e)) => Err(ContainerError::Spawn(e)),
            Err(_) => Err(ContainerError::DockerUnavailable(format!(
                "docker version did not respond within {timeout:?}"
            ))),
        }
    }

    /// Runs `command` under a shell, streaming stdout/stderr into
    /// `sink` and honoring `cancel`. Returns `Ok(())` on a zero exit,
    /// `Err` otherwise (cancellation takes priority in the error kind).
    pub async fn run(
        &self,
        command: &str,
        sink: &BatchLogSink,
        cancel: CancellationToken,
    ) -> Result<(), ContainerError> {
        self.check_availability().await?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let stderr_collected = Arc::new(Mutex::new(String::new()));

        let stdout_task = tokio::spawn(pump_lines(stdout, "STDOUT", sink.clone(), None));
        let stderr_task = tokio::spawn(pump_lines(
            stderr,
            "STDERR",
            sink.clone(),
            Some(stderr_collected.clone()),
        ));

        let timeout = self.config.docker_timeout();
        let wait = async {
            tokio::select! {
                status = child.wait() => Ok(status),
                _ = cancel.cancelled() => Err(()),
            }
        };

        let outcome = tokio::time::timeout(timeout, wait).await;

        let _ = stdout_task.await;
        let _ = stderr_task.await;

        match outcome {
            Err(_) => {
                let _ = child.kill().await;
                Err(ContainerError::Timeout(timeout))
            }
            Ok(Err(())) => {
                let _ = child.kill().await;
                Err(ContainerError::Cancelled)
            }
            Ok(Ok(Err(e))) => Err(ContainerError::Spawn(e)),
            Ok(Ok(Ok(status))) => {
                if status.success() {
                    Ok(())
                } else {
                    let excerpt = truncate_excerpt(&stderr_collected.lock().unwrap(), STDERR_EXCERPT_LIMIT);
                    Err(ContainerError::RuntimeError { stderr_excerpt: excerpt })
                }
            }
        }
    }

    /// Best-effort teardown for a named, cancelled run: `docker stop`
    /// followed by `docker rm -f`. "No such container" counts as success.
    pub async fn cancel_container(&self, name: &str) {
        let stop = Command::new(&self.runtime).arg("stop").arg(name).output();
        if let Ok(Ok(output)) = tokio::time::timeout(Duration::from_secs(10), stop).await {
            if !output.status.success() && !no_such_container(&output.stderr) {
                tracing::warn!(name, stderr = %String::from_utf8_lossy(&output.stderr), "docker stop failed");
            }
        }
        let rm = Command::new(&self.runtime).arg("rm").arg("-f").arg(name).output();
        if let Ok(Ok(output)) = tokio::time::timeout(Duration::from_secs(5), rm).await {
            if !output.status.success() && !no_such_container(&output.stderr) {
                tracing::warn!(name, stderr = %String::from_utf8_lossy(&output.stderr), "docker rm failed");
            }
        }
    }
}

fn no_such_container(stderr: &[u8]) -> bool {
    String::from_utf8_lossy(stderr).contains("No such container")
}

fn truncate_excerpt(s: &str, limit: usize) -> String {
    if s.chars().count() <= limit {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(limit).collect();
        format!("{truncated}...")
    }
}

/// Reads `reader` line by line, capping each line at [`MAX_LINE_BYTES`],
/// formatting `"[HH:MM:SS] <STREAM>: <line>\n"` and feeding it to the
/// sink. If `collect` is set, the raw (unformatted) line is also
/// appended there, for stderr excerpting on failure.
async fn pump_lines<R: AsyncRead + Unpin>(
    reader: R,
    stream_label: &'static str,
    sink: BatchLogSink,
    collect: Option<Arc<Mutex<String>>>,
) {
    let mut reader = BufReader::new(reader);
    loop {
        let mut buf = Vec::new();
        match read_capped_line(&mut reader, &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let (line, truncated) = decode_capped(&buf);
                let timestamp = chrono::Utc::now().format("%H:%M:%S");
                let formatted = if truncated {
                    format!("[{timestamp}] {stream_label}: {line}...[truncated]\n")
                } else {
                    format!("[{timestamp}] {stream_label}: {line}\n")
                };
                if let Some(c) = &collect {
                    let mut guard = c.lock().unwrap();
                    guard.push_str(&line);
                    guard.push('\n');
                }
                sink.append(formatted).await;
            }
            Err(_) => break,
        }
    }
}

fn decode_capped(buf: &[u8]) -> (String, bool) {
    let truncated = buf.len() > MAX_LINE_BYTES;
    let slice = if truncated { &buf[..MAX_LINE_BYTES] } else { buf };
    (String::from_utf8_lossy(slice).trim_end_matches('\n').to_string(), truncated)
}

async fn read_capped_line<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<usize> {
    reader.read_until(b'\n', buf).await
}
