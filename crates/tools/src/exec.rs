//! Exec tool — run a shell command foreground or background.
//!
//! - Foreground: run the command, wait up to `yield_ms`, return its output.
//! - Background: spawn the command, return immediately with a session id
//!   and an initial output tail.
//! - A foreground run that outlives `yield_ms` auto-backgrounds: the
//!   response carries a session id instead of output, and the `process`
//!   tool takes over from there.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Notify};

use crate::file_ops::validate_path;
use crate::manager::{OutputBuffer, ProcessManager, ProcessSession, ProcessStatus, StdinMessage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    #[serde(default)]
    pub background: bool,
    /// Override the auto-background threshold (ms). 0 means wait forever.
    pub yield_ms: Option<u64>,
    /// Override the hard kill timeout (seconds).
    pub timeout_sec: Option<u64>,
    /// Working directory, relative to the session's workspace root.
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub env: Option<std::collections::HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecResponse {
    pub status: ProcessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tail: Option<String>,
}

impl ExecResponse {
    fn failed(message: impl Into<String>) -> Self {
        Self { status: ProcessStatus::Failed, exit_code: None, output: Some(message.into()), session_id: None, tail: None }
    }

    fn backgrounded(session_id: String, tail: String) -> Self {
        Self { status: ProcessStatus::Running, exit_code: None, output: None, session_id: Some(session_id), tail: Some(tail) }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Exec logic
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Environment variables a tool call is never allowed to override — they
/// control dynamic linking, shell startup, or credential lookup, and
/// letting a model-chosen value through would reach beyond the sandboxed
/// command itself.
fn is_dangerous_env_var(name: &str) -> bool {
    const BLOCKED: &[&str] = &[
        "LD_PRELOAD",
        "LD_LIBRARY_PATH",
        "LD_AUDIT",
        "DYLD_INSERT_LIBRARIES",
        "DYLD_LIBRARY_PATH",
        "DYLD_FRAMEWORK_PATH",
        "PATH",
        "HOME",
        "USER",
        "SHELL",
        "SSH_AUTH_SOCK",
        "SSH_AGENT_PID",
        "PYTHONPATH",
        "PYTHONSTARTUP",
        "PYTHONHOME",
        "NODE_PATH",
        "NODE_OPTIONS",
        "RUBYLIB",
        "RUBYOPT",
        "PERL5LIB",
        "PERL5OPT",
        "CLASSPATH",
        "BASH_ENV",
        "ENV",
        "CDPATH",
        "IFS",
    ];
    BLOCKED.contains(&name.to_ascii_uppercase().as_str())
}

/// Execute a command, returning either its completed output (foreground)
/// or a session id to poll (background / auto-backgrounded).
///
/// `workspace_root` confines `req.workdir` the same way `file_ops`
/// confines file paths — a tool call cannot point the shell at a
/// directory outside the session's workspace.
pub async fn exec(manager: &ProcessManager, workspace_root: &Path, req: ExecRequest) -> ExecResponse {
    let cfg = manager.config();
    let yield_ms = if req.background { 0 } else { req.yield_ms.unwrap_or(cfg.background_ms) };
    let timeout_sec = req.timeout_sec.unwrap_or(cfg.timeout_sec);

    let workdir = match &req.workdir {
        Some(wd) => match validate_path(workspace_root, wd) {
            Ok(resolved) => Some(resolved),
            Err(e) => return ExecResponse::failed(format!("invalid workdir: {e}")),
        },
        None => None,
    };

    let session_id = uuid::Uuid::new_v4().to_string();
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&req.command);
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.stdin(std::process::Stdio::piped());

    if let Some(wd) = &workdir {
        cmd.current_dir(wd);
    }
    if let Some(env) = &req.env {
        for (k, v) in env {
            if is_dangerous_env_var(k) {
                return ExecResponse::failed(format!("environment variable '{k}' is blocked by security policy"));
            }
            cmd.env(k, v);
        }
    }

    let child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return ExecResponse::failed(format!("failed to spawn: {e}")),
    };

    let (stdin_tx, stdin_rx) = mpsc::channel::<StdinMessage>(32);
    let (kill_tx, kill_rx) = mpsc::channel::<()>(1);

    let session = ProcessSession {
        id: session_id.clone(),
        command: req.command.clone(),
        workdir: req.workdir.clone(),
        started_at: Utc::now(),
        finished_at: None,
        status: ProcessStatus::Running,
        exit_code: None,
        output: OutputBuffer::new(cfg.max_output_chars),
        stdin_tx: Some(stdin_tx),
        kill_tx: Some(kill_tx),
        name: None,
    };

    let session_arc = manager.register(session);

    // Wakes the foreground waiter below as soon as the process exits,
    // instead of polling the session on a timer.
    let done_notify = Arc::new(Notify::new());

    spawn_monitor(child, session_arc.clone(), stdin_rx, kill_rx, timeout_sec, done_notify.clone());

    if req.background {
        return ExecResponse::backgrounded(session_id, String::new());
    }

    let yield_dur = if yield_ms > 0 {
        std::time::Duration::from_millis(yield_ms)
    } else {
        std::time::Duration::from_secs(timeout_sec)
    };

    tokio::select! {
        _ = done_notify.notified() => {
            let s = session_arc.read();
            ExecResponse {
                status: s.status,
                exit_code: s.exit_code,
                output: Some(s.output.combined.clone()),
                session_id: None,
                tail: None,
            }
        }
        _ = tokio::time::sleep(yield_dur) => {
            let tail = session_arc.read().output.tail(20);
            ExecResponse::backgrounded(session_id, tail)
        }
    }
}

/// Spawn the background task that drains stdout/stderr, forwards stdin,
/// and waits for the child to exit, be killed, or time out.
fn spawn_monitor(
    mut child: tokio::process::Child,
    session: Arc<parking_lot::RwLock<ProcessSession>>,
    mut stdin_rx: mpsc::Receiver<StdinMessage>,
    mut kill_rx: mpsc::Receiver<()>,
    timeout_sec: u64,
    done_notify: Arc<Notify>,
) {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdin = child.stdin.take();

    tokio::spawn(async move {
        let session_out = session.clone();
        let stdout_task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    let mut s = session_out.write();
                    s.output.push(&line);
                    s.output.push("\n");
                }
            }
        });

        let session_err = session.clone();
        let stderr_task = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    let mut s = session_err.write();
                    s.output.push(&line);
                    s.output.push("\n");
                }
            }
        });

        let stdin_task = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                while let Some(msg) = stdin_rx.recv().await {
                    match msg {
                        StdinMessage::Data(data) => {
                            let _ = stdin.write_all(&data).await;
                            let _ = stdin.flush().await;
                        }
                        StdinMessage::Eof => {
                            drop(stdin);
                            return;
                        }
                    }
                }
            }
        });

        let timeout_dur = std::time::Duration::from_secs(timeout_sec);

        tokio::select! {
            result = child.wait() => {
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                stdin_task.abort();
                match result {
                    Ok(exit) => finish(&session, ProcessStatus::Finished, exit.code(), None),
                    Err(e) => finish(&session, ProcessStatus::Failed, None, Some(format!("\n[process error: {e}]"))),
                }
            }
            _ = kill_rx.recv() => {
                let _ = child.kill().await;
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                stdin_task.abort();
                finish(&session, ProcessStatus::Killed, None, Some("\n[killed]".into()));
            }
            _ = tokio::time::sleep(timeout_dur) => {
                let _ = child.kill().await;
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                stdin_task.abort();
                finish(&session, ProcessStatus::TimedOut, None, Some("\n[timed out]".into()));
            }
        }

        done_notify.notify_waiters();
        tracing::debug!(session_id = %session.read().id, "process monitor completed");
    });
}

fn finish(session: &Arc<parking_lot::RwLock<ProcessSession>>, status: ProcessStatus, exit_code: Option<i32>, note: Option<String>) {
    let mut s = session.write();
    if let Some(note) = note {
        s.output.push(&note);
    }
    s.exit_code = exit_code;
    s.status = status;
    s.finished_at = Some(Utc::now());
    s.stdin_tx = None;
    s.kill_tx = None;
}
