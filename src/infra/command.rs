//! 命令执行器
//!
//! 提供统一的命令执行接口，支持：
//! - 实时日志流式输出
//! - 取消支持（Ctrl-C）
//! - 交互式命令（继承终端）

use std::path::Path;
use std::process::{ExitStatus, Output, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::step::LogLine;

/// 命令执行器
pub struct CommandRunner;

/// 命令执行错误
#[derive(Debug)]
pub enum CommandError {
    /// 命令启动失败
    SpawnFailed {
        program: String,
        source: std::io::Error,
    },
    /// 命令被取消
    Cancelled,
    /// 等待命令完成失败
    WaitFailed(std::io::Error),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::SpawnFailed { program, source } => {
                write!(f, "Failed to spawn {}: {}", program, source)
            }
            CommandError::Cancelled => write!(f, "Command was cancelled"),
            CommandError::WaitFailed(e) => write!(f, "Failed to wait for command: {}", e),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::SpawnFailed { source, .. } | CommandError::WaitFailed(source) => {
                Some(source)
            }
            CommandError::Cancelled => None,
        }
    }
}

impl CommandRunner {
    /// 执行命令并流式输出日志
    ///
    /// stdout / stderr 每一行都作为 [`LogLine`] 发送到 `log_tx`。
    /// `cancel` 被触发时终止子进程并返回 [`CommandError::Cancelled`]。
    pub async fn run_with_streaming(
        program: &str,
        args: &[String],
        work_dir: &Path,
        log_tx: broadcast::Sender<LogLine>,
        cancel: CancellationToken,
    ) -> Result<ExitStatus, CommandError> {
        debug!(program, ?args, work_dir = %work_dir.display(), "Spawning command");

        let mut child = Command::new(program)
            .args(args)
            .current_dir(work_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CommandError::SpawnFailed {
                program: program.to_string(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // 启动 stdout 读取任务
        let stdout_tx = log_tx.clone();
        let stdout_task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = stdout_tx.send(LogLine::stdout(line));
                }
            }
        });

        // 启动 stderr 读取任务
        let stderr_tx = log_tx;
        let stderr_task = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = stderr_tx.send(LogLine::stderr(line));
                }
            }
        });

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(program, "Command cancelled, killing process");
                let _ = child.kill().await;
                Err(CommandError::Cancelled)
            }
            status = child.wait() => status.map_err(CommandError::WaitFailed),
        };

        // 等待日志读取完成
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        result
    }

    /// 执行命令并捕获输出（无流式输出）
    pub async fn run_captured(
        program: &str,
        args: &[String],
        work_dir: &Path,
    ) -> Result<Output, CommandError> {
        debug!(program, ?args, "Running command");
        Command::new(program)
            .args(args)
            .current_dir(work_dir)
            .output()
            .await
            .map_err(|source| CommandError::SpawnFailed {
                program: program.to_string(),
                source,
            })
    }

    /// 执行交互式命令（继承当前终端的 stdin/stdout/stderr）
    pub async fn run_interactive(
        program: &str,
        args: &[String],
        work_dir: &Path,
    ) -> Result<ExitStatus, CommandError> {
        debug!(program, ?args, "Running interactive command");
        let mut child = Command::new(program)
            .args(args)
            .current_dir(work_dir)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| CommandError::SpawnFailed {
                program: program.to_string(),
                source,
            })?;
        child.wait().await.map_err(CommandError::WaitFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_run_captured_success() {
        let output = CommandRunner::run_captured("echo", &args(&["hello"]), &std::env::temp_dir())
            .await
            .unwrap();
        assert!(output.status.success());
        assert!(String::from_utf8_lossy(&output.stdout).contains("hello"));
    }

    #[tokio::test]
    async fn test_run_captured_not_found() {
        let result =
            CommandRunner::run_captured("nonexistent_command_12345", &[], &std::env::temp_dir())
                .await;
        assert!(matches!(result, Err(CommandError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn test_run_with_streaming_sends_lines() {
        let (tx, mut rx) = broadcast::channel(16);
        let status = CommandRunner::run_with_streaming(
            "sh",
            &args(&["-c", "echo out; echo err >&2"]),
            &std::env::temp_dir(),
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(status.success());

        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        assert!(lines.iter().any(|l| l.content == "out" && !l.is_stderr()));
        assert!(lines.iter().any(|l| l.content == "err" && l.is_stderr()));
    }

    #[tokio::test]
    async fn test_run_with_streaming_cancelled() {
        let (tx, _rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = CommandRunner::run_with_streaming(
            "sleep",
            &args(&["5"]),
            &std::env::temp_dir(),
            tx,
            cancel,
        )
        .await;
        assert!(matches!(result, Err(CommandError::Cancelled)));
    }
}
