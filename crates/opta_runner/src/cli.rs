//! Process-based command runner.
//!
//! Spawns programs with `tokio::process`, captures both output streams and
//! optionally echoes them line by line while the program runs. Children are
//! killed when the future driving them is dropped, so an interrupted command
//! never outlives the invocation that started it.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::config::{CommandSpec, RunConfig};
use crate::error::{RunnerError, RunnerResult};
use crate::runner::{CommandRunner, ExecutionResult};

/// Log output from a running command.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub timestamp: chrono::DateTime<Utc>,
    pub stream: LogStream,
    pub message: String,
}

/// Log stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Log handler callback type.
pub type LogHandler = Arc<dyn Fn(LogLine) + Send + Sync>;

/// Process runner options.
#[derive(Debug, Clone)]
pub struct CliRunnerOptions {
    /// Dry-run mode (log commands without executing)
    pub dry_run: bool,
    /// CI mode (timestamped log lines)
    pub ci_mode: bool,
}

impl Default for CliRunnerOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            ci_mode: std::env::var("CI").is_ok(),
        }
    }
}

impl CliRunnerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn ci_mode(mut self) -> Self {
        self.ci_mode = true;
        self
    }
}

/// Runner that executes programs on the host.
pub struct CliRunner {
    options: CliRunnerOptions,
    log_handler: Option<LogHandler>,
}

impl CliRunner {
    pub fn new(options: CliRunnerOptions) -> Self {
        Self {
            options,
            log_handler: None,
        }
    }

    /// Set a log handler for streaming logs.
    pub fn with_log_handler(mut self, handler: LogHandler) -> Self {
        self.log_handler = Some(handler);
        self
    }

    /// Check if dry-run mode is enabled.
    pub fn is_dry_run(&self) -> bool {
        self.options.dry_run
    }

    fn build_command(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(dir) = &spec.workdir {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd
    }

    async fn collect<R>(
        reader: R,
        stream: LogStream,
        echo: bool,
        ci_mode: bool,
        handler: Option<LogHandler>,
    ) -> String
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        let mut output = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            output.push_str(&line);
            output.push('\n');
            if !echo {
                continue;
            }
            let log_line = LogLine {
                timestamp: Utc::now(),
                stream,
                message: line,
            };
            if ci_mode {
                println!(
                    "[{}] [{}] {}",
                    log_line.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                    log_line.stream,
                    log_line.message
                );
            } else {
                match stream {
                    LogStream::Stdout => println!("{}", log_line.message),
                    LogStream::Stderr => eprintln!("{}", log_line.message),
                }
            }
            if let Some(handler) = &handler {
                handler(log_line);
            }
        }
        output
    }
}

impl Default for CliRunner {
    fn default() -> Self {
        Self::new(CliRunnerOptions::default())
    }
}

#[async_trait]
impl CommandRunner for CliRunner {
    async fn is_available(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }

    async fn run(&self, spec: &CommandSpec, config: &RunConfig) -> RunnerResult<ExecutionResult> {
        let command = spec.command_line();
        debug!("Executing: {}", command);

        if self.options.dry_run {
            info!("[DRY-RUN] Would execute: {}", command);
            let now = Utc::now();
            return Ok(ExecutionResult {
                command,
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                started_at: now,
                finished_at: now,
                duration_ms: 0,
            });
        }

        let mut child = Self::build_command(spec).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RunnerError::ProgramNotAvailable(spec.program.clone())
            } else {
                RunnerError::ExecutionFailed(format!("Failed to spawn {}: {}", spec.program, e))
            }
        })?;
        let started_at = Utc::now();

        if let Some(input) = &spec.stdin {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| RunnerError::ExecutionFailed("stdin not captured".to_string()))?;
            stdin.write_all(input.as_bytes()).await?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::ExecutionFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::ExecutionFailed("stderr not captured".to_string()))?;

        let echo = config.stream_logs;
        let ci_mode = self.options.ci_mode;
        let stdout_task = tokio::spawn(Self::collect(
            stdout,
            LogStream::Stdout,
            echo,
            ci_mode,
            self.log_handler.clone(),
        ));
        let stderr_task = tokio::spawn(Self::collect(
            stderr,
            LogStream::Stderr,
            echo,
            ci_mode,
            self.log_handler.clone(),
        ));

        let status = if config.timeout_seconds > 0 {
            let timeout = Duration::from_secs(config.timeout_seconds);
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    let _ = child.kill().await;
                    return Err(RunnerError::Timeout(config.timeout_seconds));
                }
            }
        } else {
            child.wait().await?
        };

        let stdout = stdout_task
            .await
            .map_err(|e| RunnerError::ExecutionFailed(e.to_string()))?;
        let stderr = stderr_task
            .await
            .map_err(|e| RunnerError::ExecutionFailed(e.to_string()))?;
        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        let exit_code = status.code().unwrap_or(-1) as i64;

        if exit_code != 0 {
            error!("`{}` failed with exit code {} after {}ms", command, exit_code, duration_ms);
            if config.check {
                return Err(RunnerError::NonZeroExit {
                    command,
                    exit_code,
                    stderr: stderr.trim().to_string(),
                });
            }
        } else {
            debug!("`{}` completed in {}ms", command, duration_ms);
        }

        Ok(ExecutionResult {
            command,
            exit_code,
            stdout,
            stderr,
            started_at,
            finished_at,
            duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dry_run_mode() {
        let runner = CliRunner::new(CliRunnerOptions::new().dry_run());
        assert!(runner.is_dry_run());
    }

    #[test]
    fn test_ci_mode_detection() {
        let options = CliRunnerOptions::new().ci_mode();
        assert!(options.ci_mode);
    }

    #[tokio::test]
    async fn test_dry_run_does_not_spawn() {
        let runner = CliRunner::new(CliRunnerOptions::new().dry_run());
        let spec = CommandSpec::new("definitely-not-a-real-program").arg("--help");
        let result = runner.run(&spec, &RunConfig::default()).await.unwrap();
        assert!(result.success());
        assert_eq!(result.command, "definitely-not-a-real-program --help");
    }

    #[tokio::test]
    async fn test_missing_program_is_reported() {
        let runner = CliRunner::default();
        let spec = CommandSpec::new("definitely-not-a-real-program");
        let result = runner.run(&spec, &RunConfig::default()).await;
        assert!(matches!(result, Err(RunnerError::ProgramNotAvailable(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_is_forwarded() {
        let runner = CliRunner::default();
        let spec = CommandSpec::new("cat").stdin("hello\n");
        let result = runner.run(&spec, &RunConfig::default()).await.unwrap();
        assert_eq!(result.stdout, "hello\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unchecked_returns_exit_code() {
        let runner = CliRunner::default();
        let spec = CommandSpec::new("sh").args(["-c", "exit 3"]);
        let result = runner
            .run(&spec, &RunConfig::default().unchecked())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);

        let checked = runner.run(&spec, &RunConfig::default()).await;
        assert!(matches!(checked, Err(RunnerError::NonZeroExit { exit_code: 3, .. })));
    }
}
