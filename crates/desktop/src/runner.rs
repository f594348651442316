//! Supervised capture child processes.
//!
//! Encoders are opaque external programs. Each one runs under a
//! [`ProgramRunner`] that pipes its output into the log, restarts it a
//! bounded number of times, and guarantees the child dies with us
//! (`kill_on_drop`).

use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ProgramRunner {
    pub program: String,
    pub args: Vec<String>,
    pub max_retries: u32,
    pub inter_run_delay: Duration,
}

impl ProgramRunner {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self {
            program,
            args,
            max_retries: 0,
            inter_run_delay: Duration::ZERO,
        }
    }

    pub fn command_line(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }

    /// Run the program until it exhausts its retries or the token fires.
    /// Cancellation is a clean result; the child is killed on the way out.
    pub async fn run(&self, name: &str, token: CancellationToken) -> anyhow::Result<()> {
        let mut tries = 0u32;
        loop {
            if token.is_cancelled() {
                return Ok(());
            }
            info!(program = %self.command_line(), source = name, "launching capture program");
            let result = self.launch(name, &token).await;
            match &result {
                Ok(status) if token.is_cancelled() => {
                    info!(source = name, ?status, "capture program stopped for shutdown");
                    return Ok(());
                }
                Ok(status) => warn!(source = name, ?status, "capture program exited"),
                Err(e) => error!(source = name, "capture program failed: {e:#}"),
            }
            if tries >= self.max_retries {
                result.with_context(|| format!("capture program {} could not run", self.program))?;
                anyhow::bail!(
                    "capture program {} exited and has no retries left",
                    self.program
                );
            }
            tries += 1;
            if !self.inter_run_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.inter_run_delay) => {}
                    _ = token.cancelled() => return Ok(()),
                }
            }
        }
    }

    async fn launch(
        &self,
        name: &str,
        token: &CancellationToken,
    ) -> anyhow::Result<std::process::ExitStatus> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program))?;

        if let Some(stdout) = child.stdout.take() {
            spawn_log_forwarder(name.to_string(), stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_forwarder(name.to_string(), stderr, true);
        }

        tokio::select! {
            status = child.wait() => Ok(status.context("waiting on capture program")?),
            _ = token.cancelled() => {
                let _ = child.start_kill();
                Ok(child.wait().await.context("waiting on killed capture program")?)
            }
        }
    }
}

fn spawn_log_forwarder(
    name: String,
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    is_stderr: bool,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                warn!(source = %name, "{line}");
            } else {
                info!(source = %name, "{line}");
            }
        }
    });
}

/// Replace a `{placeholder}` token in an argument list.
pub fn substitute(args: &[String], placeholder: &str, value: &str) -> Vec<String> {
    args.iter()
        .map(|arg| arg.replace(placeholder, value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitute_replaces_embedded_tokens() {
        let args = vec![
            "-f".to_string(),
            "{path}".to_string(),
            "location={path}".to_string(),
            "-r".to_string(),
        ];
        let out = substitute(&args, "{path}", "/tmp/pipe.h264");
        assert_eq!(
            out,
            vec!["-f", "/tmp/pipe.h264", "location=/tmp/pipe.h264", "-r"]
        );
    }

    #[test]
    fn substitute_leaves_other_placeholders() {
        let args = vec!["{port}".to_string(), "{path}".to_string()];
        let out = substitute(&args, "{port}", "5004");
        assert_eq!(out, vec!["5004", "{path}"]);
    }

    #[test]
    fn command_line_renders() {
        let runner = ProgramRunner::new("wf-recorder".into(), vec!["-m".into(), "h264".into()]);
        assert_eq!(runner.command_line(), "wf-recorder -m h264");
    }

    #[tokio::test]
    async fn exited_program_with_no_retries_is_an_error() {
        // The capture child ending means the stream ended; the source's
        // future must resolve with an error so the mixer sees EOF.
        let runner = ProgramRunner::new("true".into(), vec![]);
        let result = runner.run("test", CancellationToken::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn retries_rerun_the_program() {
        let mut runner = ProgramRunner::new("true".into(), vec![]);
        runner.max_retries = 2;
        let start = std::time::Instant::now();
        let result = runner.run("test", CancellationToken::new()).await;
        // Three runs total, then the no-retries-left error.
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_stops_long_running_program() {
        let runner = ProgramRunner::new("sleep".into(), vec!["30".into()]);
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let start = std::time::Instant::now();
        runner.run("test", token).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_program_errors_out() {
        let runner = ProgramRunner::new("padcast-no-such-program".into(), vec![]);
        let result = runner.run("test", CancellationToken::new()).await;
        assert!(result.is_err());
    }
}
