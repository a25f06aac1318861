//! External tool invocations.
//!
//! Bluetooth control, git and fallback audio players are opaque
//! subprocesses: exit status and captured output are the only signal.

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Best single-line description of a failure for status lines.
    pub fn failure_detail(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        match (self.code, text.lines().last()) {
            (Some(code), Some(line)) => format!("exit {code}: {line}"),
            (Some(code), None) => format!("exit {code}"),
            (None, Some(line)) => format!("terminated: {line}"),
            (None, None) => "terminated by signal".to_string(),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` to completion. `Err` only when it could not be spawned.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> std::io::Result<CommandOutput>;
}

pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> std::io::Result<CommandOutput> {
        debug!("Running {program} {}", args.join(" "));

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args).kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Build an owned argument list from string literals.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
