use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::host::ExecOutput;

#[async_trait]
pub trait CaptureOutput {
    /// Run to completion, capturing the exit code and both output streams.
    /// A non-zero exit code is not an error; being killed by a signal is.
    async fn capture_output(&mut self) -> Result<ExecOutput>;
}

#[async_trait]
impl CaptureOutput for Command {
    async fn capture_output(&mut self) -> Result<ExecOutput> {
        // reset all locale settings for this command, we parse its output
        self.env("LC_ALL", "C");

        tracing::trace!(cmd=?self.as_std(), "run external cmd");

        let output = async {
            self.stdin(Stdio::null());
            self.stdout(Stdio::piped());
            self.stderr(Stdio::piped());

            let child = self.kill_on_drop(true).spawn()?;
            child.wait_with_output().await.map_err(anyhow::Error::from)
        }
        .await
        .with_context(|| format!("Failed to execute external command: {:?}", self.as_std()))?;

        let code = output.status.code().ok_or_else(|| {
            anyhow!(
                "cmd: {:?} killed by signal\nstderr: {}",
                self.as_std(),
                multi_line(&String::from_utf8_lossy(&output.stderr))
            )
        })?;
        if code != 0 {
            tracing::debug!(
                cmd = ?self.as_std(),
                code,
                stderr = %multi_line(&String::from_utf8_lossy(&output.stderr)),
                "external cmd failed"
            );
        }

        Ok(ExecOutput {
            code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

fn multi_line(s: &str) -> String {
    if s.contains('\n') {
        format!("(multi-line)\n\t{}", s.trim_end().replace('\n', "\n\t"))
    } else {
        s.to_owned()
    }
}
