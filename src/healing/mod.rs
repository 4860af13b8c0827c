//! Session Self-Healing
//!
//! Periodically checks the iSCSI sessions behind published volumes, repairs
//! sessions that have stayed unhealthy past the wait window, and makes sure
//! encrypted volumes on healthy sessions are open.

pub mod iscsi;
pub mod luks;
pub mod self_healing;

pub use iscsi::*;
pub use luks::*;
pub use self_healing::*;

use crate::error::{Error, Result};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Exit status and captured output of an external tool
#[derive(Debug, Clone)]
pub(crate) struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Run `program` to completion, optionally feeding `stdin`
///
/// A non-zero exit is returned as output, not as an error; only failing to
/// spawn the process is an error.
pub(crate) async fn run_command(
    program: &str,
    args: &[&str],
    stdin: Option<&str>,
) -> Result<CommandOutput> {
    debug!("Running {} {}", program, args.join(" "));

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Command {
            command: program.to_string(),
            reason: e.to_string(),
        })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .await
            .map_err(|e| Error::Command {
                command: program.to_string(),
                reason: format!("writing stdin: {}", e),
            })?;
    }

    let output = child.wait_with_output().await.map_err(|e| Error::Command {
        command: program.to_string(),
        reason: e.to_string(),
    })?;

    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
