// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running commands on the host that runs the tests.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{HostCommandFailed, ScriptError};

/// The captured result of a host command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl HostOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Executes shell command lines on the host.
///
/// This is a trait so that tests of resource setup and teardown can observe
/// the exact commands issued without touching the real host.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostShell: Send + Sync {
    /// Runs `command` with `sh -c` and waits up to `timeout` for it to exit.
    /// A non-zero exit status is not an error; failing to launch the command
    /// or exceeding the timeout is.
    async fn run(
        &self,
        command: &str,
        timeout: Duration,
    ) -> anyhow::Result<HostOutput>;
}

/// Runs `command` and fails with [`HostCommandFailed`] if it exits non-zero.
/// Returns the command's stdout on success.
pub async fn system(
    host: &dyn HostShell,
    command: &str,
    timeout: Duration,
) -> anyhow::Result<String> {
    let out = host.run(command, timeout).await?;
    if out.success() {
        Ok(out.stdout)
    } else {
        Err(HostCommandFailed {
            command: command.to_owned(),
            status: out.status,
            stdout: out.stdout,
            stderr: out.stderr,
        }
        .into())
    }
}

/// Like [`system`], but converts a failure into an environment error so
/// that a test that cannot prepare the host reports ERROR.
pub async fn prepare(
    host: &dyn HostShell,
    command: &str,
    timeout: Duration,
) -> anyhow::Result<String> {
    system(host, command, timeout).await.map_err(|e| {
        ScriptError::environment(format!("host setup failed: {e:#}")).into()
    })
}

/// The shell of the machine this process runs on.
#[derive(Debug, Default)]
pub struct LocalHost;

#[async_trait]
impl HostShell for LocalHost {
    async fn run(
        &self,
        command: &str,
        timeout: Duration,
    ) -> anyhow::Result<HostOutput> {
        info!(command, ?timeout, "running host command");
        let child = Command::new("sh")
            .args(["-c", command])
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(timeout, child)
            .await
            .with_context(|| {
                format!("host command `{command}` timed out after {timeout:?}")
            })?
            .with_context(|| format!("launching host command `{command}`"))?;

        let out = HostOutput {
            // A command killed by a signal has no exit code; report it the way
            // shells do.
            status: output.status.code().unwrap_or(128),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        debug!(
            command,
            status = out.status,
            stdout = %out.stdout,
            stderr = %out.stderr,
            "host command finished"
        );
        Ok(out)
    }
}
