// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest-side storage benchmarks (fio, iozone).
//!
//! The tools themselves are consumed as-is; this module only installs them
//! when the params say how, runs them with test-supplied options and removes
//! whatever the install step left behind.

use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::{
    error::{GuestCommandFailed, WithCleanupErrors},
    guest_os::GuestOsKind,
    params::Params,
    reporter::Reporter,
    session::GuestSession,
    windows::set_winutils_letter,
};

const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);
const CLEAN_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BenchmarkTool {
    Fio,
    Iozone,
}

impl BenchmarkTool {
    pub fn name(self) -> &'static str {
        match self {
            BenchmarkTool::Fio => "fio",
            BenchmarkTool::Iozone => "iozone",
        }
    }

    fn default_executable(self, os: GuestOsKind) -> &'static str {
        match (self, os) {
            (BenchmarkTool::Fio, GuestOsKind::Linux) => "fio",
            (BenchmarkTool::Iozone, GuestOsKind::Linux) => "iozone",
            (BenchmarkTool::Fio, GuestOsKind::Windows) => {
                r#""C:\Program Files\fio\fio.exe""#
            }
            (BenchmarkTool::Iozone, GuestOsKind::Windows) => {
                r"WIN_UTILS\Iozone\iozone.exe"
            }
        }
    }
}

/// One benchmark tool as configured for a test.
///
/// Reads `<tool>_install_cmd` and `<tool>_clean_cmd` (both optional) and
/// `<tool>_path`, which defaults to the tool's usual location for the guest
/// OS. Windows commands may use the `WIN_UTILS` token.
#[derive(Clone, Debug)]
pub struct StorageBenchmark {
    tool: BenchmarkTool,
    os: GuestOsKind,
    install_cmd: Option<String>,
    executable: String,
    clean_cmd: Option<String>,
}

impl StorageBenchmark {
    pub fn from_params(
        tool: BenchmarkTool,
        os: GuestOsKind,
        params: &Params,
    ) -> Self {
        let name = tool.name();
        Self {
            tool,
            os,
            install_cmd: params.get(&format!("{name}_install_cmd")),
            executable: params.get_or(
                &format!("{name}_path"),
                tool.default_executable(os),
            ),
            clean_cmd: params.get(&format!("{name}_clean_cmd")),
        }
    }

    async fn resolve(
        &self,
        session: &dyn GuestSession,
        cmd: &str,
    ) -> Result<String> {
        match self.os {
            GuestOsKind::Windows => set_winutils_letter(session, cmd).await,
            GuestOsKind::Linux => Ok(cmd.to_owned()),
        }
    }

    /// Installs the tool. A failed install is an environment error.
    pub async fn install(
        &self,
        session: &dyn GuestSession,
        reporter: &Reporter,
    ) -> Result<()> {
        let Some(cmd) = &self.install_cmd else {
            return Ok(());
        };
        reporter.context(format!("Install {}", self.tool.name()));
        let cmd = self.resolve(session, cmd).await?;
        session
            .cmd(&cmd, INSTALL_TIMEOUT)
            .await
            .map_err(|e| reporter.error(format!("{e:#}")))?;
        Ok(())
    }

    /// Runs the tool with `options`. A non-zero exit or a run that outlasts
    /// `timeout` fails the test.
    pub async fn run(
        &self,
        session: &dyn GuestSession,
        options: &str,
        timeout: Duration,
        reporter: &Reporter,
    ) -> Result<String> {
        let name = self.tool.name();
        reporter.context(format!("Run {name} {options}"));
        let cmd = self
            .resolve(session, &format!("{} {options}", self.executable))
            .await?;
        info!(tool = name, %cmd, "starting benchmark");
        let (status, output) =
            match session.cmd_status_output(&cmd, timeout).await {
                Ok(done) => done,
                Err(e) => {
                    return match e.downcast::<GuestCommandFailed>() {
                        Ok(failed) => Err(reporter
                            .fail(format!("{name} did not finish: {failed}"))),
                        Err(other) => Err(other),
                    }
                }
            };
        if status != 0 {
            return Err(reporter.fail(format!(
                "{name} exited with status {status}: {}",
                output.trim()
            )));
        }
        Ok(output)
    }

    pub async fn clean(&self, session: &dyn GuestSession) -> Result<()> {
        let Some(cmd) = &self.clean_cmd else {
            return Ok(());
        };
        let cmd = self.resolve(session, cmd).await?;
        session.cmd(&cmd, CLEAN_TIMEOUT).await?;
        Ok(())
    }

    /// Installs, runs and cleans up. Cleaning happens even when the run
    /// fails, and a cleaning failure never hides the run's.
    pub async fn execute(
        &self,
        session: &dyn GuestSession,
        options: &str,
        timeout: Duration,
        reporter: &Reporter,
    ) -> Result<String> {
        self.install(session, reporter).await?;
        let result = self.run(session, options, timeout, reporter).await;
        let cleaned = self.clean(session).await;
        match (result, cleaned) {
            (Ok(output), Ok(())) => Ok(output),
            (Ok(_), Err(e)) | (Err(e), Ok(())) => Err(e),
            (Err(primary), Err(cleanup)) => {
                warn!(
                    tool = self.tool.name(),
                    error = %format!("{cleanup:#}"),
                    "clean failed"
                );
                Err(WithCleanupErrors {
                    primary,
                    cleanup: vec![format!("{cleanup:#}")],
                }
                .into())
            }
        }
    }
}
