// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest sessions: stateful command channels into a running guest.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, info_span, Instrument};

use crate::{
    check::Check,
    error::{GuestCommandFailed, ScriptError},
    guest_os::{
        encode_powershell, get_guest_os_adapter, CommandSequence,
        CommandSequenceEntry, GuestOs, GuestOsKind,
    },
    serial::Console,
};

/// The timeout guest commands get when a test doesn't choose one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// How long to wait for the shell to echo a command back.
const ECHO_TIMEOUT: Duration = Duration::from_secs(15);

/// How long to wait for the exit status of a completed command.
const STATUS_TIMEOUT: Duration = Duration::from_secs(30);

/// Counts the boots of a VM. Sessions remember the boot they were opened in
/// and refuse to run commands once the VM has rebooted.
#[derive(Clone, Debug, Default)]
pub struct BootEpoch(Arc<AtomicU64>);

impl BootEpoch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Records a reboot and returns the new epoch.
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn check(
        &self,
        session: &str,
        opened_at: u64,
    ) -> Result<(), ScriptError> {
        let current = self.current();
        if current == opened_at {
            Ok(())
        } else {
            Err(ScriptError::StaleSession {
                session: session.to_owned(),
                opened_at,
                current,
            })
        }
    }
}

/// How a session reaches the guest's shell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginTransport {
    Serial,
    Network,
}

/// A command channel into a guest.
///
/// A session runs one command at a time. Every command is bounded by a
/// timeout; when it expires the command fails with a [`GuestCommandFailed`]
/// that carries no exit status.
#[async_trait]
pub trait GuestSession: Send + Sync {
    fn name(&self) -> &str;

    fn os(&self) -> GuestOsKind;

    fn transport(&self) -> LoginTransport;

    /// Runs `cmd` and returns its exit status and output. A non-zero status
    /// is not an error.
    async fn cmd_status_output(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<(i32, String)>;

    /// Writes `text` and a line ending without waiting for the command to
    /// finish or collecting its status.
    async fn sendline(&self, text: &str) -> Result<()>;

    /// Returns false once the transport under this session has gone away,
    /// e.g. because the guest shut down.
    async fn is_connected(&self) -> bool;

    /// Closes the session. Later commands fail.
    async fn close(&self) -> Result<()>;

    async fn cmd_output(&self, cmd: &str, timeout: Duration) -> Result<String> {
        Ok(self.cmd_status_output(cmd, timeout).await?.1)
    }

    async fn cmd_status(&self, cmd: &str, timeout: Duration) -> Result<i32> {
        Ok(self.cmd_status_output(cmd, timeout).await?.0)
    }

    /// Runs `cmd` and fails with [`GuestCommandFailed`] if it exits
    /// non-zero.
    async fn cmd(&self, cmd: &str, timeout: Duration) -> Result<String> {
        let (status, output) = self.cmd_status_output(cmd, timeout).await?;
        if status != 0 {
            return Err(GuestCommandFailed {
                command: cmd.to_owned(),
                timeout,
                status: Some(status),
                output,
            }
            .into());
        }
        Ok(output)
    }

    /// Like [`GuestSession::cmd`], but also fails if the output does not
    /// satisfy `check`.
    async fn cmd_expect(
        &self,
        cmd: &str,
        timeout: Duration,
        check: &Check,
    ) -> Result<String> {
        let output = self.cmd(cmd, timeout).await?;
        if !check.holds(&output) {
            return Err(GuestCommandFailed {
                command: cmd.to_owned(),
                timeout,
                status: Some(0),
                output: format!(
                    "output does not show that {}: {output}",
                    check.intent()
                ),
            }
            .into());
        }
        Ok(output)
    }

    /// Runs a PowerShell script through `powershell -EncodedCommand`.
    async fn powershell(
        &self,
        script: &str,
        timeout: Duration,
    ) -> Result<(i32, String)> {
        info!(script, "executing Powershell command");
        self.cmd_status_output(&encode_powershell(script), timeout).await
    }
}

/// A session driven over an interactive console.
pub(crate) struct ConsoleSession {
    name: String,
    kind: GuestOsKind,
    guest_os: Box<dyn GuestOs>,
    transport: LoginTransport,

    /// `None` once the session is closed. The lock also keeps commands from
    /// interleaving.
    console: tokio::sync::Mutex<Option<Arc<Console>>>,
    epoch: BootEpoch,
    opened_at: u64,
}

impl ConsoleSession {
    /// Wraps a console whose shell is already at the prompt.
    pub(crate) fn new(
        name: String,
        kind: GuestOsKind,
        transport: LoginTransport,
        console: Arc<Console>,
        epoch: BootEpoch,
    ) -> Self {
        let opened_at = epoch.current();
        Self {
            name,
            kind,
            guest_os: get_guest_os_adapter(kind),
            transport,
            console: tokio::sync::Mutex::new(Some(console)),
            epoch,
            opened_at,
        }
    }

    /// Sends `cmd`, consumes its echo, submits it and returns everything
    /// printed before the next prompt.
    async fn exchange(
        &self,
        console: &Console,
        cmd: &str,
        timeout: Duration,
    ) -> Result<String> {
        let echo = self.guest_os.echo_of(cmd);
        console.send_str(cmd.trim_end()).await?;
        console.wait_for(&echo, ECHO_TIMEOUT).await?;
        console.send_str(self.guest_os.line_ending()).await?;
        let out =
            console.wait_for(self.guest_os.shell_prompt(), timeout).await?;

        // Trim the newline echoed when the command was submitted.
        Ok(out.trim().to_string())
    }
}

fn parse_status(raw: &str) -> Result<i32> {
    raw.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| anyhow!("no exit status printed"))?
        .parse()
        .with_context(|| format!("unparseable exit status {raw:?}"))
}

#[async_trait]
impl GuestSession for ConsoleSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn os(&self) -> GuestOsKind {
        self.kind
    }

    fn transport(&self) -> LoginTransport {
        self.transport
    }

    async fn cmd_status_output(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<(i32, String)> {
        let guard = self.console.lock().await;
        let console = guard
            .as_ref()
            .ok_or_else(|| anyhow!("session {} is closed", self.name))?;
        self.epoch.check(&self.name, self.opened_at)?;

        debug!(session = %self.name, cmd, ?timeout, "running guest command");
        let output = match self.exchange(console, cmd, timeout).await {
            Ok(output) => output,
            Err(e) => {
                return Err(GuestCommandFailed {
                    command: cmd.to_owned(),
                    timeout,
                    status: None,
                    output: format!("{e:#}"),
                }
                .into())
            }
        };

        let raw_status = self
            .exchange(console, self.guest_os.status_command(), STATUS_TIMEOUT)
            .await
            .with_context(|| format!("reading exit status of `{cmd}`"))?;
        let status = parse_status(&raw_status)?;
        debug!(session = %self.name, status, %output, "guest command finished");
        Ok((status, output))
    }

    async fn sendline(&self, text: &str) -> Result<()> {
        let guard = self.console.lock().await;
        let console = guard
            .as_ref()
            .ok_or_else(|| anyhow!("session {} is closed", self.name))?;
        self.epoch.check(&self.name, self.opened_at)?;
        console.send_str(text).await?;
        console.send_str(self.guest_os.line_ending()).await
    }

    async fn is_connected(&self) -> bool {
        self.console
            .lock()
            .await
            .as_ref()
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    async fn close(&self) -> Result<()> {
        if self.console.lock().await.take().is_some() {
            info!(session = %self.name, "closed guest session");
        }
        Ok(())
    }
}

/// Plays `sequence` against `console`, giving up after `timeout`. On
/// success the console's buffered output is discarded so that the first
/// command starts clean.
pub(crate) async fn run_login_sequence(
    console: &Console,
    kind: GuestOsKind,
    sequence: CommandSequence,
    timeout: Duration,
) -> Result<()> {
    let guest_os = get_guest_os_adapter(kind);
    let line_ending = guest_os.line_ending();
    let play = async {
        for step in sequence.0 {
            debug!(?step, "executing command in login sequence");
            match step {
                CommandSequenceEntry::WaitFor(s) => {
                    console.wait_for(&s, Duration::MAX).await?;
                }
                CommandSequenceEntry::WriteStr(s) => {
                    console.send_str(&s).await?;
                    console.send_str(line_ending).await?;
                }
                CommandSequenceEntry::EstablishPrompt {
                    send,
                    expect,
                    interval,
                } => loop {
                    console.send_str(&send).await?;
                    console.send_str(line_ending).await?;
                    if console.wait_for(&expect, interval).await.is_ok() {
                        break;
                    }
                },
            }
        }
        Ok::<(), anyhow::Error>(())
    };

    tokio::time::timeout(timeout, play.instrument(info_span!("login")))
        .await
        .map_err(|_| {
            anyhow!("guest did not reach a shell prompt within {timeout:?}")
        })??;

    console.clear();
    Ok(())
}
