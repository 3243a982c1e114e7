// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Traits and objects that abstract over differences between guest operating
//! systems.

use std::{borrow::Cow, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::params::Params;

mod linux;
mod windows;

pub(crate) use windows::encode_powershell;

/// An entry in a sequence of interactions with a guest console.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum CommandSequenceEntry {
    /// Wait for the supplied string to appear on the console.
    WaitFor(Cow<'static, str>),

    /// Write the specified string, followed by the guest's line ending.
    WriteStr(Cow<'static, str>),

    /// Repeatedly send `send` until `expect` appears, waiting up to
    /// `interval` after each attempt. Used where characters typed too early
    /// may be discarded by the guest.
    EstablishPrompt {
        send: Cow<'static, str>,
        expect: Cow<'static, str>,
        interval: Duration,
    },
}

impl CommandSequenceEntry {
    pub(crate) fn wait_for(s: impl Into<Cow<'static, str>>) -> Self {
        Self::WaitFor(s.into())
    }

    pub(crate) fn write_str(s: impl Into<Cow<'static, str>>) -> Self {
        Self::WriteStr(s.into())
    }
}

#[derive(Clone, Debug)]
pub(crate) struct CommandSequence(pub Vec<CommandSequenceEntry>);

/// Login credentials for a guest account.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Reads `username` and `password`, falling back to the conventional
    /// administrator account for `kind`.
    pub fn from_params(params: &Params, kind: GuestOsKind) -> Self {
        let default_user = match kind {
            GuestOsKind::Linux => "root",
            GuestOsKind::Windows => "Administrator",
        };
        Self {
            username: params.get_or("username", default_user),
            password: params.get_or("password", ""),
        }
    }
}

pub(crate) trait GuestOs: Send + Sync {
    /// The sequence that logs into a shell on the VM's serial console.
    fn serial_login_sequence(&self, creds: &Credentials) -> CommandSequence;

    /// The sequence that turns a fresh network shell connection into a
    /// shell with a known prompt.
    fn network_login_sequence(&self) -> CommandSequence;

    /// The prompt the login sequences install. It does not depend on the
    /// current directory.
    fn shell_prompt(&self) -> &'static str;

    /// The command that prints the exit status of the previous command.
    fn status_command(&self) -> &'static str;

    fn line_ending(&self) -> &'static str;

    fn reboot_command(&self) -> &'static str;

    /// Returns the text the shell echoes when `cmd` is typed.
    fn echo_of(&self, cmd: &str) -> String {
        cmd.to_owned()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestOsKind {
    Linux,
    Windows,
}

impl GuestOsKind {
    pub fn is_windows(&self) -> bool {
        matches!(self, GuestOsKind::Windows)
    }

    pub fn from_params(params: &Params) -> Result<Self, crate::ScriptError> {
        params
            .get_or("os_type", "linux")
            .parse()
            .map_err(|e: std::io::Error| {
                crate::ScriptError::config(e.to_string())
            })
    }
}

impl FromStr for GuestOsKind {
    type Err = std::io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linux" => Ok(Self::Linux),
            "windows" => Ok(Self::Windows),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Unrecognized guest OS kind {}", s),
            )),
        }
    }
}

pub(crate) fn get_guest_os_adapter(kind: GuestOsKind) -> Box<dyn GuestOs> {
    match kind {
        GuestOsKind::Linux => Box::new(linux::Linux),
        GuestOsKind::Windows => Box::new(windows::Windows),
    }
}
