// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Functionality common to all Windows guests.

use std::time::Duration;

use base64::Engine;

use super::{CommandSequence, CommandSequenceEntry, Credentials, GuestOs};

pub(super) struct Windows;

const PROMPT: &str = "GCPROMPT>";

fn establish_prompt() -> CommandSequenceEntry {
    CommandSequenceEntry::EstablishPrompt {
        // `$G` expands to `>`, so the echo of this command doesn't contain
        // the prompt.
        send: "prompt GCPROMPT$G".into(),
        expect: PROMPT.into(),
        interval: Duration::from_secs(2),
    }
}

impl GuestOs for Windows {
    /// Logs in through the Special Administration Console (SAC): open a cmd
    /// channel, switch to it and authenticate.
    ///
    /// The VM discards console output it has seen before a reboot, so every
    /// string waited for here comes from the current boot.
    fn serial_login_sequence(&self, creds: &Credentials) -> CommandSequence {
        CommandSequence(vec![
            CommandSequenceEntry::wait_for(
                "EVENT: The CMD command is now available.",
            ),
            CommandSequenceEntry::wait_for("SAC>"),
            CommandSequenceEntry::write_str("cmd"),
            CommandSequenceEntry::wait_for("Channel: Cmd0001"),
            CommandSequenceEntry::wait_for("SAC>"),
            CommandSequenceEntry::write_str("ch -sn Cmd0001"),
            CommandSequenceEntry::wait_for(
                "Use any other key to view this channel.",
            ),
            CommandSequenceEntry::write_str(""),
            CommandSequenceEntry::wait_for("Username:"),
            CommandSequenceEntry::write_str(creds.username.clone()),
            CommandSequenceEntry::wait_for("Domain  :"),
            CommandSequenceEntry::write_str(""),
            CommandSequenceEntry::wait_for("Password:"),
            CommandSequenceEntry::write_str(creds.password.clone()),
            CommandSequenceEntry::wait_for("C:\\Windows\\system32>"),
            establish_prompt(),
        ])
    }

    /// The remote shell server hands out an authenticated cmd.exe directly.
    fn network_login_sequence(&self) -> CommandSequence {
        CommandSequence(vec![
            CommandSequenceEntry::wait_for(">"),
            establish_prompt(),
        ])
    }

    fn shell_prompt(&self) -> &'static str {
        PROMPT
    }

    fn status_command(&self) -> &'static str {
        "echo %errorlevel%"
    }

    fn line_ending(&self) -> &'static str {
        "\r\n"
    }

    fn reboot_command(&self) -> &'static str {
        "shutdown /r /f /t 0"
    }
}

/// Wraps `script` in a `powershell -EncodedCommand` invocation.
///
/// Use Powershell's -EncodedCommand switch to keep important Powershell
/// sigils in the command (like "$") from being interpreted by cmd.exe. This
/// switch expects that the encoded string will decode into a UTF-16LE
/// string, so switch encodings before converting to base64.
pub(crate) fn encode_powershell(script: &str) -> String {
    let utf16le: Vec<u8> =
        script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    let base64 = base64::engine::general_purpose::STANDARD.encode(utf16le);
    format!("powershell -EncodedCommand {base64}")
}
