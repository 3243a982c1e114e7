// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest OS adaptations for Linux guests with a getty on the serial console
//! and an SSH server.

use std::time::Duration;

use super::{
    CommandSequence, CommandSequenceEntry, Credentials, GuestOs,
};

pub(super) struct Linux;

const PROMPT: &str = "[gc]# ";

/// Widens the terminal so that long commands echo on one line, then installs
/// the fixed prompt. The prompt is split into two quoted pieces so that the
/// echo of this command never matches the prompt itself.
const SHELL_SETUP: &str =
    "stty cols 9999; unset PROMPT_COMMAND; export TERM=dumb; PS1='[gc]''# '";

fn establish_prompt() -> CommandSequenceEntry {
    CommandSequenceEntry::EstablishPrompt {
        send: SHELL_SETUP.into(),
        expect: PROMPT.into(),
        interval: Duration::from_secs(3),
    }
}

impl GuestOs for Linux {
    fn serial_login_sequence(&self, creds: &Credentials) -> CommandSequence {
        CommandSequence(vec![
            // Nudge getty into reprinting its prompt in case the original was
            // consumed by an earlier wait.
            CommandSequenceEntry::write_str(""),
            CommandSequenceEntry::wait_for("login: "),
            CommandSequenceEntry::write_str(creds.username.clone()),
            CommandSequenceEntry::wait_for("Password: "),
            CommandSequenceEntry::write_str(creds.password.clone()),
            establish_prompt(),
        ])
    }

    fn network_login_sequence(&self) -> CommandSequence {
        CommandSequence(vec![establish_prompt()])
    }

    fn shell_prompt(&self) -> &'static str {
        PROMPT
    }

    fn status_command(&self) -> &'static str {
        "echo $?"
    }

    fn line_ending(&self) -> &'static str {
        "\n"
    }

    fn reboot_command(&self) -> &'static str {
        "shutdown -r now"
    }

    // Continuation lines of a multi-line command are echoed after the
    // secondary prompt.
    fn echo_of(&self, cmd: &str) -> String {
        cmd.trim_end().replace('\n', "\n> ")
    }
}
