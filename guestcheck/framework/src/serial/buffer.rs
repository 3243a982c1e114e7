// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A console buffer that keeps printable characters and newlines, drops
//! terminal control sequences, and satisfies waits for specific strings.

use std::io::{BufWriter, Write};

use anyhow::{Context, Result};
use camino::Utf8Path;
use termwiz::escape::parser::Parser;
use tokio::sync::oneshot;
use tracing::{error, trace};

/// A request to wait for a string to appear in console output.
pub(super) struct OutputWaiter {
    /// The string to wait for.
    pub(super) wanted: String,

    /// Receives every character that preceded the match.
    pub(super) preceding_tx: oneshot::Sender<String>,
}

pub(super) struct ConsoleBuffer {
    log: Option<BufWriter<std::fs::File>>,
    line_buffer: String,
    wait_buffer: String,
    waiter: Option<OutputWaiter>,
    parser: Parser,
}

impl ConsoleBuffer {
    /// Creates a buffer that mirrors every completed line to `log_path`, if
    /// one is supplied.
    pub(super) fn new(log_path: Option<&Utf8Path>) -> Result<Self> {
        let log = log_path
            .map(|path| {
                std::fs::File::create(path)
                    .with_context(|| format!("opening console log file {path}"))
                    .map(BufWriter::new)
            })
            .transpose()?;

        Ok(Self {
            log,
            line_buffer: String::new(),
            wait_buffer: String::new(),
            waiter: None,
            parser: Parser::new(),
        })
    }

    pub(super) fn process_bytes(&mut self, bytes: &[u8]) {
        use termwiz::escape::{Action, ControlCode};
        let actions = self.parser.parse_as_vec(bytes);
        for action in actions {
            match action {
                Action::Print(c) => self.push_character(c),
                Action::PrintString(s) => self.push_str(&s),
                Action::Control(ControlCode::LineFeed) => {
                    self.push_character('\n')
                }
                _ => {
                    trace!(?action, "console buffer ignored action");
                }
            }
        }
    }

    fn push_character(&mut self, c: char) {
        if c == '\n' {
            self.flush_line();
        } else {
            self.line_buffer.push(c);
        }

        self.wait_buffer.push(c);
        if let Some(waiter) = self.waiter.take() {
            self.satisfy_or_set_wait(waiter);
        }
    }

    fn push_str(&mut self, s: &str) {
        self.line_buffer.push_str(s);
        self.wait_buffer.push_str(s);
        if let Some(waiter) = self.waiter.take() {
            self.satisfy_or_set_wait(waiter);
        }
    }

    fn flush_line(&mut self) {
        if let Some(log) = self.log.as_mut() {
            let res = log
                .write_all(self.line_buffer.as_bytes())
                .and_then(|_| log.write_all(b"\n"))
                .and_then(|_| log.flush());
            if let Err(e) = res {
                error!(%e, "failed to write console log; disabling it");
                self.log = None;
            }
        }
        self.line_buffer.clear();
    }

    /// Satisfies `waiter` if the wait buffer already contains its string, or
    /// stores it to be checked as more output arrives.
    ///
    /// When the buffer contains the string, everything before the *last*
    /// match goes to the waiter, the match itself is discarded, and whatever
    /// follows the match stays buffered for the next wait.
    pub(super) fn register_wait(&mut self, waiter: OutputWaiter) {
        assert!(
            self.waiter.is_none(),
            "console supports only one outstanding wait"
        );
        self.satisfy_or_set_wait(waiter);
    }

    fn satisfy_or_set_wait(&mut self, waiter: OutputWaiter) {
        if let Some(idx) = self.wait_buffer.rfind(&waiter.wanted) {
            // The waiter may have timed out and dropped its receiver just as
            // the match arrived; there's nothing to do about that.
            let out = self.wait_buffer.drain(..idx).collect();
            let _ = waiter.preceding_tx.send(out);
            self.wait_buffer = self.wait_buffer.split_off(waiter.wanted.len());
        } else {
            self.waiter = Some(waiter);
        }
    }

    pub(super) fn cancel_wait(&mut self) -> Option<OutputWaiter> {
        self.waiter.take()
    }

    /// Discards everything buffered for waits so far.
    pub(super) fn clear(&mut self) {
        self.wait_buffer.clear();
    }
}

impl Drop for ConsoleBuffer {
    fn drop(&mut self) {
        if let Some(log) = self.log.as_mut() {
            if let Err(e) = log.flush() {
                error!(%e, "failed to flush console log during drop");
            }
        }
    }
}
