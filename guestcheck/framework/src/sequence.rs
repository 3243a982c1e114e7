// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ordered guest command steps, each checked against its output.
//!
//! Steps depend on each other (a directory created by one is copied into by
//! the next), so the first step that fails stops the sequence.

use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::{
    check::Check,
    error::GuestCommandFailed,
    params::Params,
    reporter::Reporter,
    session::{GuestSession, DEFAULT_TIMEOUT},
};

/// What a failed step does to the test.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Severity {
    /// The behavior under test is wrong: abort and report FAIL.
    Fail,

    /// The environment could not be set up: abort and report ERROR.
    Error,

    /// The command always runs and its output is logged, but the check is
    /// only enforced (as [`Severity::Fail`]) when the parameter `toggle` is
    /// `yes`. Toggles are off unless set.
    Soft { toggle: String },
}

impl Severity {
    pub fn soft(toggle: impl Into<String>) -> Self {
        Self::Soft { toggle: toggle.into() }
    }
}

#[derive(Clone, Debug)]
pub struct Step {
    pub description: String,
    pub command: String,
    pub check: Check,
    pub severity: Severity,
    pub timeout: Duration,

    /// Whether a non-zero exit status fails the step.
    pub require_success: bool,
}

impl Step {
    pub fn new(
        description: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            description: description.into(),
            command: command.into(),
            check: Check::any(),
            severity: Severity::Fail,
            timeout: DEFAULT_TIMEOUT,
            require_success: true,
        }
    }

    pub fn expect(mut self, check: Check) -> Self {
        self.check = check;
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Judges the step by its output alone.
    pub fn ignore_status(mut self) -> Self {
        self.require_success = false;
        self
    }
}

/// Runs steps against one session.
pub struct SequenceRunner<'a> {
    session: &'a dyn GuestSession,
    params: &'a Params,
    reporter: &'a Reporter,
}

impl<'a> SequenceRunner<'a> {
    pub fn new(
        session: &'a dyn GuestSession,
        params: &'a Params,
        reporter: &'a Reporter,
    ) -> Self {
        Self { session, params, reporter }
    }

    /// Runs one step and returns its output.
    pub async fn run_step(&self, step: &Step) -> Result<String> {
        self.reporter.context(&step.description);
        let result = self
            .session
            .cmd_status_output(&step.command, step.timeout)
            .await;
        let (reason, output) = match result {
            Ok((status, output)) if step.require_success && status != 0 => (
                format!("`{}` exited with status {status}", step.command),
                output,
            ),
            Ok((_, output)) if !step.check.holds(&output) => (
                format!("output does not show that {}", step.check.intent()),
                output,
            ),
            Ok((_, output)) => return Ok(output),
            // A timed out command is judged like a failed one; anything else
            // (a stale session, a dead console) is not the step's fault.
            Err(e) => match e.downcast::<GuestCommandFailed>() {
                Ok(failed) => (failed.to_string(), failed.output),
                Err(other) => return Err(other),
            },
        };

        let message =
            format!("{}: {reason}: {}", step.description, output.trim());
        match &step.severity {
            Severity::Fail => Err(self.reporter.fail(message)),
            Severity::Error => Err(self.reporter.error(message)),
            Severity::Soft { toggle } if self.params.get_bool(toggle) => {
                Err(self.reporter.fail(message))
            }
            Severity::Soft { toggle } => {
                warn!(toggle, %message, "soft check not enforced");
                self.reporter
                    .note(format!("not enforced ({toggle} is off): {message}"));
                Ok(output)
            }
        }
    }

    /// Runs `steps` in order, stopping at the first one that fails.
    pub async fn run(&self, steps: &[Step]) -> Result<Vec<String>> {
        let mut outputs = Vec::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            info!(
                step = i + 1,
                of = steps.len(),
                description = %step.description,
                "running step"
            );
            outputs.push(self.run_step(step).await?);
        }
        Ok(outputs)
    }
}
