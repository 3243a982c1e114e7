// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The error taxonomy shared by the framework and the scripted tests.
//!
//! Test bodies propagate `anyhow::Error`s. The verdict a test receives is
//! decided by looking for one of the typed errors defined here anywhere in
//! the error's chain; see [`classify`].

use std::time::Duration;

use thiserror::Error;

/// The reportable outcome class of a failed test run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The behavior under test is wrong.
    Fail,

    /// The test could not meaningfully run: bad configuration, a broken host
    /// environment, or misuse of the framework.
    Error,

    /// The test decided it cannot produce a pass/fail result.
    Skip,
}

#[derive(Debug, Error)]
pub enum ScriptError {
    /// A required parameter or external prerequisite is missing.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An expected guest-observable outcome did not occur.
    #[error("{message}{}", context_suffix(.context))]
    Assertion { message: String, context: Option<String> },

    /// Setup or teardown of auxiliary resources failed for reasons unrelated
    /// to the behavior under test.
    #[error("environment error: {message}{}", context_suffix(.context))]
    Environment { message: String, context: Option<String> },

    /// A command was sent to a session that was opened before its VM
    /// rebooted.
    #[error(
        "session {session} is stale: opened at boot {opened_at}, VM is now at \
        boot {current}"
    )]
    StaleSession { session: String, opened_at: u64, current: u64 },

    #[error("test skipped: {0}")]
    Skipped(String),
}

fn context_suffix(context: &Option<String>) -> String {
    match context {
        Some(ctx) => format!(" (context: {ctx})"),
        None => String::new(),
    }
}

impl ScriptError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn environment(msg: impl Into<String>) -> Self {
        Self::Environment { message: msg.into(), context: None }
    }

    pub fn verdict(&self) -> Verdict {
        match self {
            ScriptError::Assertion { .. } => Verdict::Fail,
            ScriptError::Skipped(_) => Verdict::Skip,
            ScriptError::Configuration(_)
            | ScriptError::Environment { .. }
            | ScriptError::StaleSession { .. } => Verdict::Error,
        }
    }
}

/// Signalled by the command execution helper when a guest command exits with
/// a non-zero status, times out, or produces output that fails a required
/// check. Callers decide whether this is fatal; if it escapes a test
/// unconverted the test reports ERROR.
#[derive(Debug, Error)]
#[error(
    "guest command `{command}` failed ({}, timeout {timeout:?}): {output}",
    status_text(.status)
)]
pub struct GuestCommandFailed {
    pub command: String,
    pub timeout: Duration,

    /// The exit status, or `None` if the command did not complete.
    pub status: Option<i32>,
    pub output: String,
}

fn status_text(status: &Option<i32>) -> String {
    match status {
        Some(s) => format!("status {s}"),
        None => "no status".to_string(),
    }
}

/// Signalled by the host shell helper when a host command exits with a
/// non-zero status.
#[derive(Debug, Error)]
#[error("host command `{command}` exited with status {status}: {stderr}")]
pub struct HostCommandFailed {
    pub command: String,
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// The primary error of a test run together with the errors raised while
/// releasing its resources. Displays the primary error first so that the
/// original cause stays the reported one.
#[derive(Debug)]
pub struct WithCleanupErrors {
    pub primary: anyhow::Error,
    pub cleanup: Vec<String>,
}

impl std::fmt::Display for WithCleanupErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#}", self.primary)?;
        for e in &self.cleanup {
            write!(f, "\n    cleanup error: {e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for WithCleanupErrors {}

/// Decides which verdict a test that returned `err` should receive.
///
/// Errors that carry none of the framework's typed errors are treated as
/// test errors: something the script did not anticipate went wrong.
pub fn classify(err: &anyhow::Error) -> Verdict {
    if let Some(wrapped) = err.downcast_ref::<WithCleanupErrors>() {
        return classify(&wrapped.primary);
    }

    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<ScriptError>() {
            return e.verdict();
        }
    }

    Verdict::Error
}
