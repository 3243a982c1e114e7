// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The test-report sink handed to each test.
//!
//! The reporter tracks the step a test is currently performing (its "error
//! context") so that failures raised during that step name it, and collects
//! free-text diagnostic lines that end up in the test's final message.

use std::sync::Mutex;

use tracing::info;

use crate::error::ScriptError;

#[derive(Debug, Default)]
pub struct Reporter {
    context: Mutex<Option<String>>,
    diagnostics: Mutex<Vec<String>>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that the test is starting the step described by `what`.
    pub fn context(&self, what: impl Into<String>) {
        let what = what.into();
        info!(step = %what, "context");
        *self.context.lock().unwrap() = Some(what);
    }

    pub fn current_context(&self) -> Option<String> {
        self.context.lock().unwrap().clone()
    }

    /// Adds a diagnostic line to the test's report.
    pub fn note(&self, line: impl Into<String>) {
        let line = line.into();
        info!(%line, "diagnostic");
        self.diagnostics.lock().unwrap().push(line);
    }

    pub fn diagnostics(&self) -> Vec<String> {
        self.diagnostics.lock().unwrap().clone()
    }

    /// Builds an assertion failure for the current step. The test reports
    /// FAIL when this error escapes it.
    pub fn fail(&self, message: impl Into<String>) -> anyhow::Error {
        ScriptError::Assertion {
            message: message.into(),
            context: self.current_context(),
        }
        .into()
    }

    /// Builds an environment error for the current step. The test reports
    /// ERROR when this error escapes it.
    pub fn error(&self, message: impl Into<String>) -> anyhow::Error {
        ScriptError::Environment {
            message: message.into(),
            context: self.current_context(),
        }
        .into()
    }

    pub fn skip(&self, message: impl Into<String>) -> anyhow::Error {
        ScriptError::Skipped(message.into()).into()
    }
}
