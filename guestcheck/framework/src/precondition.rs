// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Idempotent guest queries that decide whether a test has anything to do.
//!
//! A test that changes guest state first asks whether the target state
//! already holds. If it does, the test passes without running its action
//! sequence, which keeps re-runs against a persistent guest image harmless.

use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::{
    check::Check,
    reporter::Reporter,
    session::{GuestSession, DEFAULT_TIMEOUT},
};

/// The result of evaluating a [`Precondition`], with the query's output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PreconditionState {
    Satisfied(String),
    Unsatisfied(String),
}

impl PreconditionState {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied(_))
    }

    pub fn output(&self) -> &str {
        match self {
            Self::Satisfied(o) | Self::Unsatisfied(o) => o,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Precondition {
    description: String,
    query: String,
    check: Check,
    timeout: Duration,
}

impl Precondition {
    pub fn new(
        description: impl Into<String>,
        query: impl Into<String>,
        check: Check,
    ) -> Self {
        Self {
            description: description.into(),
            query: query.into(),
            check,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs the query once. The query's exit status is ignored; only its
    /// output is checked.
    pub async fn evaluate(
        &self,
        session: &dyn GuestSession,
        reporter: &Reporter,
    ) -> Result<PreconditionState> {
        reporter.context(&self.description);
        let output = session.cmd_output(&self.query, self.timeout).await?;
        let satisfied = self.check.holds(&output);
        info!(
            query = %self.query,
            intent = self.check.intent(),
            satisfied,
            "evaluated precondition"
        );
        Ok(if satisfied {
            PreconditionState::Satisfied(output)
        } else {
            PreconditionState::Unsatisfied(output)
        })
    }

    /// Evaluates a precondition whose absence means a prerequisite of the
    /// test is missing, failing the test when it does not hold.
    pub async fn require(
        &self,
        session: &dyn GuestSession,
        reporter: &Reporter,
    ) -> Result<String> {
        match self.evaluate(session, reporter).await? {
            PreconditionState::Satisfied(output) => Ok(output),
            PreconditionState::Unsatisfied(output) => Err(reporter.fail(format!(
                "{}: output does not show that {}: {}",
                self.description,
                self.check.intent(),
                output.trim()
            ))),
        }
    }
}
