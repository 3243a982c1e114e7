// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub use anyhow;
pub use anyhow::{Context, Result};
pub use futures::future::BoxFuture;
pub use guestcheck_framework;
pub use guestcheck_testcase_macros::*;
pub use inventory::submit as inventory_submit;

use guestcheck_framework::error::classify;
pub use guestcheck_framework::{
    Framework, FrameworkParameters, Params, Reporter, ScriptError, TestCtx,
    Verdict,
};
use tracing::{info_span, warn, Instrument};

/// The outcome from executing a specific test case.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TestOutcome {
    /// The test passed.
    Passed,

    /// The behavior under test is wrong.
    Failed(Option<String>),

    /// The test could not run meaningfully: its configuration is broken or
    /// the environment could not be prepared.
    Errored(Option<String>),

    /// The test chose to be skipped, i.e. it detected a parameter or condition
    /// that makes it impossible to execute the test or to meaningfully provide
    /// a pass/fail outcome. The payload is an optional message.
    Skipped(Option<String>),
}

impl TestOutcome {
    /// Converts the error a test body returned into an outcome. The
    /// reporter's diagnostic lines are appended to the message.
    pub fn from_error(err: &anyhow::Error, reporter: &Reporter) -> Self {
        let mut msg = format!("{err:#}");
        for line in reporter.diagnostics() {
            msg.push_str("\n    ");
            msg.push_str(&line);
        }
        match classify(err) {
            Verdict::Fail => TestOutcome::Failed(Some(msg)),
            Verdict::Error => TestOutcome::Errored(Some(msg)),
            Verdict::Skip => TestOutcome::Skipped(Some(msg)),
        }
    }
}

/// A wrapper for test functions. This is needed to allow [`TestCase`] to have a
/// `const` constructor for the inventory crate.
pub struct TestFunction {
    pub f: fn(&TestCtx) -> BoxFuture<'_, TestOutcome>,
}

/// A description of a single test case.
pub struct TestCase {
    /// The path to the module containing the test case. This is generally
    /// derived from the `module_path!()` macro, which the
    /// `#[guestcheck_testcase]` attribute macro uses when constructing the
    /// test case's inventory entry.
    pub(crate) module_path: &'static str,

    /// The name of this test case, which is generally its function name.
    pub(crate) name: &'static str,

    /// The test function to execute to run this test.
    pub(crate) function: TestFunction,
}

impl TestCase {
    /// Constructs a new [`TestCase`].
    pub const fn new(
        module_path: &'static str,
        name: &'static str,
        function: TestFunction,
    ) -> Self {
        Self { module_path, name, function }
    }

    /// Returns the test case's fully qualified name, i.e. `module_path::name`.
    pub fn fully_qualified_name(&self) -> String {
        format!("{}::{}", self.module_path, self.name)
    }

    /// Returns the test case's name, which also selects its
    /// `[tests.<name>]` params overlay.
    pub fn name(&self) -> &str {
        self.name
    }

    /// Runs the test case: boots the VMs its params ask for, runs the body
    /// and destroys every VM it left behind.
    pub async fn run(&self, framework: &Framework) -> TestOutcome {
        let ctx = framework.test_context(self.name);
        let span = info_span!("test", name = %self.fully_qualified_name());
        async {
            let outcome = match ctx.env.preprocess(&ctx.params).await {
                Ok(()) => (self.function.f)(&ctx).await,
                Err(e) => TestOutcome::Errored(Some(format!(
                    "failed to prepare the environment: {e:#}"
                ))),
            };

            match ctx.env.destroy_all().await {
                Ok(()) => outcome,
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "failed to destroy VMs");
                    match outcome {
                        TestOutcome::Passed => TestOutcome::Errored(Some(
                            format!("failed to destroy VMs: {e:#}"),
                        )),
                        other => other,
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

inventory::collect!(TestCase);

pub fn all_test_cases() -> impl Iterator<Item = &'static TestCase> {
    inventory::iter::<TestCase>.into_iter()
}

/// Returns an iterator over the subset of tests for which (a) the fully
/// qualified name of the test includes every string in `must_include`, and (b)
/// the fully qualified name does not include any strings in `must_exclude`.
pub fn filtered_test_cases<'rule>(
    must_include: &'rule [String],
    must_exclude: &'rule [String],
) -> impl Iterator<Item = &'static TestCase> + 'rule {
    inventory::iter::<TestCase>.into_iter().filter(|tc| {
        must_include.iter().all(|inc| tc.fully_qualified_name().contains(inc))
            && must_exclude
                .iter()
                .all(|exc| !tc.fully_qualified_name().contains(exc))
    })
}
