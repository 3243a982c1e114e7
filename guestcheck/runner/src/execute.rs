// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::{Duration, Instant};

use guestcheck_tests::guestcheck_testcase::{
    filtered_test_cases, Framework, TestCase, TestOutcome,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::RunOptions;
use crate::fixtures::TestFixtures;

/// Statistics returned after executing a set of tests.
pub struct ExecutionStats {
    /// The number of tests that passed.
    pub tests_passed: u32,

    /// The number of tests that failed.
    pub tests_failed: u32,

    /// The number of tests that could not run meaningfully.
    pub tests_errored: u32,

    /// The number of tests that marked themselves as skipped.
    pub tests_skipped: u32,

    /// The number of tests that the runner decided not to run (e.g. because of
    /// a failure in a fixture or an interrupt).
    pub tests_not_run: u32,

    /// The total time spent running tests and fixtures.
    pub duration: Duration,

    /// The test cases that failed or errored.
    pub failed_test_cases: Vec<&'static TestCase>,
}

impl ExecutionStats {
    fn record(&mut self, tc: &'static TestCase, outcome: &TestOutcome) {
        self.tests_not_run -= 1;
        match outcome {
            TestOutcome::Passed => self.tests_passed += 1,
            TestOutcome::Failed(_) => {
                self.tests_failed += 1;
                self.failed_test_cases.push(tc);
            }
            TestOutcome::Errored(_) => {
                self.tests_errored += 1;
                self.failed_test_cases.push(tc);
            }
            TestOutcome::Skipped(_) => self.tests_skipped += 1,
        }
    }
}

/// Executes the selected tests one at a time. Host resources are shared by
/// every test, so tests never overlap.
pub async fn run_tests_with_ctx(
    framework: &Framework,
    mut fixtures: TestFixtures,
    run_opts: &RunOptions,
) -> ExecutionStats {
    let executions: Vec<&'static TestCase> = filtered_test_cases(
        &run_opts.include_filter,
        &run_opts.exclude_filter,
    )
    .collect();

    let mut stats = ExecutionStats {
        tests_passed: 0,
        tests_failed: 0,
        tests_errored: 0,
        tests_skipped: 0,
        tests_not_run: executions.len() as u32,
        duration: Duration::default(),
        failed_test_cases: Vec::new(),
    };

    if executions.is_empty() {
        info!("No tests selected for execution");
        return stats;
    }

    let sigint_rx = match set_sigint_handler() {
        Ok(rx) => rx,
        Err(e) => {
            error!(error = %e, "failed to set SIGINT handler");
            return stats;
        }
    };
    info!("Running {} test(s)", executions.len());
    let start_time = Instant::now();

    if let Err(e) = fixtures.execution_setup() {
        error!("Error running execution setup fixture: {:#}", e);
        stats.duration = start_time.elapsed();
        return stats;
    }

    for tc in executions {
        // Interrupts are only honored between tests so a test's cleanup
        // always runs to completion.
        if *sigint_rx.borrow() {
            info!("Test run interrupted by SIGINT");
            break;
        }

        info!("Starting test {}", tc.fully_qualified_name());

        if let Err(e) = fixtures.test_setup() {
            error!("Error running test setup fixture: {:#}", e);
            break;
        }

        let test_outcome = tc.run(framework).await;

        info!(
            "test {} ... {}{}",
            tc.fully_qualified_name(),
            match test_outcome {
                TestOutcome::Passed => "ok",
                TestOutcome::Failed(_) => "FAILED: ",
                TestOutcome::Errored(_) => "ERROR: ",
                TestOutcome::Skipped(_) => "skipped: ",
            },
            match &test_outcome {
                TestOutcome::Failed(Some(s))
                | TestOutcome::Errored(Some(s))
                | TestOutcome::Skipped(Some(s)) => s,
                TestOutcome::Failed(None)
                | TestOutcome::Errored(None)
                | TestOutcome::Skipped(None) => "[no message]",
                TestOutcome::Passed => "",
            }
        );
        stats.record(tc, &test_outcome);

        if let Err(e) = fixtures.test_cleanup() {
            error!("Error running cleanup fixture: {:#}", e);
            break;
        }
    }

    stats.duration = start_time.elapsed();
    stats
}

/// Sets a global handler for SIGINT and hands the resulting signal channel over
/// to a task that handles this signal. Returns a receiver to which the signal
/// handler task publishes `true` to the channel when SIGINT is received.
fn set_sigint_handler() -> std::io::Result<watch::Receiver<bool>> {
    let mut sigint = signal(SignalKind::interrupt())?;

    let (sigint_tx, sigint_rx) = watch::channel(false);
    tokio::spawn(async move {
        loop {
            sigint.recv().await;

            // If a signal was previously dispatched to the channel, exit
            // immediately with the customary SIGINT exit code (130 is 128 +
            // SIGINT). This allows users to interrupt tests even if they aren't
            // at an await point (at the cost of not having destructors run).
            if *sigint_tx.borrow() {
                error!(
                    "SIGINT received while shutting down, rudely terminating"
                );
                error!("some processes and resources may have been leaked!");
                std::process::exit(130);
            }

            warn!("SIGINT received, finishing the current test");
            let _ = sigint_tx.send(true);
        }
    });

    Ok(sigint_rx)
}
