// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod config;
mod execute;
mod fixtures;

use clap::Parser;
use config::{ListOptions, ProcessArgs, RunOptions};
use guestcheck_framework::log_config::LogFormat;
use guestcheck_tests::guestcheck_testcase::{Framework, FrameworkParameters};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::execute::ExecutionStats;
use crate::fixtures::TestFixtures;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let runner_args = ProcessArgs::parse();
    let _log_guard = set_tracing_subscriber(&runner_args)?;

    info!(?runner_args);

    match &runner_args.command {
        config::Command::Run(opts) => {
            let stats = run_tests(opts).await?;
            let exit_code = stats.tests_failed + stats.tests_errored;
            debug!(exit_code);
            drop(_log_guard);
            std::process::exit(i32::from(exit_code != 0));
        }
        config::Command::List(opts) => list_tests(opts),
    }

    Ok(())
}

async fn run_tests(run_opts: &RunOptions) -> anyhow::Result<ExecutionStats> {
    let framework = Arc::new(Framework::new(FrameworkParameters {
        params_file: run_opts.params.clone(),
        tmp_directory: run_opts.tmp_directory.clone(),
        data_directory: run_opts.data_directory.clone(),
        deps_directory: run_opts.deps_directory(),
        output_mode: run_opts.output_mode,
        port_range: run_opts.port_range(),
    })?);

    let fixtures = TestFixtures::new(framework.clone());

    // Run the tests and print results.
    let execution_stats =
        execute::run_tests_with_ctx(&framework, fixtures, run_opts).await;
    if !execution_stats.failed_test_cases.is_empty() {
        println!("\nfailures:");
        for tc in &execution_stats.failed_test_cases {
            println!("    {}", tc.fully_qualified_name());
        }
        println!();
    }

    println!(
        "test result: {}. {} passed; {} failed; {} errored; {} skipped; \
        {} not run; finished in {:.2}s\n",
        if execution_stats.failed_test_cases.is_empty() {
            "ok"
        } else {
            "FAILED"
        },
        execution_stats.tests_passed,
        execution_stats.tests_failed,
        execution_stats.tests_errored,
        execution_stats.tests_skipped,
        execution_stats.tests_not_run,
        execution_stats.duration.as_secs_f64()
    );

    Ok(execution_stats)
}

fn list_tests(list_opts: &ListOptions) {
    println!("Tests enabled after applying filters:\n");

    let mut count = 0;
    for tc in guestcheck_tests::guestcheck_testcase::filtered_test_cases(
        &list_opts.include_filter,
        &list_opts.exclude_filter,
    ) {
        println!("    {}", tc.fully_qualified_name());
        count += 1
    }

    println!("\n{} test(s) selected", count);
}

/// Installs the runner's log subscriber. Log lines go through a background
/// writer that is flushed when the returned guard drops.
fn set_tracing_subscriber(args: &ProcessArgs) -> anyhow::Result<WorkerGuard> {
    let format =
        if args.emit_bunyan { LogFormat::Bunyan } else { LogFormat::Plain };
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into());
    let subscriber = Registry::default().with(filter.from_env_lossy());
    match format {
        LogFormat::Bunyan => {
            let bunyan_layer =
                BunyanFormattingLayer::new("guestcheck-runner".into(), writer);
            let subscriber =
                subscriber.with(JsonStorageLayer).with(bunyan_layer);
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Plain => {
            let stdout_log = tracing_subscriber::fmt::layer()
                .with_line_number(true)
                .with_ansi(!args.disable_ansi)
                .with_writer(writer);
            let subscriber = subscriber.with(stdout_log);
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(guard)
}
