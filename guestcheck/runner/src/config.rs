// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use guestcheck_framework::log_config::OutputMode;

#[derive(Debug, Subcommand)]
pub enum Command {
    Run(RunOptions),
    List(ListOptions),
}

/// Runtime configuration options for the runner.
#[derive(Debug, Parser)]
#[clap(verbatim_doc_comment)]
pub struct ProcessArgs {
    #[clap(subcommand)]
    pub command: Command,

    /// Suppress emission of terminal control codes in the runner's log output.
    #[clap(long, conflicts_with = "emit_bunyan")]
    pub disable_ansi: bool,

    /// Emit Bunyan-formatted logs.
    #[clap(long)]
    pub emit_bunyan: bool,
}

#[derive(Args, Debug)]
#[clap(verbatim_doc_comment)]
pub struct RunOptions {
    /// The TOML file holding the test parameters. Top-level keys apply to
    /// every test; a `[tests.<name>]` table overrides them for one test.
    #[clap(long, value_parser)]
    pub params: Utf8PathBuf,

    /// The directory into which to write temporary files (serial logs, QMP
    /// sockets, virtiofsd sockets and logs, etc.) generated during test
    /// execution.
    #[clap(long, value_parser)]
    pub tmp_directory: Utf8PathBuf,

    /// The directory holding guest images, firmware and isos. Relative
    /// paths in the parameters are resolved against it.
    #[clap(long, value_parser)]
    pub data_directory: Utf8PathBuf,

    /// The directory holding files tests copy into guests, one subdirectory
    /// per package. Defaults to `deps` under the data directory.
    #[clap(long, value_parser)]
    deps_directory: Option<Utf8PathBuf>,

    /// Where QEMU and virtiofsd write their stdout/stderr.
    ///
    /// Valid options are:
    ///
    /// - file, tmpfile: Log to a file under tmp-directory.
    ///
    /// - stdio: Log to stdout/stderr.
    ///
    /// - null: Don't log anywhere.
    #[clap(long, default_value = "file")]
    pub output_mode: OutputMode,

    /// The first host port to hand out for guest serial consoles and SSH
    /// forwarding.
    #[clap(long, value_parser, default_value = "9000")]
    pub port_base: u16,

    /// How many ports from `port_base` on may be used.
    #[clap(long, value_parser, default_value = "1000")]
    pub port_count: u16,

    /// Only run tests whose fully-qualified names contain this string.
    /// Can be specified multiple times.
    #[clap(long, value_parser)]
    pub include_filter: Vec<String>,

    /// Only run tests whose fully-qualified names do not contain this
    /// string. Can be specified multiple times.
    #[clap(long, value_parser)]
    pub exclude_filter: Vec<String>,
}

#[derive(Args, Debug)]
#[clap(verbatim_doc_comment)]
pub struct ListOptions {
    /// Only list tests whose fully-qualified names contain this string.
    /// Can be specified multiple times.
    #[clap(long, value_parser)]
    pub include_filter: Vec<String>,

    /// Only list tests whose fully-qualified names do not contain this
    /// string. Can be specified multiple times.
    #[clap(long, value_parser)]
    pub exclude_filter: Vec<String>,
}

impl RunOptions {
    pub fn deps_directory(&self) -> Utf8PathBuf {
        self.deps_directory
            .clone()
            .unwrap_or_else(|| self.data_directory.join("deps"))
    }

    pub fn port_range(&self) -> std::ops::Range<u16> {
        self.port_base..self.port_base.saturating_add(self.port_count)
    }
}
