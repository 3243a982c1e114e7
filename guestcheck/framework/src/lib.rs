// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The guestcheck framework: configuration, guest sessions, VMs, host
//! resources and the building blocks of scripted guest verification.

use std::sync::Arc;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

pub mod benchmark;
pub mod check;
pub mod env;
pub mod error;
#[cfg(any(test, feature = "fake"))]
pub mod fake;
pub mod features;
pub mod guest_os;
pub mod guest_utils;
pub mod host;
pub mod log_config;
pub mod params;
pub mod port_allocator;
pub mod precondition;
pub mod reporter;
pub mod resources;
pub mod sequence;
mod serial;
pub mod session;
pub mod template;
pub mod vm;
pub mod wait;
pub mod windows;

pub use env::Env;
pub use error::{ScriptError, Verdict};
pub use params::{Params, ParamsStore};
pub use reporter::Reporter;

use host::{HostShell, LocalHost};
use log_config::OutputMode;
use vm::{
    qemu::{QemuFactory, QemuFactoryConfig},
    VmFactory,
};

/// The host directories tests draw files from.
#[derive(Clone, Debug)]
pub struct Directories {
    /// Scratch space for run directories and logs.
    pub tmp: Utf8PathBuf,

    /// Images, ISOs and shared directories.
    pub data: Utf8PathBuf,

    /// Helper tools and packages copied into guests, one subdirectory each.
    pub deps: Utf8PathBuf,
}

impl Directories {
    /// Returns the directory of the helper package `name`.
    pub fn deps_dir(&self, name: &str) -> Utf8PathBuf {
        self.deps.join(name)
    }
}

/// Everything needed to set up a [`Framework`].
#[derive(Clone, Debug)]
pub struct FrameworkParameters {
    pub params_file: Utf8PathBuf,
    pub tmp_directory: Utf8PathBuf,
    pub data_directory: Utf8PathBuf,
    pub deps_directory: Utf8PathBuf,
    pub output_mode: OutputMode,
    pub port_range: std::ops::Range<u16>,
}

/// The state shared by every test in a run.
pub struct Framework {
    store: ParamsStore,
    dirs: Directories,
    factory: Arc<dyn VmFactory>,
    host: Arc<dyn HostShell>,
}

impl Framework {
    /// Loads the params file and prepares to launch QEMU VMs on this host.
    pub fn new(params: FrameworkParameters) -> Result<Self> {
        let store = ParamsStore::load(&params.params_file)?;
        std::fs::create_dir_all(&params.tmp_directory)?;
        let factory = QemuFactory::new(QemuFactoryConfig {
            tmp_directory: params.tmp_directory.clone(),
            data_directory: params.data_directory.clone(),
            output_mode: params.output_mode,
            port_range: params.port_range,
        });
        Ok(Self::from_parts(
            store,
            Directories {
                tmp: params.tmp_directory,
                data: params.data_directory,
                deps: params.deps_directory,
            },
            Arc::new(factory),
            Arc::new(LocalHost),
        ))
    }

    /// Assembles a framework from its pieces, e.g. scripted VMs and a fake
    /// host.
    pub fn from_parts(
        store: ParamsStore,
        dirs: Directories,
        factory: Arc<dyn VmFactory>,
        host: Arc<dyn HostShell>,
    ) -> Self {
        Self { store, dirs, factory, host }
    }

    pub fn directories(&self) -> &Directories {
        &self.dirs
    }

    /// Creates the context for one run of the test named `test_name`.
    pub fn test_context(&self, test_name: &str) -> TestCtx {
        TestCtx {
            name: test_name.to_owned(),
            params: self.store.for_test(test_name),
            reporter: Reporter::new(),
            env: Env::new(self.factory.clone()),
            host: self.host.clone(),
            dirs: self.dirs.clone(),
        }
    }

    /// Returns per-run state to its initial condition between tests.
    pub fn reset_state(&self) {
        self.factory.reset();
    }
}

/// What a test is handed: its params, a report sink and the environment
/// its VMs live in.
pub struct TestCtx {
    pub name: String,
    pub params: Params,
    pub reporter: Reporter,
    pub env: Env,
    pub host: Arc<dyn HostShell>,
    pub dirs: Directories,
}

impl TestCtx {
    pub fn host(&self) -> &dyn HostShell {
        self.host.as_ref()
    }

    /// Resolves `path` against the data directory unless it is absolute.
    pub fn data_path(&self, path: &str) -> Utf8PathBuf {
        let path = Utf8Path::new(path);
        if path.is_absolute() {
            path.to_owned()
        } else {
            self.dirs.data.join(path)
        }
    }
}
