// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Auxiliary host resources that tests create before the guest runs, and the
//! cleanup stack that guarantees their release.
//!
//! Every resource registers its release action with a [`Cleanup`] the moment
//! it has been created, so a test that fails halfway through setup releases
//! exactly what it managed to create.

use std::future::Future;

use futures::future::{BoxFuture, FutureExt};
use tracing::{info, warn};

use crate::error::{ScriptError, WithCleanupErrors};

mod loopfs;
mod nfs;
mod tmpfs;

pub use loopfs::HostLoopFs;
pub use nfs::NfsExport;
pub use tmpfs::TmpfsResize;

type Action<'a> =
    Box<dyn FnOnce() -> BoxFuture<'a, anyhow::Result<()>> + Send + 'a>;

/// A stack of deferred release actions.
#[must_use = "pending cleanup actions leak unless `run` is called"]
#[derive(Default)]
pub struct Cleanup<'a> {
    pending: Vec<(String, Action<'a>)>,
}

impl<'a> Cleanup<'a> {
    pub fn new() -> Self {
        Self { pending: Vec::new() }
    }

    /// Registers `release`, described by `what`, to run during cleanup.
    pub fn defer<F, Fut>(&mut self, what: impl Into<String>, release: F)
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'a,
    {
        let what = what.into();
        info!(what, "registered cleanup action");
        self.pending.push((what, Box::new(move || release().boxed())));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Runs every pending action once, newest first. A failing action does
    /// not stop the ones after it.
    pub async fn run(mut self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let pending = std::mem::take(&mut self.pending);
        for (what, release) in pending.into_iter().rev() {
            info!(what, "releasing");
            match release().await {
                Ok(()) => report.released.push(what),
                Err(e) => {
                    warn!(what, error = %format!("{e:#}"), "release failed");
                    report.errors.push(format!("{what}: {e:#}"));
                }
            }
        }
        report
    }
}

impl Drop for Cleanup<'_> {
    fn drop(&mut self) {
        for (what, _) in &self.pending {
            warn!(what, "cleanup action leaked");
        }
    }
}

/// What happened when a [`Cleanup`] ran.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Actions that succeeded, in the order they ran.
    pub released: Vec<String>,

    /// One message per failed action.
    pub errors: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Combines the outcome of a test body with this report. The body's own
    /// error stays the primary one; release failures are attached to it. If
    /// the body succeeded but something could not be released, the result is
    /// an environment error.
    pub fn conclude<T>(self, result: anyhow::Result<T>) -> anyhow::Result<T> {
        match (result, self.errors.is_empty()) {
            (Ok(v), true) => Ok(v),
            (Ok(_), false) => Err(ScriptError::environment(format!(
                "cleanup failed: {}",
                self.errors.join("; ")
            ))
            .into()),
            (Err(e), true) => Err(e),
            (Err(primary), false) => {
                Err(WithCleanupErrors { primary, cleanup: self.errors }.into())
            }
        }
    }
}
