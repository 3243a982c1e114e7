// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use guestcheck_tests::guestcheck_testcase::Framework;
use tracing::instrument;

/// Host-side setup and teardown around the whole run and around each test.
pub struct TestFixtures {
    framework: Arc<Framework>,
}

impl TestFixtures {
    pub fn new(framework: Arc<Framework>) -> Self {
        Self { framework }
    }

    /// Checks that the directories tests draw files from exist before any
    /// test boots a guest.
    #[instrument(skip_all)]
    pub fn execution_setup(&mut self) -> Result<()> {
        let dirs = self.framework.directories();
        for dir in [&dirs.data, &dirs.deps] {
            if !dir.is_dir() {
                bail!("{dir} is not a directory");
            }
        }
        Ok(())
    }

    #[instrument(skip_all)]
    pub fn test_setup(&mut self) -> Result<()> {
        let tmp = &self.framework.directories().tmp;
        std::fs::create_dir_all(tmp)
            .with_context(|| format!("failed to create {tmp}"))
    }

    /// Returns ports and other per-run state to the pool.
    #[instrument(skip_all)]
    pub fn test_cleanup(&mut self) -> Result<()> {
        self.framework.reset_state();
        Ok(())
    }
}
