// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Temporarily resizing `/dev/shm`, which backs guest memory shared with
//! `virtiofsd` and defaults to half of the host's memory.

use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use crate::{
    error::ScriptError,
    host::{prepare, system, HostShell},
    params::Params,
    template::CommandTemplate,
};

use super::Cleanup;

const TMPFS_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct TmpfsResize {
    /// Prints the current size.
    pub get_cmd: String,

    /// Sets the size; filled with the size.
    pub set_cmd: CommandTemplate,

    pub size: String,
}

impl TmpfsResize {
    /// Reads `cmd_get_tmpfs`, `cmd_set_tmpfs` and the target size
    /// `size_mem1`.
    pub fn from_params(params: &Params) -> Result<Self, ScriptError> {
        Ok(Self {
            get_cmd: params.require("cmd_get_tmpfs")?,
            set_cmd: params.require("cmd_set_tmpfs")?.into(),
            size: params.require("size_mem1")?,
        })
    }

    /// Resizes the tmpfs and registers restoring its original size.
    pub async fn apply<'a>(
        &self,
        host: &'a dyn HostShell,
        cleanup: &mut Cleanup<'a>,
    ) -> Result<()> {
        let original = prepare(host, &self.get_cmd, TMPFS_TIMEOUT)
            .await?
            .replace('\n', "");
        debug!(%original, "original tmpfs size");

        let restore = self.set_cmd.fill(&[original.as_str()])?;
        let resize = self.set_cmd.fill(&[self.size.as_str()])?;
        prepare(host, &resize, TMPFS_TIMEOUT).await?;
        cleanup.defer(restore.clone(), move || async move {
            system(host, &restore, TMPFS_TIMEOUT).await.map(drop)
        });
        Ok(())
    }
}
