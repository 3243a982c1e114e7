// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A filesystem created on a loop device over an image file and mounted on
//! the host, used as the source of a shared directory.

use std::time::Duration;

use anyhow::Result;
use camino::Utf8PathBuf;
use tracing::info;

use crate::{
    error::ScriptError,
    host::{prepare, system, HostShell},
    params::Params,
    reporter::Reporter,
    template::CommandTemplate,
};

use super::Cleanup;

const IMAGE_TIMEOUT: Duration = Duration::from_secs(300);
const LOOP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct HostLoopFs {
    /// The image file backing the loop device.
    pub image: String,

    /// Creates the image; filled with the image path.
    pub create_cmd: CommandTemplate,

    /// Prints the loop device to use, e.g. `losetup -f`.
    pub query_cmd: String,

    /// Attaches the image; filled with the image path.
    pub attach_cmd: CommandTemplate,

    /// The filesystem type, e.g. `xfs`.
    pub fs_type: String,

    /// Makes the filesystem; filled with the filesystem type. The loop device
    /// is appended.
    pub mkfs_cmd: CommandTemplate,

    /// Where the filesystem is mounted.
    pub mount_point: Utf8PathBuf,
}

impl HostLoopFs {
    /// Reads `dd_of_on_host`, `cmd_dd_on_host`, `cmd_losetup_query_on_host`,
    /// `cmd_losetup_on_host`, `fs_on_host` and `cmd_mkfs_on_host`. The
    /// mount point is the already resolved share source directory.
    pub fn from_params(
        params: &Params,
        mount_point: Utf8PathBuf,
    ) -> Result<Self, ScriptError> {
        Ok(Self {
            image: params.require("dd_of_on_host")?,
            create_cmd: params.require("cmd_dd_on_host")?.into(),
            query_cmd: params.require("cmd_losetup_query_on_host")?,
            attach_cmd: params.require("cmd_losetup_on_host")?.into(),
            fs_type: params.require("fs_on_host")?,
            mkfs_cmd: params.require("cmd_mkfs_on_host")?.into(),
            mount_point,
        })
    }

    /// Builds the filesystem and mounts it, returning the loop device.
    ///
    /// Fails the test if no loop device is available or the mount fails.
    /// Teardown is registered before each step that could leave something
    /// behind, so even a half-built filesystem is unmounted and detached.
    pub async fn setup<'a>(
        &self,
        host: &'a dyn HostShell,
        reporter: &Reporter,
        cleanup: &mut Cleanup<'a>,
    ) -> Result<String> {
        reporter.context(format!(
            "create a {} filesystem on a loop device at {}",
            self.fs_type, self.mount_point
        ));

        let create = self.create_cmd.fill(&[self.image.as_str()])?;
        prepare(host, &create, IMAGE_TIMEOUT).await?;
        let remove = format!("rm -rf {}", self.image);
        cleanup.defer(remove.clone(), move || async move {
            system(host, &remove, LOOP_TIMEOUT).await.map(drop)
        });

        let query = host.run(&self.query_cmd, LOOP_TIMEOUT).await?;
        let loop_device = query.stdout.trim().to_owned();
        let mount_point = self.mount_point.clone();
        if loop_device.is_empty() {
            let umount = format!("umount -l {mount_point}");
            cleanup.defer(umount.clone(), move || async move {
                system(host, &umount, LOOP_TIMEOUT).await.map(drop)
            });
            return Err(reporter.fail("no valid loop device found on the host"));
        }
        info!(%loop_device, "found loop device");

        let release = format!(
            "if losetup -l {loop_device}; then losetup -d {loop_device}; fi; \
             umount -l {mount_point}"
        );
        cleanup.defer(
            format!("detach {loop_device} and unmount {mount_point}"),
            move || async move {
                system(host, &release, LOOP_TIMEOUT).await.map(drop)
            },
        );

        let attach = self.attach_cmd.fill(&[self.image.as_str()])?;
        prepare(host, &attach, LOOP_TIMEOUT).await?;
        let mkfs_prefix = self.mkfs_cmd.fill(&[self.fs_type.as_str()])?;
        let mkfs = format!("{mkfs_prefix}{loop_device}");
        prepare(host, &mkfs, LOOP_TIMEOUT).await?;
        prepare(host, &format!("mkdir -p {mount_point}"), LOOP_TIMEOUT).await?;

        let mounted = host
            .run(&format!("mount {loop_device} {mount_point}"), LOOP_TIMEOUT)
            .await?;
        if !mounted.success() {
            return Err(reporter.fail(format!(
                "Fail to mount on host: {}",
                mounted.stderr.trim()
            )));
        }
        Ok(loop_device)
    }
}
