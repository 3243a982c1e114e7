// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A local NFS export mounted back onto the host, used to back a shared
//! directory with a network filesystem.

use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::{
    error::ScriptError,
    host::{prepare, system, HostShell},
    params::Params,
};

use super::Cleanup;

const NFS_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NfsExport {
    /// The directory being exported.
    pub export_dir: String,

    /// What `mount` is given as the source, e.g. `localhost:/mnt/export`.
    pub mount_src: String,

    /// Where the export is mounted on the host.
    pub mount_dir: String,

    pub export_ip: String,
    pub export_options: String,
    pub mount_options: String,
}

impl NfsExport {
    /// Reads `export_dir`, `nfs_mount_src` and `nfs_mount_dir`, plus the
    /// optional `export_ip`, `export_options` and `nfs_mount_options`.
    pub fn from_params(params: &Params) -> Result<Self, ScriptError> {
        Ok(Self {
            export_dir: params.require("export_dir")?,
            mount_src: params.require("nfs_mount_src")?,
            mount_dir: params.require("nfs_mount_dir")?,
            export_ip: params.get_or("export_ip", "*"),
            export_options: params
                .get_or("export_options", "rw,no_root_squash,sync"),
            mount_options: params.get_or("nfs_mount_options", "rw"),
        })
    }

    /// Exports the directory and mounts it, registering the unexport and the
    /// unmount with `cleanup` as soon as each takes effect.
    pub async fn setup<'a>(
        &self,
        host: &'a dyn HostShell,
        cleanup: &mut Cleanup<'a>,
    ) -> Result<()> {
        info!(
            export = %self.export_dir,
            mount = %self.mount_dir,
            "setting up NFS"
        );
        prepare(host, "systemctl start nfs-server.service", NFS_TIMEOUT)
            .await?;
        prepare(host, &format!("mkdir -p {}", self.export_dir), NFS_TIMEOUT)
            .await?;

        let target = format!("{}:{}", self.export_ip, self.export_dir);
        prepare(
            host,
            &format!("exportfs -o {} {target}", self.export_options),
            NFS_TIMEOUT,
        )
        .await?;
        let unexport = format!("exportfs -u {target}");
        cleanup.defer(unexport.clone(), move || async move {
            system(host, &unexport, NFS_TIMEOUT).await.map(drop)
        });

        prepare(host, &format!("mkdir -p {}", self.mount_dir), NFS_TIMEOUT)
            .await?;
        prepare(
            host,
            &format!(
                "mount -t nfs -o {} {} {}",
                self.mount_options, self.mount_src, self.mount_dir
            ),
            NFS_TIMEOUT,
        )
        .await?;
        let umount = format!("umount {}", self.mount_dir);
        cleanup.defer(umount.clone(), move || async move {
            system(host, &umount, NFS_TIMEOUT).await.map(drop)
        });
        Ok(())
    }
}
