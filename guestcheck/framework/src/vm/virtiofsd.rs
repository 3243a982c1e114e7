// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `virtiofsd` daemons backing a VM's virtio-fs devices.

use std::{process::Stdio, time::Duration};

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{info, warn};

use crate::{error::ScriptError, params::Params, wait::wait_for};

use super::{launch::resolve, VirtioFsDevice};

/// Describes the daemon for filesystem object `name` of VM `vm_name`.
/// Relative source directories are resolved against `fs_source_base_dir`,
/// which defaults to `data_dir`.
pub(crate) fn device_for(
    vm_name: &str,
    name: &str,
    fs_params: &Params,
    data_dir: &Utf8Path,
    run_dir: &Utf8Path,
) -> Result<VirtioFsDevice, ScriptError> {
    let base = fs_params
        .get("fs_source_base_dir")
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|| data_dir.to_owned());
    Ok(VirtioFsDevice {
        name: name.to_owned(),
        target: fs_params.require("fs_target")?,
        source: resolve(&base, &fs_params.require("fs_source_dir")?),
        socket: run_dir.join(format!("{vm_name}-{name}-virtiofsd.sock")),
        log_file: run_dir.join(format!("{vm_name}-{name}.log")),
    })
}

/// The daemon's arguments. `fs_binary_extra_options` is appended verbatim,
/// e.g. to raise the log level.
pub(crate) fn daemon_args(
    dev: &VirtioFsDevice,
    fs_params: &Params,
) -> Vec<String> {
    let mut args = vec![
        format!("--socket-path={}", dev.socket),
        format!("--shared-dir={}", dev.source),
        format!("--cache={}", fs_params.get_or("fs_cache", "auto")),
    ];
    if let Some(group) = fs_params.get("socket_group") {
        args.push(format!("--socket-group={group}"));
    }
    if let Some(extra) = fs_params.get("fs_binary_extra_options") {
        args.extend(extra.split_whitespace().map(str::to_owned));
    }
    args
}

/// A running daemon. It is killed when this is dropped.
pub(crate) struct VirtiofsDaemon {
    child: tokio::process::Child,
    device: VirtioFsDevice,
}

impl VirtiofsDaemon {
    /// Starts the daemon and waits for it to create its socket.
    pub(crate) async fn start(
        binary: &str,
        device: VirtioFsDevice,
        fs_params: &Params,
    ) -> Result<Self> {
        if !device.source.exists() {
            std::fs::create_dir_all(&device.source).with_context(|| {
                format!("creating shared directory {}", device.source)
            })?;
        }
        if device.socket.exists() {
            std::fs::remove_file(&device.socket)?;
        }

        let log = std::fs::File::create(&device.log_file)
            .with_context(|| format!("creating {}", device.log_file))?;
        let args = daemon_args(&device, fs_params);
        info!(binary, ?args, "Launching virtiofsd");
        let child = tokio::process::Command::new(binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("launching {binary}"))?;

        let mut daemon = Self { child, device };
        let socket = daemon.device.socket.clone();
        let ready = wait_for(
            Duration::from_secs(30),
            Duration::from_millis(200),
            || {
                let exited = daemon.has_exited();
                let present = socket.exists();
                let socket = socket.clone();
                async move {
                    if exited {
                        Err(anyhow!(
                            "virtiofsd exited before creating {socket}"
                        ))
                    } else {
                        Ok(present.then_some(()))
                    }
                }
            },
        )
        .await?;
        ready.ok_or_else(|| {
            ScriptError::environment(format!(
                "virtiofsd did not create {} in time",
                daemon.device.socket
            ))
        })?;

        Ok(daemon)
    }

    pub(crate) fn device(&self) -> &VirtioFsDevice {
        &self.device
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }
}

impl Drop for VirtiofsDaemon {
    fn drop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!(%e, socket = %self.device.socket, "failed to kill virtiofsd");
        }
    }
}
