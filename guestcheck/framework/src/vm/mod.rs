// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Handles to running guest VMs.

use std::{str::FromStr, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::{
    error::ScriptError,
    guest_os::GuestOsKind,
    params::Params,
    session::{BootEpoch, GuestSession},
};

mod launch;
pub mod qemu;
mod qmp;
mod virtiofsd;

pub use qmp::QmpError;

/// Errors raised when a VM is asked to do something its state doesn't allow.
#[derive(Debug, Error)]
pub enum VmStateError {
    #[error("VM {0} has been destroyed")]
    Destroyed(String),

    #[error("VM {name} has no device {device}")]
    NoSuchDevice { name: String, device: String },
}

/// A virtio-fs share attached to a VM and served by a `virtiofsd` daemon.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtioFsDevice {
    /// The filesystem object name from the `filesystems` list.
    pub name: String,

    /// The mount tag the guest uses to mount the share.
    pub target: String,

    /// The host directory being shared.
    pub source: Utf8PathBuf,

    /// The vhost-user socket the daemon serves.
    pub socket: Utf8PathBuf,

    /// The file the daemon logs to.
    pub log_file: Utf8PathBuf,
}

/// A network adapter attached to a VM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NicInfo {
    pub name: String,
    pub model: String,
    pub mac: String,
}

/// How [`VmHandle::reboot`] restarts the guest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RebootMethod {
    /// Run the guest OS's reboot command through the session.
    #[default]
    Shell,

    /// Reset the virtual machine.
    SystemReset,
}

impl FromStr for RebootMethod {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shell" => Ok(Self::Shell),
            "system_reset" => Ok(Self::SystemReset),
            _ => Err(ScriptError::config(format!(
                "unrecognized reboot method {s:?}"
            ))),
        }
    }
}

impl RebootMethod {
    pub fn from_params(params: &Params) -> Result<Self, ScriptError> {
        params.get_or("reboot_method", "shell").parse()
    }
}

/// A running guest VM.
#[async_trait]
pub trait VmHandle: Send + Sync {
    fn name(&self) -> &str;

    fn os(&self) -> GuestOsKind;

    /// The VM's boot counter. Sessions opened before the current epoch are
    /// stale.
    fn epoch(&self) -> &BootEpoch;

    fn virtiofs_devices(&self) -> &[VirtioFsDevice];

    fn nics(&self) -> &[NicInfo];

    async fn is_alive(&self) -> bool;

    /// Fails with an environment error if the VM is not running.
    async fn verify_alive(&self) -> Result<()> {
        if self.is_alive().await {
            Ok(())
        } else {
            Err(ScriptError::environment(format!(
                "VM {} is not running",
                self.name()
            ))
            .into())
        }
    }

    /// Logs in over the network.
    async fn wait_for_login(
        &self,
        timeout: Duration,
    ) -> Result<Box<dyn GuestSession>>;

    /// Logs in on the serial console.
    async fn wait_for_serial_login(
        &self,
        timeout: Duration,
    ) -> Result<Box<dyn GuestSession>>;

    /// Reboots the guest and returns a fresh session over the same kind of
    /// transport as `session`, which is consumed. Every other session opened
    /// before the reboot becomes stale.
    async fn reboot(
        &self,
        session: Box<dyn GuestSession>,
        method: RebootMethod,
        timeout: Duration,
    ) -> Result<Box<dyn GuestSession>>;

    async fn copy_files_to(
        &self,
        host_path: &Utf8Path,
        guest_path: &str,
        timeout: Duration,
    ) -> Result<()>;

    async fn copy_files_from(
        &self,
        guest_path: &str,
        host_path: &Utf8Path,
        timeout: Duration,
    ) -> Result<()>;

    /// Inserts `image` into the removable drive `drive` (e.g.
    /// `drive_virtio`).
    async fn change_media(&self, drive: &str, image: &Utf8Path) -> Result<()>;

    /// Presses a key combination such as `meta_l-d`.
    async fn send_key(&self, keys: &str) -> Result<()>;

    /// Stops the VM and releases its host processes. Destroying a destroyed
    /// VM does nothing.
    async fn destroy(&self) -> Result<()>;
}

/// Creates VMs from their parameters.
#[async_trait]
pub trait VmFactory: Send + Sync {
    /// Boots a VM named `name`. `params` are already specialized for the VM.
    async fn create_vm(
        &self,
        name: &str,
        params: &Params,
    ) -> Result<Arc<dyn VmHandle>>;

    /// Releases per-run bookkeeping between tests. Only called once every VM
    /// this factory created has been destroyed.
    fn reset(&self) {}
}
