// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Small guest-side filesystem helpers shared by the scripted tests.

use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::{reporter::Reporter, session::GuestSession};

const FS_TIMEOUT: Duration = Duration::from_secs(60);

/// Creates `path` and any missing parents. An existing directory is fine.
pub async fn make_dirs(session: &dyn GuestSession, path: &str) -> Result<()> {
    let cmd = if session.os().is_windows() {
        format!("if not exist \"{path}\" mkdir \"{path}\"")
    } else {
        format!("mkdir -p {path}")
    };
    session.cmd(&cmd, FS_TIMEOUT).await?;
    Ok(())
}

/// Returns whether something is mounted on `dest`.
pub async fn is_mounted(
    session: &dyn GuestSession,
    dest: &str,
) -> Result<bool> {
    let status = session
        .cmd_status(&format!("mountpoint -q {dest}"), FS_TIMEOUT)
        .await?;
    Ok(status == 0)
}

/// Mounts `src` on `dest` and reports whether the mount is in place
/// afterwards. Mounting an already mounted destination succeeds.
pub async fn mount(
    session: &dyn GuestSession,
    src: &str,
    dest: &str,
    fstype: &str,
) -> Result<bool> {
    if is_mounted(session, dest).await? {
        info!(src, dest, "already mounted");
        return Ok(true);
    }
    let cmd = format!("mount -t {fstype} {src} {dest}");
    let (status, output) = session.cmd_status_output(&cmd, FS_TIMEOUT).await?;
    if status != 0 {
        warn!(src, dest, status, %output, "mount failed");
        return Ok(false);
    }
    is_mounted(session, dest).await
}

/// Unmounts `dest`. Returns false if it stays mounted.
pub async fn umount(session: &dyn GuestSession, dest: &str) -> Result<bool> {
    if !is_mounted(session, dest).await? {
        return Ok(true);
    }
    let (status, output) = session
        .cmd_status_output(&format!("umount {dest}"), FS_TIMEOUT)
        .await?;
    if status != 0 {
        warn!(dest, status, %output, "umount failed");
    }
    Ok(!is_mounted(session, dest).await?)
}

/// Removes the directory `path` unless something is still mounted on it, in
/// which case removing it would delete the mounted filesystem's contents.
pub async fn safe_rmdir(session: &dyn GuestSession, path: &str) -> Result<()> {
    if is_mounted(session, path).await? {
        warn!(path, "not removing a directory that is still a mount point");
        return Ok(());
    }
    session.cmd(&format!("rm -rf {path}"), FS_TIMEOUT).await?;
    Ok(())
}

/// Fails the test if the guest kernel logged anything at critical level or
/// above.
pub async fn verify_dmesg(
    session: &dyn GuestSession,
    reporter: &Reporter,
) -> Result<()> {
    reporter.context("Verify guest dmesg");
    let output = session
        .cmd_output("dmesg -l emerg,alert,crit", FS_TIMEOUT)
        .await?;
    if !output.trim().is_empty() {
        return Err(reporter.fail(format!(
            "guest kernel logged critical messages: {}",
            output.trim()
        )));
    }
    Ok(())
}
