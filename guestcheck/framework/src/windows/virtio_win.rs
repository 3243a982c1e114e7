// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Locating files on the virtio-win driver media.
//!
//! The media is laid out as `<letter>:\<component>\<product>\<arch>\`, e.g.
//! `E:\viofs\2k19\amd64\virtiofs.exe`. The product and architecture
//! directory names are derived from what the guest reports about itself.

use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::{
    params::Params, reporter::Reporter, session::GuestSession,
    template::CommandTemplate,
};

const QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Finds an executable under the drive, filtered to the product and
/// architecture directory.
pub const DEFAULT_EXE_FIND_CMD: &str =
    r#"dir /b /s VIOWIN_LTR\EXE_FILE_NAME | findstr "\EXE_MID_PATH\\""#;

/// How the virtio-win media is attached. Only ISO images are supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaType {
    Iso,
}

impl MediaType {
    /// Reads `virtio_win_media_type`. Any other media type makes the test
    /// report ERROR.
    pub fn from_params(params: &Params, reporter: &Reporter) -> Result<Self> {
        let raw = params.require("virtio_win_media_type")?;
        match raw.as_str() {
            "iso" => Ok(Self::Iso),
            other => Err(reporter.error(format!(
                "Not supported virtio win media type '{other}'"
            ))),
        }
    }
}

/// Maps the OS caption (`wmic os get caption`) to the product directory.
pub fn product_dirname(caption: &str) -> Option<&'static str> {
    const PRODUCTS: &[(&str, &str)] = &[
        ("2012 R2", "2k12R2"),
        ("2016", "2k16"),
        ("2019", "2k19"),
        ("2022", "2k22"),
        ("2025", "2k25"),
        ("Windows 10", "w10"),
        ("Windows 11", "w11"),
    ];
    PRODUCTS
        .iter()
        .find(|(needle, _)| caption.contains(needle))
        .map(|(_, dir)| *dir)
}

/// Maps `wmic os get osarchitecture` output to the architecture directory.
pub fn arch_dirname(arch: &str) -> Option<&'static str> {
    let arch = arch.to_ascii_uppercase();
    if arch.contains("ARM") {
        Some("ARM64")
    } else if arch.contains("64") {
        Some("amd64")
    } else if arch.contains("32") {
        Some("x86")
    } else {
        None
    }
}

/// Where the guest's drivers live on the media.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtioWinLocation {
    /// The drive, with its colon (`E:`).
    pub drive: String,
    pub product: String,
    pub arch: String,
}

impl VirtioWinLocation {
    /// The `<product>\<arch>` part of a driver path.
    pub fn middle_path(&self) -> String {
        format!("{}\\{}", self.product, self.arch)
    }
}

/// Returns the drive of the volume labelled `virtio-win*`.
pub async fn drive_letter(
    session: &dyn GuestSession,
) -> Result<Option<String>> {
    const SCRIPT: &str = "(Get-Volume | \
        Where-Object { $_.FileSystemLabel -like 'virtio-win*' }).DriveLetter";
    let (_, output) = session.powershell(SCRIPT, QUERY_TIMEOUT).await?;
    let letter = output.trim();
    Ok((letter.len() == 1).then(|| format!("{letter}:")))
}

/// Works out where the guest's drivers are. Every piece that cannot be
/// determined is an environment error.
pub async fn locate(
    session: &dyn GuestSession,
    reporter: &Reporter,
) -> Result<VirtioWinLocation> {
    reporter.context("Locate the virtio-win media");
    let drive = drive_letter(session)
        .await?
        .ok_or_else(|| {
            reporter.error("Could not find virtio-win drive in guest")
        })?;

    let caption =
        session.cmd_output("wmic os get caption", QUERY_TIMEOUT).await?;
    let product = product_dirname(&caption).ok_or_else(|| {
        reporter.error(format!(
            "Could not get product dirname of the vm: {}",
            caption.trim()
        ))
    })?;

    let arch = session
        .cmd_output("wmic os get osarchitecture", QUERY_TIMEOUT)
        .await?;
    let arch = arch_dirname(&arch).ok_or_else(|| {
        reporter.error(format!(
            "Could not get architecture dirname of the vm: {}",
            arch.trim()
        ))
    })?;

    Ok(VirtioWinLocation {
        drive,
        product: product.to_owned(),
        arch: arch.to_owned(),
    })
}

/// Fills an `exe_find_cmd` template for `exe_name` at `location`.
pub fn exe_find_command(
    template: &str,
    location: &VirtioWinLocation,
    exe_name: &str,
) -> String {
    let middle = location.middle_path();
    CommandTemplate::new(template)
        .fill_named(&[
            ("VIOWIN_LTR", location.drive.as_str()),
            ("EXE_FILE_NAME", exe_name),
            ("EXE_MID_PATH", middle.as_str()),
        ])
        .as_str()
        .to_owned()
}

/// Returns the full guest path of `exe_name` on the virtio-win media. The
/// search command comes from `exe_find_cmd` when it is set.
pub async fn find_exe(
    session: &dyn GuestSession,
    params: &Params,
    reporter: &Reporter,
    exe_name: &str,
) -> Result<String> {
    MediaType::from_params(params, reporter)?;
    let location = locate(session, reporter).await?;
    let template = params.get_or("exe_find_cmd", DEFAULT_EXE_FIND_CMD);
    let cmd = exe_find_command(&template, &location, exe_name);

    let output = session
        .cmd(&cmd, QUERY_TIMEOUT)
        .await
        .map_err(|e| reporter.error(format!("{e:#}")))?;
    let path = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| {
            reporter.error(format!("{exe_name} is not on the virtio-win media"))
        })?
        .to_owned();
    info!(%path, "found executable");
    Ok(path)
}
