// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Queries and setup steps specific to Windows guests.

use std::{net::Ipv4Addr, time::Duration};

use anyhow::Result;
use tracing::info;

use crate::{
    check::Check,
    error::ScriptError,
    reporter::Reporter,
    session::GuestSession,
    vm::{RebootMethod, VmHandle},
    wait::wait_for,
};

pub mod virtio_win;

const WMIC_TIMEOUT: Duration = Duration::from_secs(60);

/// The volume label of the utility disk attached to Windows guests. Command
/// templates refer to its drive with this token.
pub const WINUTILS_LABEL: &str = "WIN_UTILS";

/// Returns the value row of `wmic ... get <column>` output, which prints a
/// header row first.
fn wmic_value(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .nth(1)
        .map(str::to_owned)
}

/// Returns the drive letter (without the colon) of the volume labelled
/// `label`, if there is one.
pub async fn volume_letter(
    session: &dyn GuestSession,
    label: &str,
) -> Result<Option<String>> {
    let cmd =
        format!("wmic logicaldisk where VolumeName='{label}' get DeviceID");
    let output = session.cmd_output(&cmd, WMIC_TIMEOUT).await?;
    Ok(wmic_value(&output)
        .and_then(|v| v.strip_suffix(':').map(str::to_owned))
        .filter(|v| !v.is_empty()))
}

/// Polls for the volume labelled `label` until it appears or `timeout`
/// passes.
pub async fn wait_for_volume_letter(
    session: &dyn GuestSession,
    label: &str,
    timeout: Duration,
) -> Result<Option<String>> {
    wait_for(timeout, Duration::from_secs(2), || volume_letter(session, label))
        .await
}

/// Replaces the `WIN_UTILS` token in `command` with the utility disk's
/// drive, e.g. `WIN_UTILS\winfsp.msi` becomes `D:\winfsp.msi`.
pub async fn set_winutils_letter(
    session: &dyn GuestSession,
    command: &str,
) -> Result<String> {
    if !command.contains(WINUTILS_LABEL) {
        return Ok(command.to_owned());
    }
    let letter = volume_letter(session, WINUTILS_LABEL).await?.ok_or_else(|| {
        ScriptError::environment("the WIN_UTILS volume is not attached")
    })?;
    Ok(command.replace(WINUTILS_LABEL, &format!("{letter}:")))
}

/// Reads `target` of the WMI object in `global_switch` (`nic`,
/// `nicconfig`...) whose `key` equals `value`. Returns an empty string if
/// no such object exists.
pub async fn nic_attribute(
    session: &dyn GuestSession,
    global_switch: &str,
    key: &str,
    value: &str,
    target: &str,
) -> Result<String> {
    let output = session
        .cmd_output(
            &format!("wmic {global_switch} where {key}='{value}' get {target}"),
            WMIC_TIMEOUT,
        )
        .await?;
    Ok(wmic_value(&output).unwrap_or_default())
}

/// Parses WMI array output such as `{"10.0.0.2", "fe80::1"}` into its
/// elements.
pub fn wmi_array(raw: &str) -> Vec<String> {
    raw.trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .split(',')
        .map(|s| s.trim().trim_matches('"').to_owned())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Returns the IPv4 address of the adapter with MAC address `mac`.
pub async fn guest_ip_addr(
    session: &dyn GuestSession,
    mac: &str,
) -> Result<Option<Ipv4Addr>> {
    let raw =
        nic_attribute(session, "nicconfig", "MACAddress", mac, "IPAddress")
            .await?;
    Ok(wmi_array(&raw).iter().find_map(|a| a.parse().ok()))
}

/// Makes sure `driver` is running and watched by Driver Verifier, enabling
/// the verifier and rebooting if it is not. Returns the session to keep
/// using, which is a new one if the guest rebooted.
pub async fn ensure_driver_verified(
    vm: &dyn VmHandle,
    session: Box<dyn GuestSession>,
    driver: &str,
    reporter: &Reporter,
    login_timeout: Duration,
) -> Result<Box<dyn GuestSession>> {
    reporter.context(format!("Check that driver {driver} is running"));
    let state = session
        .cmd_output(
            &format!("wmic sysdriver where name='{driver}' get State"),
            WMIC_TIMEOUT,
        )
        .await?;
    let running = Check::contains("the driver is running", "Running");
    if !running.holds(&state) {
        return Err(reporter.fail(format!(
            "driver {driver} is not running: {}",
            state.trim()
        )));
    }

    let query = "verifier /querysettings";
    let verified = Check::new(
        "the driver is under verification",
        crate::check::Predicate::ContainsIgnoreCase(format!("{driver}.sys")),
    );
    if verified.holds(&session.cmd_output(query, WMIC_TIMEOUT).await?) {
        info!(driver, "driver verifier already enabled");
        return Ok(session);
    }

    reporter.context(format!("Enable driver verifier for {driver}"));
    session
        .cmd(&format!("verifier /standard /driver {driver}.sys"), WMIC_TIMEOUT)
        .await
        .map_err(|e| reporter.error(format!("{e:#}")))?;
    let session = vm.reboot(session, RebootMethod::Shell, login_timeout).await?;

    let settings = session.cmd_output(query, WMIC_TIMEOUT).await?;
    if !verified.holds(&settings) {
        return Err(reporter.error(format!(
            "driver verifier is not enabled for {driver}: {}",
            settings.trim()
        )));
    }
    Ok(session)
}
