// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `VirtioFsSvc` Windows service, which exposes virtiofs shares as
//! drive letters.

use std::{fmt, time::Duration};

use guestcheck_framework::{
    session::GuestSession,
    template::CommandTemplate,
    vm::{RebootMethod, VmHandle},
    windows::{virtio_win::find_exe, wait_for_volume_letter},
};
use guestcheck_testcase::*;
use tracing::info;

const SC_TIMEOUT: Duration = Duration::from_secs(60);

/// `sc query` prints this for services that were never registered.
const NOT_INSTALLED: &str = "not exist as an installed service";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ServiceAction {
    Start,
    Stop,
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
        })
    }
}

/// The `sc` commands that manage the service.
#[derive(Clone, Debug)]
pub(crate) struct ViofsService {
    /// Registers the service; filled with the path of `virtiofs.exe`.
    create: CommandTemplate,
    start: String,
    stop: String,
    query: String,
    delete: String,
}

impl ViofsService {
    /// Reads `viofs_sc_{create,start,stop,query,delete}_cmd`. Only the
    /// delete command has a default.
    pub fn from_params(params: &Params) -> Result<Self, ScriptError> {
        Ok(Self {
            create: params.require("viofs_sc_create_cmd")?.into(),
            start: params.require("viofs_sc_start_cmd")?,
            stop: params.require("viofs_sc_stop_cmd")?,
            query: params.require("viofs_sc_query_cmd")?,
            delete: params
                .get_or("viofs_sc_delete_cmd", "sc delete VirtioFsSvc"),
        })
    }

    pub async fn query(&self, session: &dyn GuestSession) -> Result<String> {
        session.cmd_output(&self.query, SC_TIMEOUT).await
    }

    pub async fn is_registered(
        &self,
        session: &dyn GuestSession,
    ) -> Result<bool> {
        Ok(!self.query(session).await?.contains(NOT_INSTALLED))
    }

    /// Registers the service with the `virtiofs.exe` found on the virtio-win
    /// media.
    pub async fn register(
        &self,
        session: &dyn GuestSession,
        params: &Params,
        reporter: &Reporter,
    ) -> Result<()> {
        info!("Register virtiofs service in Windows guest.");
        let exe = find_exe(session, params, reporter, "virtiofs.exe").await?;
        let cmd = self.create.fill(&[exe.as_str()]).map_err(ScriptError::from)?;
        let (status, output) =
            session.cmd_status_output(&cmd, SC_TIMEOUT).await?;
        if status != 0 {
            return Err(reporter.fail(format!(
                "Failed to register virtiofs service, output is {}",
                output.trim()
            )));
        }
        Ok(())
    }

    pub async fn control(
        &self,
        session: &dyn GuestSession,
        action: ServiceAction,
        reporter: &Reporter,
    ) -> Result<()> {
        reporter.context(format!("Try to {action} VirtioFsSvc service."));
        let cmd = match action {
            ServiceAction::Start => &self.start,
            ServiceAction::Stop => &self.stop,
        };
        let (status, output) =
            session.cmd_status_output(cmd, SC_TIMEOUT).await?;
        if status != 0 {
            return Err(reporter.fail(format!(
                "Could not {action} VirtioFsSvc service, detail: '{}'",
                output.trim()
            )));
        }
        Ok(())
    }

    /// Registers the service if needed and starts it unless it runs.
    pub async fn ensure_running(
        &self,
        session: &dyn GuestSession,
        params: &Params,
        reporter: &Reporter,
    ) -> Result<()> {
        reporter.context("Start virtiofs service in guest.");
        if !self.is_registered(session).await? {
            self.register(session, params, reporter).await?;
        }
        if self.query(session).await?.contains("RUNNING") {
            info!("Virtiofs service is running.");
            return Ok(());
        }
        self.control(session, ServiceAction::Start, reporter).await
    }

    /// Stops and unregisters the service if it exists.
    pub async fn remove(
        &self,
        session: &dyn GuestSession,
        reporter: &Reporter,
    ) -> Result<()> {
        reporter.context("Delete virtiofs service in guest.");
        let state = self.query(session).await?;
        if state.contains(NOT_INSTALLED) {
            info!("virtiofs service is not registered");
            return Ok(());
        }
        if state.contains("RUNNING") {
            self.control(session, ServiceAction::Stop, reporter).await?;
        }
        let (status, output) =
            session.cmd_status_output(&self.delete, SC_TIMEOUT).await?;
        if status != 0 {
            return Err(reporter.error(format!(
                "Failed to delete virtiofs service, output is {}",
                output.trim()
            )));
        }
        Ok(())
    }
}

/// Turns on the service's debug log through the registry, rebooting for it
/// to take effect. Does nothing unless both `viofs_debug_enable_cmd` and
/// `viofs_log_enable_cmd` are set. Returns the session to keep using.
pub(crate) async fn enable_debug_log(
    vm: &dyn VmHandle,
    session: Box<dyn GuestSession>,
    params: &Params,
    reporter: &Reporter,
    login_timeout: Duration,
) -> Result<Box<dyn GuestSession>> {
    let (Some(debug_cmd), Some(log_cmd)) = (
        params.get("viofs_debug_enable_cmd"),
        params.get("viofs_log_enable_cmd"),
    ) else {
        return Ok(session);
    };

    reporter.context("Check if virtiofs debug log is enabled in guest.");
    let settings = session
        .cmd_output(&params.require("viofs_reg_query_cmd")?, SC_TIMEOUT)
        .await?
        .to_lowercase();
    if settings.contains("debugflags") && settings.contains("debuglogfile") {
        info!("Virtiofs debug log is enabled.");
        return Ok(session);
    }

    reporter.context("Configure virtiofs debug log.");
    for cmd in [&debug_cmd, &log_cmd] {
        reporter.context(format!("Set {cmd}"));
        let (status, output) =
            session.cmd_status_output(cmd, SC_TIMEOUT).await?;
        if status != 0 {
            return Err(reporter.fail(format!(
                "Fail command: {cmd}. Output: {}",
                output.trim()
            )));
        }
    }
    reporter.context("Reboot guest.");
    vm.reboot(session, RebootMethod::from_params(params)?, login_timeout).await
}

/// Waits for the share labelled `fs_target` to get a drive letter and
/// returns the letter without its colon.
pub(crate) async fn share_volume_letter(
    session: &dyn GuestSession,
    fs_target: &str,
    timeout: Duration,
    reporter: &Reporter,
) -> Result<String> {
    reporter.context(format!(
        "Get Volume letter of virtio fs target, the disk label is {fs_target}."
    ));
    wait_for_volume_letter(session, fs_target, timeout)
        .await?
        .ok_or_else(|| {
            reporter.fail("Could not get virtio-fs mounted volume letter.")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestcheck_framework::{
        fake::{Reply, ScriptedVm},
        guest_os::GuestOsKind,
    };

    fn service() -> ViofsService {
        ViofsService::from_params(&Params::from([
            (
                "viofs_sc_create_cmd",
                "sc create VirtioFsSvc binpath=%s start=auto",
            ),
            ("viofs_sc_start_cmd", "sc start VirtioFsSvc"),
            ("viofs_sc_stop_cmd", "sc stop VirtioFsSvc"),
            ("viofs_sc_query_cmd", "sc query VirtioFsSvc"),
        ]))
        .unwrap()
    }

    #[tokio::test]
    async fn running_service_is_left_alone() {
        let vm = ScriptedVm::new("vm1", GuestOsKind::Windows);
        vm.on("sc query", Reply::ok("STATE : 4 RUNNING"));
        let session = vm.wait_for_login(SC_TIMEOUT).await.unwrap();

        service()
            .ensure_running(&*session, &Params::new(), &Reporter::new())
            .await
            .unwrap();
        assert!(!vm.issued("sc create"));
        assert!(!vm.issued("sc start"));
    }

    #[tokio::test]
    async fn stopped_service_is_started() {
        let vm = ScriptedVm::new("vm1", GuestOsKind::Windows);
        vm.on("sc query", Reply::ok("STATE : 1 STOPPED"));
        let session = vm.wait_for_login(SC_TIMEOUT).await.unwrap();

        service()
            .ensure_running(&*session, &Params::new(), &Reporter::new())
            .await
            .unwrap();
        assert_eq!(vm.count("sc start VirtioFsSvc"), 1);
    }

    #[tokio::test]
    async fn failed_stop_fails_the_test() {
        let vm = ScriptedVm::new("vm1", GuestOsKind::Windows);
        vm.on(
            "sc stop",
            Reply::status(1062, "The service has not been started."),
        );
        let session = vm.wait_for_login(SC_TIMEOUT).await.unwrap();
        let reporter = Reporter::new();

        let err = service()
            .control(&*session, ServiceAction::Stop, &reporter)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Could not stop VirtioFsSvc service"));
    }

    #[tokio::test]
    async fn debug_log_is_configured_once() {
        let vm = ScriptedVm::new("vm1", GuestOsKind::Windows);
        vm.on(
            "reg query",
            Reply::ok(
                "DebugFlags REG_DWORD 0xf\nDebugLogFile REG_SZ C:\\viofs.log",
            ),
        );
        let params = Params::from([
            (
                "viofs_debug_enable_cmd",
                "reg add HKLM\\Software\\VirtIO-FS /v DebugFlags",
            ),
            (
                "viofs_log_enable_cmd",
                "reg add HKLM\\Software\\VirtIO-FS /v DebugLogFile",
            ),
            ("viofs_reg_query_cmd", "reg query HKLM\\Software\\VirtIO-FS"),
        ]);
        let session = vm.wait_for_login(SC_TIMEOUT).await.unwrap();

        enable_debug_log(&vm, session, &params, &Reporter::new(), SC_TIMEOUT)
            .await
            .unwrap();
        assert!(!vm.issued("reg add"));
        assert_eq!(vm.reboots(), 0);
    }
}
