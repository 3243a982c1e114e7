// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use camino::Utf8Path;
use guestcheck_framework::{
    env::main_vm_name,
    host::system,
    session::GuestSession,
    vm::{RebootMethod, VmHandle},
    windows::virtio_win::DEFAULT_EXE_FIND_CMD,
};
use guestcheck_testcase::*;
use tracing::info;

use super::{
    installer::{GuestAgent, GuestTools, InstallerAction},
    network::StaticNetwork,
    VirtioDriver, DRIVERS, VIOMEM,
};
use crate::viofs_service::ViofsService;

const COPY_TIMEOUT: Duration = Duration::from_secs(600);
const ISO_TIMEOUT: Duration = Duration::from_secs(600);
const QUERY_TIMEOUT: Duration = Duration::from_secs(60);

fn drivers_under_test(params: &Params) -> Vec<VirtioDriver> {
    let mut drivers = DRIVERS.to_vec();
    if params.get_bool("boot_with_viomem") {
        drivers.push(VIOMEM);
    }
    drivers
}

/// Swaps the virtio-win iso for the image named by `key`.
async fn change_virtio_media(
    ctx: &TestCtx,
    vm: &dyn VmHandle,
    key: &str,
) -> Result<()> {
    let iso = ctx.data_path(&ctx.params.require(key)?);
    info!(%iso, "Changing virtio iso image");
    vm.change_media("drive_virtio", &iso).await?;
    // Windows pops up a window for the new media, which must not cover the
    // installer's.
    tokio::time::sleep(Duration::from_secs(2)).await;
    Ok(())
}

/// Installs the previous release of the guest tools and leaves state the
/// upgrade must keep: a static network setup and a registered virtiofs
/// service. Returns the static setup if the NIC got one.
async fn install_previous_release(
    ctx: &TestCtx,
    vm: &dyn VmHandle,
    tools: &GuestTools,
    session: Box<dyn GuestSession>,
) -> Result<(Box<dyn GuestSession>, Option<StaticNetwork>)> {
    let params = &ctx.params;
    let reporter = &ctx.reporter;
    let login_timeout = params.duration_secs("login_timeout", 360)?;

    reporter.context("Install drivers from previous installer");
    change_virtio_media(ctx, vm, "cdrom_virtio_downgrade").await?;
    let session = tools
        .run_with_interaction(
            vm,
            session,
            params,
            reporter,
            InstallerAction::Install,
            true,
        )
        .await?;

    let network = StaticNetwork::from_params(params)?;
    let nic = StaticNetwork::nic(vm, reporter)?;
    let serial = vm.wait_for_serial_login(login_timeout).await?;
    let configured = network.configure(&*serial, nic, reporter).await;
    serial.close().await?;
    let network = configured?.then_some(network);

    reporter.context("Start viofs service...");
    let mut service_params = params.clone();
    service_params.set("exe_find_cmd", DEFAULT_EXE_FIND_CMD);
    ViofsService::from_params(&service_params)?
        .ensure_running(&*session, &service_params, reporter)
        .await?;

    change_virtio_media(ctx, vm, "cdrom_virtio").await?;
    Ok((session, network))
}

/// After installing, the virtiofs service is registered but stopped and the
/// balloon service runs.
async fn check_services(
    ctx: &TestCtx,
    session: &dyn GuestSession,
    service: &ViofsService,
    drivers: &[VirtioDriver],
) -> Result<()> {
    let reporter = &ctx.reporter;
    let mut failed = Vec::new();
    for driver in drivers {
        match driver.name {
            "viofs" => {
                reporter.context("Check viofs service.");
                let output = service.query(session).await?;
                if !output.to_lowercase().contains("stopped") {
                    failed.push(driver.name);
                }
            }
            "balloon" => {
                reporter.context("Check balloon service.");
                let cmd = ctx
                    .params
                    .get_or("balloon_status_cmd", "sc query BalloonService");
                let output = session.cmd_output(&cmd, QUERY_TIMEOUT).await?;
                if !output.to_lowercase().contains("running") {
                    failed.push(driver.name);
                }
            }
            _ => {}
        }
    }
    if !failed.is_empty() {
        return Err(reporter.fail(format!(
            "Virtiofs/Balloon service isn't created,\
             failed driver name is {failed:?}"
        )));
    }
    Ok(())
}

/// Copies the installed driver tree to the host and builds an iso from it.
async fn build_iso(ctx: &TestCtx, vm: &dyn VmHandle) -> Result<()> {
    let params = &ctx.params;
    ctx.reporter.context("Create a virtio-win iso from the installed drivers.");
    let guest_path = params.require("guest_path")?;
    let host_path = params.require("host_installer_path")?;
    vm.copy_files_from(&guest_path, Utf8Path::new(&host_path), COPY_TIMEOUT)
        .await?;
    system(ctx.host(), &params.require("mkiso_cmd")?, ISO_TIMEOUT).await?;
    Ok(())
}

/// Prepares a Windows image with the latest signed virtio-win drivers, and
/// checks the guest tools installer on the way.
///
/// 1. Remove the virtiofs service, every driver and the guest agent,
///    noting the agent version the installer has to bring back.
/// 2. With `update_test`, install the previous release first and set up
///    state the upgrade must keep.
/// 3. Run the installer.
/// 4. With `create_iso`, copy the drivers out into an iso and stop.
/// 5. Otherwise optionally repair, then check the package, agent version,
///    drivers and services, the static network after an upgrade, and with
///    `install_uninstall_test` that uninstalling removes everything.
#[guestcheck_testcase]
async fn win_virtio_driver_installer_pretest(ctx: &TestCtx) {
    let params = &ctx.params;
    let reporter = &ctx.reporter;
    let login_timeout = params.duration_secs("login_timeout", 360)?;
    let tools = GuestTools::from_params(params)?;
    let agent = GuestAgent::from_params(params)?;
    let service = ViofsService::from_params(params)?;
    let drivers = drivers_under_test(params);

    let vm = ctx.env.get_vm(&main_vm_name(params))?;
    let vm = vm.as_ref();
    let mut session = vm.wait_for_login(login_timeout).await?;

    service.remove(&*session, reporter).await?;
    tools.uninstall_drivers(&*session, &drivers, reporter).await?;
    let expected_agent = if params.get_bool("create_iso") {
        None
    } else {
        let version = agent.install(&*session, reporter).await?;
        agent.uninstall(&*session, reporter).await?;
        Some(version)
    };
    session = vm
        .reboot(session, RebootMethod::from_params(params)?, login_timeout)
        .await?;

    let mut network = None;
    if params.get_bool("update_test") {
        (session, network) =
            install_previous_release(ctx, vm, &tools, session).await?;
    }

    session = tools
        .run_with_interaction(
            vm,
            session,
            params,
            reporter,
            InstallerAction::Install,
            true,
        )
        .await?;

    // Building the iso keeps the tools installed for the image backup.
    let Some(expected_agent) = expected_agent else {
        build_iso(ctx, vm).await?;
        session.close().await?;
        return Ok(());
    };

    if params.get_bool("repair_test") {
        session = tools.remove_driver_msi(vm, session, params, reporter).await?;
        session = tools
            .run_with_interaction(
            vm,
            session,
            params,
            reporter,
            InstallerAction::Repair,
            false,
        )
            .await?;
    }

    tokio::time::sleep(Duration::from_secs(3)).await;
    tools.check_package(&*session, reporter).await?;
    agent.check_version(&*session, &expected_agent, reporter).await?;
    tools.check_installed(&*session, &drivers, reporter).await?;
    check_services(ctx, &*session, &service, &drivers).await?;

    if let Some(network) = &network {
        let nic = StaticNetwork::nic(vm, reporter)?;
        let serial = vm.wait_for_serial_login(login_timeout).await?;
        let verified = network.verify(&*serial, nic, reporter).await;
        serial.close().await?;
        verified?;
    }

    if params.get_bool("install_uninstall_test") {
        reporter.context("Run virtio-win-guest-tools.exe uninstall test");
        session = tools
            .run_with_interaction(
            vm,
            session,
            params,
            reporter,
            InstallerAction::Uninstall,
            false,
        )
            .await?;
        tools.check_uninstalled(&*session, &drivers, reporter).await?;
        tokio::time::sleep(Duration::from_secs(10)).await;

        reporter.context("Check qemu-ga service.");
        if agent.is_running(&*session).await? {
            return Err(
                reporter.fail("qemu-ga service still running after uninstall")
            );
        }
    }
    session.close().await?;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::Harness;
    use camino::Utf8PathBuf;
    use guestcheck_framework::{
        fake::{GuestEvent, Reply, ScriptedVm},
        guest_os::GuestOsKind,
        vm::NicInfo,
    };

    const NAME: &str = "win_virtio_driver_installer_pretest";

    const PARAMS: &str = r#"
        main_vm = "vm1"
        os_type = "windows"
        virtio_win_media_type = "iso"
        cdrom_virtio = "isos/windows/virtio-win.iso"
        cdrom_virtio_downgrade = "isos/windows/virtio-win-prewhql.iso"
        run_install_cmd = "C:\\AutoIt3_x64.exe C:\\install.au3"
        run_repair_cmd = "C:\\AutoIt3_x64.exe C:\\repair.au3"
        run_uninstall_cmd = "C:\\AutoIt3_x64.exe C:\\uninstall.au3"
        installer_pkg_check_cmd = """\
            wmic product get name | findstr /I virtio-win"""
        vio_driver_chk_cmd = "driverquery /si | find /i \"%s\""
        qemu_ga_pkg = "C:\\qemu-ga-x86_64.msi"
        gagent_install_cmd = "msiexec /i %s /qn"
        gagent_uninstall_cmd = "msiexec /x C:\\qemu-ga-x86_64.msi /qn"
        gagent_pkg_info_cmd = """\
            wmic product where name='QEMU guest agent' get version"""
        viofs_sc_create_cmd = "sc create VirtioFsSvc binpath=\"%s\" start=auto"
        viofs_sc_start_cmd = "sc start VirtioFsSvc"
        viofs_sc_stop_cmd = "sc stop VirtioFsSvc"
        viofs_sc_query_cmd = "sc query VirtioFsSvc"
    "#;

    const NOT_INSTALLED: &str =
        "[SC] EnumQueryServicesStatus:OpenService FAILED 1060:\r\n\r\nThe \
         specified service does not exist as an installed service.";

    /// Number of drivers the guest tools can remove.
    fn removable() -> usize {
        DRIVERS.iter().filter(|d| d.removable).count()
    }

    /// A guest freshly stripped of drivers; `installed` driver queries
    /// follow the clean-up ones.
    fn guest(installed: &[&str]) -> ScriptedVm {
        guest_with_service(installed, &[NOT_INSTALLED, "STATE : 1 STOPPED"])
    }

    /// Like [`guest`], with the virtiofs service reporting `states` in
    /// order.
    fn guest_with_service(installed: &[&str], states: &[&str]) -> ScriptedVm {
        let vm = ScriptedVm::new("vm1", GuestOsKind::Windows);
        for _ in 0..removable() {
            vm.on("driverquery /si", Reply::ok(""));
        }
        for output in installed {
            vm.on("driverquery /si", Reply::ok(*output));
        }
        for state in states {
            vm.on("sc query VirtioFsSvc", Reply::ok(*state));
        }
        vm.on("sc query BalloonService", Reply::ok("STATE : 4 RUNNING"))
            .on("get version", Reply::ok("Version\r\n108.0.2\r\n"))
            .on("sc query qemu-ga", Reply::status(1, ""));
        vm
    }

    const INSTALLED: &str = "oem7.inf  VirtIO Driver  TRUE";

    #[tokio::test(start_paused = true)]
    async fn fresh_install_passes_its_checks() {
        let harness = Harness::new(guest(&[INSTALLED]), PARAMS);

        let outcome =
            harness.run(NAME, win_virtio_driver_installer_pretest).await;
        assert_eq!(outcome, TestOutcome::Passed);

        let vm = &harness.vm;
        assert!(vm.issued("msiexec /i C:\\qemu-ga-x86_64.msi /qn"));
        assert!(vm.issued("msiexec /x C:\\qemu-ga-x86_64.msi /qn"));
        assert!(vm.issued("C:\\install.au3"));
        assert!(!vm.issued("pnputil"));
        assert!(!vm.issued("sc delete"));
        assert_eq!(vm.reboots(), 2);
        let keys = vm
            .events()
            .into_iter()
            .filter(|e| matches!(e, GuestEvent::SendKey(_)))
            .count();
        assert_eq!(keys, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn leftover_drivers_are_deleted_before_installing() {
        let vm = ScriptedVm::new("vm1", GuestOsKind::Windows);
        vm.on(
            "driverquery /si",
            Reply::ok("oem3.inf  VirtIO Balloon Driver  TRUE"),
        )
        .on("driverquery /si", Reply::ok(""))
        .on("sc query VirtioFsSvc", Reply::ok("STATE : 4 RUNNING"))
        .on("get version", Reply::ok("Version\r\n108.0.2\r\n"));
        let params = format!(
            r#"{PARAMS}
            create_iso = "yes"
            guest_path = 'C:\virtio-win'
            host_installer_path = "/var/tmp/installer"
            mkiso_cmd = """\
                genisoimage -o /var/tmp/virtio-win.iso /var/tmp/installer"""
            "#
        );
        let harness = Harness::new(vm, &params);

        let outcome =
            harness.run(NAME, win_virtio_driver_installer_pretest).await;
        assert_eq!(outcome, TestOutcome::Passed);

        let vm = &harness.vm;
        assert_eq!(
            vm.count("pnputil /delete-driver oem3.inf /uninstall /force"),
            1
        );
        assert!(vm.issued("sc stop VirtioFsSvc"));
        assert!(vm.issued("sc delete VirtioFsSvc"));
        assert!(!vm.issued("msiexec"));
        assert!(vm.events().contains(&GuestEvent::CopyFrom {
            guest: "C:\\virtio-win".to_owned(),
            host: "/var/tmp/installer".into(),
        }));
        assert!(harness.host.issued("genisoimage -o /var/tmp/virtio-win.iso"));
        assert!(!vm.issued("wmic product get name"));
    }

    #[tokio::test(start_paused = true)]
    async fn agent_version_mismatch_fails() {
        let vm = guest(&[INSTALLED]);
        vm.on("get version", Reply::ok("Version\r\n107.0.1\r\n"));
        let harness = Harness::new(vm, PARAMS);

        let outcome =
            harness.run(NAME, win_virtio_driver_installer_pretest).await;
        assert!(matches!(
            outcome,
            TestOutcome::Failed(Some(ref msg))
                if msg.contains("qemu-ga version is 107.0.1")
        ), "{outcome:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_driver_fails_the_driver_check() {
        let mut installed = vec![INSTALLED; DRIVERS.len()];
        installed[4] = "";
        installed.push(INSTALLED);
        let harness = Harness::new(guest(&installed), PARAMS);

        let outcome =
            harness.run(NAME, win_virtio_driver_installer_pretest).await;
        assert!(matches!(
            outcome,
            TestOutcome::Failed(Some(ref msg))
                if msg.contains("[\"viofs\"] driver check failed")
        ), "{outcome:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn agent_left_running_after_uninstall_fails() {
        let mut queries = vec![INSTALLED; DRIVERS.len()];
        queries.push("");
        let vm = guest(&queries);
        vm.on("sc query qemu-ga", Reply::ok("STATE : 4 RUNNING"));
        let params = format!("{PARAMS}\ninstall_uninstall_test = \"yes\"\n");
        let harness = Harness::new(vm, &params);

        let outcome =
            harness.run(NAME, win_virtio_driver_installer_pretest).await;
        assert!(matches!(
            outcome,
            TestOutcome::Failed(Some(ref msg))
                if msg.contains("qemu-ga service still running after uninstall")
        ), "{outcome:?}");
        assert!(harness.vm.issued("C:\\uninstall.au3"));
        assert_eq!(harness.vm.reboots(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn upgrade_keeps_the_static_network() {
        // Removed, unregistered when the upgrade starts it, then stopped.
        let vm = guest_with_service(
            &[INSTALLED],
            &[NOT_INSTALLED, NOT_INSTALLED, "STATE : 1 STOPPED"],
        )
        .with_nic(NicInfo {
                name: "nic1".into(),
                model: "e1000e".into(),
                mac: "52:54:00:00:00:01".into(),
            })
            .with_nic(NicInfo {
                name: "nic2".into(),
                model: "virtio-net-pci".into(),
                mac: "52:54:00:12:34:56".into(),
            });
        vm.on("Get-Volume", Reply::ok("E\r\n"))
            .on(
                "wmic os get caption",
                Reply::ok(
                    "Caption\r\nMicrosoft Windows Server 2019 Datacenter\r\n",
                ),
            )
            .on(
                "wmic os get osarchitecture",
                Reply::ok("OSArchitecture\r\n64-bit\r\n"),
            )
            .on(
                "virtiofs.exe",
                Reply::ok("E:\\viofs\\2k19\\amd64\\virtiofs.exe\r\n"),
            )
            .on(
                "get netconnectionid",
                Reply::ok("NetConnectionID\r\nEthernet 2\r\n"),
            )
            .on(
                "get IPAddress",
                Reply::ok(concat!(
                    "IPAddress\r\n",
                    "{\"192.168.10.5\", \"fe80::5054:ff:fe12:3456\"}\r\n",
                )),
            )
            .on(
                "get DNSServerSearchOrder",
                Reply::ok("DNSServerSearchOrder\r\n{\"192.168.10.1\"}\r\n"),
            );
        let params = format!(
            r#"{PARAMS}
            update_test = "yes"
            static_ip = "192.168.10.5"
            static_dns = "192.168.10.1"
            setup_ip_cmd = """\
                netsh interface ip set address "%s" static \
                192.168.10.5 255.255.255.0 192.168.10.1"""
            setup_dns_cmd = """\
                netsh interface ip set dns "%s" static 192.168.10.1"""
            "#
        );
        let harness = Harness::new(vm, &params);

        let outcome =
            harness.run(NAME, win_virtio_driver_installer_pretest).await;
        assert_eq!(outcome, TestOutcome::Passed);

        let vm = &harness.vm;
        assert!(
            vm.issued("netsh interface ip set address \"Ethernet 2\" static")
        );
        assert!(vm.issued(concat!(
            "sc create VirtioFsSvc binpath=",
            "\"E:\\viofs\\2k19\\amd64\\virtiofs.exe\"",
        )));
        assert!(vm.issued("sc start VirtioFsSvc"));
        let media: Vec<_> = vm
            .events()
            .into_iter()
            .filter_map(|e| match e {
                GuestEvent::ChangeMedia { image, .. } => Some(image),
                _ => None,
            })
            .collect();
        let isos = Utf8PathBuf::from("/var/lib/guestcheck/data/isos/windows");
        assert_eq!(
            media,
            [
                isos.join("virtio-win-prewhql.iso"),
                isos.join("virtio-win.iso"),
            ]
        );
        assert_eq!(vm.reboots(), 3);
    }
}
