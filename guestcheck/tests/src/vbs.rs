// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtualization based security on a secure boot Windows guest, checked
//! with the Device Guard readiness tool.

use std::time::Duration;

use guestcheck_framework::{
    check::Check,
    env::main_vm_name,
    precondition::Precondition,
    sequence::{SequenceRunner, Severity, Step},
    session::GuestSession,
    vm::{RebootMethod, VmHandle},
};
use guestcheck_testcase::*;
use tracing::info;

const DG_TIMEOUT: Duration = Duration::from_secs(180);

/// The Device Guard commands, all taken from params.
struct DeviceGuard {
    check_secure_boot: String,
    path: String,
    execution_policy: String,
    enable: String,
    disable: String,
    ready: String,
    get: String,
    ready_info: String,
    enable_info: String,
    dst_path: String,
}

impl DeviceGuard {
    fn from_params(params: &Params) -> Result<Self, ScriptError> {
        Ok(Self {
            check_secure_boot: params.require("check_secure_boot_enabled_cmd")?,
            path: params.require("dgreadiness_path_command")?,
            execution_policy: params.require("executionPolicy_command")?,
            enable: params.require("enable_command")?,
            disable: params.require("disable_command")?,
            ready: params.require("ready_command")?,
            get: params.require("dg_command")?,
            ready_info: params.require("check_ready_info")?,
            enable_info: params.require("check_enable_info")?,
            dst_path: params.require("dst_path")?,
        })
    }

    fn step(&self, description: &str, command: &str) -> Step {
        Step::new(description, command).timeout(DG_TIMEOUT)
    }

    /// Steps that put the tool in place and ask it whether VBS runs. The
    /// readiness output comes last.
    fn readiness_steps(&self) -> Vec<Step> {
        vec![
            self.step("Enter the Device Guard directory", &self.path),
            self.step("Set the execution policy", &self.execution_policy),
            self.step("Query VBS readiness", &self.ready),
        ]
    }

    fn ready_check(&self) -> Check {
        Check::contains("VBS is running", self.ready_info.clone())
    }

    /// A readiness query whose check is only enforced when `toggle` is on.
    fn soft_ready_step(
        &self,
        description: &str,
        check: Check,
        toggle: &str,
    ) -> Step {
        self.step(description, &self.ready)
            .expect(check)
            .severity(Severity::soft(toggle))
    }
}

/// Runs the readiness steps and returns the readiness output.
async fn query_readiness(
    dg: &DeviceGuard,
    runner: &SequenceRunner<'_>,
) -> Result<String> {
    let outputs = runner.run(&dg.readiness_steps()).await?;
    let ready = outputs.last().cloned().unwrap_or_default();
    info!(output = %ready, "DG ready output");
    Ok(ready)
}

async fn copy_device_guard(
    ctx: &TestCtx,
    vm: &dyn VmHandle,
    session: &dyn GuestSession,
    dg: &DeviceGuard,
) -> Result<()> {
    ctx.reporter.context("Copy Device Guard to guest");
    let (status, output) = session
        .cmd_status_output(&format!("mkdir {}", dg.dst_path), DG_TIMEOUT)
        .await?;
    if status != 0 && !output.contains("already exists") {
        return Err(ctx.reporter.error(format!(
            "Could not create Device Guard directory in VM '{}', detail: '{}'",
            vm.name(),
            output.trim()
        )));
    }
    let tool = ctx.dirs.deps_dir("dgreadiness");
    vm.copy_files_to(&tool, &dg.dst_path, DG_TIMEOUT).await
}

/// Enables VBS unless it already runs, reboots and checks that it runs,
/// then disables it again. Returns the session to close.
async fn enable_and_verify(
    ctx: &TestCtx,
    params: &Params,
    vm: &dyn VmHandle,
    session: Box<dyn GuestSession>,
    dg: &DeviceGuard,
    login_timeout: Duration,
) -> Result<Box<dyn GuestSession>> {
    let reporter = &ctx.reporter;
    Precondition::new(
        "Check secure boot is enabled",
        dg.check_secure_boot.as_str(),
        Check::lacks("secure boot is enabled", "False"),
    )
    .require(&*session, reporter)
    .await?;

    copy_device_guard(ctx, vm, &*session, dg).await?;

    info!("Before doing anything, check VBS status...");
    let runner = SequenceRunner::new(&*session, params, reporter);
    let ready = query_readiness(dg, &runner).await?;
    if dg.ready_check().holds(&ready) {
        info!("VBS is already enabled, and guest boot up successfully");
        return Ok(session);
    }

    // Device Guard needs a moment between its commands to settle.
    info!("Enable VBS...");
    tokio::time::sleep(Duration::from_secs(2)).await;
    let enabled = runner.run_step(&dg.step("Enable VBS", &dg.enable)).await?;
    info!(output = %enabled, "DG enable output");
    tokio::time::sleep(Duration::from_secs(2)).await;
    let ready = runner
        .run_step(&dg.soft_ready_step(
            "Query VBS readiness after enabling",
            dg.ready_check(),
            "check_vbs_ready_after_enable",
        ))
        .await?;
    info!(output = %ready, "DG ready output");
    tokio::time::sleep(Duration::from_secs(2)).await;
    let state = runner.run_step(&dg.step("Get VBS state", &dg.get)).await?;
    info!(output = %state, "DG get output");

    if !enabled.contains(&dg.enable_info) {
        return Err(reporter.fail(format!(
            "Device Guard enable failed. The actual output is {}",
            enabled.trim()
        )));
    }

    reporter.context("Reboot guest");
    let method = RebootMethod::from_params(params)?;
    let session = vm.reboot(session, method, login_timeout).await?;

    let runner = SequenceRunner::new(&*session, params, reporter);
    let ready = query_readiness(dg, &runner).await?;
    let state = runner.run_step(&dg.step("Get VBS state", &dg.get)).await?;
    info!(output = %state, "DG get output");
    if !dg.ready_check().holds(&ready) {
        return Err(reporter.fail(format!(
            "Device Guard running failed. The actual output is {}",
            ready.trim()
        )));
    }

    info!("Disable vbs...");
    let disabled = runner.run_step(&dg.step("Disable VBS", &dg.disable)).await?;
    info!(output = %disabled, "DG disable output");
    let ready = runner
        .run_step(&dg.soft_ready_step(
            "Query VBS readiness after disabling",
            Check::lacks("VBS is no longer running", dg.ready_info.clone()),
            "check_vbs_disabled",
        ))
        .await?;
    info!(output = %ready, "DG ready output");
    let state = runner.run_step(&dg.step("Get VBS state", &dg.get)).await?;
    info!(output = %state, "DG get output");
    Ok(session)
}

/// Verifies Secure MOR control using the Device Guard tool:
///
/// 1. Boot the guest with secure boot firmware variables.
/// 2. Check that secure boot is enabled.
/// 3. Copy Device Guard into the guest.
/// 4. Enable Device Guard unless VBS already runs, and check the output.
/// 5. Reboot and check that VBS runs.
/// 6. Disable Device Guard.
#[guestcheck_testcase]
async fn vbs(ctx: &TestCtx) {
    let mut params = ctx.params.clone();
    let login_timeout = params.duration_secs("login_timeout", 360)?;
    params.set("ovmf_vars_filename", "OVMF_VARS.secboot.fd");
    params.set("start_vm", "yes");
    let dg = DeviceGuard::from_params(&params)?;

    let vm = ctx.env.preprocess_vm(&params, &main_vm_name(&params)).await?;
    let session = vm.wait_for_serial_login(login_timeout).await?;
    let session = enable_and_verify(
        ctx,
        &params,
        vm.as_ref(),
        session,
        &dg,
        login_timeout,
    )
    .await?;
    session.close().await?;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::Harness;
    use guestcheck_framework::{
        fake::{GuestEvent, Reply, ScriptedVm},
        guest_os::GuestOsKind,
    };

    const PARAMS: &str = r#"
        main_vm = "vm1"
        os_type = "windows"

        [tests.vbs]
        start_vm = "no"
        check_secure_boot_enabled_cmd = "echo True"
        dgreadiness_path_command = "cd C:\\dgreadiness"
        executionPolicy_command = "Set-ExecutionPolicy Unrestricted"
        enable_command = "DG_Readiness_Tool.ps1 -Enable"
        disable_command = "DG_Readiness_Tool.ps1 -Disable"
        ready_command = "DG_Readiness_Tool.ps1 -Ready"
        dg_command = "Get-CimInstance Win32_DeviceGuard"
        check_ready_info = "Enabled"
        check_enable_info = "Enabling"
        dst_path = "C:\\dgreadiness"
    "#;

    fn guest(secure_boot: &str) -> ScriptedVm {
        let vm = ScriptedVm::new("vm1", GuestOsKind::Windows);
        vm.on("echo True", Reply::ok(secure_boot));
        vm
    }

    #[tokio::test(start_paused = true)]
    async fn running_vbs_passes_without_enabling() {
        let vm = guest("True");
        vm.on(
            "-Ready",
            Reply::ok("HVCI, Credential-Guard, and Config-CI are Enabled"),
        );
        let harness = Harness::new(vm, PARAMS);

        assert_eq!(harness.run("vbs", vbs).await, TestOutcome::Passed);
        assert!(!harness.vm.issued("-Enable"));
        assert!(!harness.vm.issued("-Disable"));

        let (_, params) = &harness.factory.created()[0];
        assert_eq!(
            params.get("ovmf_vars_filename").as_deref(),
            Some("OVMF_VARS.secboot.fd")
        );
        assert!(harness.vm.events().contains(&GuestEvent::CopyTo {
            host: "/var/lib/guestcheck/deps/dgreadiness".into(),
            guest: "C:\\dgreadiness".to_string(),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn vbs_is_enabled_and_verified_after_a_reboot() {
        let vm = guest("True");
        vm.on("-Ready", Reply::ok("Readiness: Disabled"))
            .on("-Ready", Reply::ok("Readiness: Enabled"))
            .on("-Enable", Reply::ok("Enabling Hyper-V and HVCI"));
        let harness = Harness::new(vm, PARAMS);

        assert_eq!(harness.run("vbs", vbs).await, TestOutcome::Passed);
        assert_eq!(harness.vm.reboots(), 1);
        assert!(harness.vm.events().iter().any(|e| matches!(
            e,
            GuestEvent::Command { boot: 1, command, .. }
                if command.contains("-Disable")
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_after_enabling_is_only_logged_by_default() {
        let vm = guest("True");
        vm.on("-Ready", Reply::ok("Readiness: Disabled"))
            .on("-Ready", Reply::ok("Readiness: Disabled"))
            .on("-Ready", Reply::ok("Readiness: Enabled"))
            .on("-Enable", Reply::ok("Enabling Hyper-V and HVCI"));
        let harness = Harness::new(vm, PARAMS);

        assert_eq!(harness.run("vbs", vbs).await, TestOutcome::Passed);
        let before_reboot = harness
            .vm
            .events()
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    GuestEvent::Command { boot: 0, command, .. }
                        if command.contains("-Ready")
                )
            })
            .count();
        assert_eq!(before_reboot, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_after_enabling_is_enforced_when_toggled_on() {
        let params = format!(
            r#"{PARAMS}
        check_vbs_ready_after_enable = "yes"
            "#
        );
        let vm = guest("True");
        vm.on("-Ready", Reply::ok("Readiness: Disabled"))
            .on("-Enable", Reply::ok("Enabling Hyper-V and HVCI"));
        let harness = Harness::new(vm, &params);

        let outcome = harness.run("vbs", vbs).await;
        assert!(
            matches!(
                outcome,
                TestOutcome::Failed(Some(ref msg))
                    if msg.contains("Query VBS readiness after enabling")
            ),
            "{outcome:?}"
        );
        assert_eq!(harness.vm.reboots(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn vbs_not_running_after_the_reboot_fails() {
        let vm = guest("True");
        vm.on("-Ready", Reply::ok("Disabled"))
            .on("-Ready", Reply::ok("Disabled"))
            .on("-Enable", Reply::ok("Enabling Hyper-V and HVCI"));
        let harness = Harness::new(vm, PARAMS);

        let outcome = harness.run("vbs", vbs).await;
        assert!(
            matches!(
                outcome,
                TestOutcome::Failed(Some(ref msg))
                    if msg.contains("Device Guard running failed")
            ),
            "{outcome:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_secure_boot_fails_before_copying() {
        let vm = guest("False");
        let harness = Harness::new(vm, PARAMS);

        let outcome = harness.run("vbs", vbs).await;
        assert!(matches!(outcome, TestOutcome::Failed(_)), "{outcome:?}");
        assert!(!harness.vm.issued("mkdir"));
    }

    #[tokio::test(start_paused = true)]
    async fn directory_creation_errors_are_test_errors() {
        let vm = guest("True");
        vm.on("mkdir", Reply::status(1, "Access is denied."));
        let harness = Harness::new(vm, PARAMS);

        let outcome = harness.run("vbs", vbs).await;
        assert!(matches!(outcome, TestOutcome::Errored(_)), "{outcome:?}");
    }
}
