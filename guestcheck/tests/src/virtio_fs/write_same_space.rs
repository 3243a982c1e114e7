// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use guestcheck_framework::{
    check::fields_equal,
    env::main_vm_name,
    resources::{Cleanup, NfsExport},
    session::GuestSession,
    vm::VmHandle,
};
use guestcheck_testcase::*;
use tracing::info;

use super::{deps_file, guest_join, mount_share, unmount_share};
use crate::fill;

const COPY_TIMEOUT: Duration = Duration::from_secs(120);

/// Boots the guest when the share is NFS-backed, which has to happen after
/// the export exists. The guest is destroyed before the export goes away.
async fn setup_local_nfs<'a>(
    ctx: &'a TestCtx,
    cleanup: &mut Cleanup<'a>,
) -> Result<()> {
    ctx.reporter.context("Set up local NFS");
    NfsExport::from_params(&ctx.params)?
        .setup(ctx.host(), cleanup)
        .await?;

    let mut params = ctx.params.clone();
    params.set("start_vm", "yes");
    ctx.env.preprocess(&params).await?;
    cleanup.defer("destroy the guest", move || ctx.env.destroy_all());
    Ok(())
}

async fn write_same_space(ctx: &TestCtx) -> Result<()> {
    let params = &ctx.params;
    let fs_dest = params.require("fs_dest")?;
    let fs_target = params.require("fs_target")?;
    let login_timeout = params.duration_secs("login_timeout", 360)?;

    let vm = ctx.env.get_vm(&main_vm_name(params))?;
    vm.verify_alive().await?;
    let session = vm.wait_for_login(login_timeout).await?;

    mount_share(&*session, &fs_target, &fs_dest, &ctx.reporter).await?;
    let mut release = Cleanup::new();
    release.defer(format!("unmount {fs_dest}"), || {
        unmount_share(&*session, &fs_dest)
    });
    let result =
        rewrite_mapped_region(ctx, vm.as_ref(), &*session, &fs_dest).await;
    release.run().await.conclude(result)?;
    session.close().await
}

/// Copies the mmap script into the mounted share, runs it and compares the
/// file sizes it reports.
async fn rewrite_mapped_region(
    ctx: &TestCtx,
    vm: &dyn VmHandle,
    session: &dyn GuestSession,
    fs_dest: &str,
) -> Result<()> {
    let params = &ctx.params;
    let test_file = params.require("test_file")?;
    let script = params.require("script_create_file")?;
    let cmd_create_file = params.require("cmd_create_file")?;
    let cmd_timeout = params.duration_secs("cmd_timeout", 120)?;

    let guest_file = guest_join(fs_dest, &test_file);
    info!(%guest_file, "The guest file in shared dir");

    ctx.reporter.context("write to the same space of a file with mmap.");
    vm.copy_files_to(
        &deps_file(ctx, "virtio_fs", &script),
        fs_dest,
        COPY_TIMEOUT,
    )
    .await?;
    let cmd = fill(&cmd_create_file, &[guest_file.as_str()])?;
    let output = session.cmd_output(&cmd, cmd_timeout).await?;

    // The script prints a label followed by the file size before and after
    // rewriting the mapped region.
    if output.split_whitespace().count() < 3 {
        return Err(ctx.reporter.error(format!(
            "unexpected output from {script}: {}",
            output.trim()
        )));
    }
    if !fields_equal(&output, 1, 2) {
        return Err(ctx
            .reporter
            .fail("The file size is increasing when writing the same space."));
    }
    Ok(())
}

/// Rewrites the same region of a file on a virtiofs share through mmap and
/// checks that the file does not grow.
///
/// 1. Set up a local NFS export when `setup_local_nfs` is on, then boot.
/// 2. Mount the share in the guest.
/// 3. Copy the mmap script into the share and run it.
/// 4. Compare the file sizes it reports.
#[guestcheck_testcase]
async fn virtio_fs_write_same_space(ctx: &TestCtx) {
    let mut cleanup = Cleanup::new();
    let mut result = Ok(());
    if ctx.params.get_bool("setup_local_nfs") {
        result = setup_local_nfs(ctx, &mut cleanup).await;
    }
    if result.is_ok() {
        result = write_same_space(ctx).await;
    }
    cleanup.run().await.conclude(result)?;
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
        os_type = "linux"
        test_file = "test_file"
        fs_dest = "/mnt/virtio_fs_test"
        fs_target = "myfs"
        script_create_file = "create_file.py"
        cmd_create_file = "python3 /mnt/virtio_fs_test/create_file.py %s"
    "#;

    const NAME: &str = "virtio_fs_write_same_space";

    /// A guest on which the share mounts on the first try and unmounts
    /// cleanly.
    fn guest(sizes: &str) -> ScriptedVm {
        let vm = ScriptedVm::new("vm1", GuestOsKind::Linux);
        // Not mounted, mounted, still mounted before unmounting, gone.
        vm.on("mountpoint -q", Reply::status(1, ""))
            .on("mountpoint -q", Reply::ok(""))
            .on("mountpoint -q", Reply::ok(""))
            .on("mountpoint -q", Reply::status(1, ""))
            .on("create_file.py", Reply::ok(sizes));
        vm
    }

    #[tokio::test]
    async fn unchanged_size_passes() {
        let harness = Harness::new(guest("size: 4096 4096"), PARAMS);

        let outcome = harness.run(NAME, virtio_fs_write_same_space).await;
        assert_eq!(outcome, TestOutcome::Passed);

        let vm = &harness.vm;
        assert!(vm.issued("mount -t virtiofs myfs /mnt/virtio_fs_test"));
        assert!(vm.issued("create_file.py /mnt/virtio_fs_test/test_file"));
        assert_eq!(vm.count("umount /mnt/virtio_fs_test"), 1);
        assert!(vm.issued("rm -rf /mnt/virtio_fs_test"));
        assert!(vm.events().contains(&GuestEvent::CopyTo {
            host: "/var/lib/guestcheck/deps/virtio_fs/create_file.py".into(),
            guest: "/mnt/virtio_fs_test".to_owned(),
        }));
        assert!(harness.host.commands().is_empty());
    }

    #[tokio::test]
    async fn growing_file_fails() {
        let harness = Harness::new(guest("size: 4096 8192"), PARAMS);

        let outcome = harness.run(NAME, virtio_fs_write_same_space).await;
        assert!(
            matches!(
                outcome,
                TestOutcome::Failed(Some(ref msg))
                    if msg.contains("file size is increasing")
            ),
            "{outcome:?}"
        );
        assert_eq!(harness.vm.count("umount /mnt/virtio_fs_test"), 1);
        assert!(harness.vm.issued("rm -rf /mnt/virtio_fs_test"));
    }

    #[tokio::test]
    async fn share_left_mounted_is_an_error() {
        let vm = ScriptedVm::new("vm1", GuestOsKind::Linux);
        vm.on("mountpoint -q", Reply::status(1, ""))
            .on("mountpoint -q", Reply::ok(""))
            .on("umount", Reply::status(32, "target is busy"))
            .on("create_file.py", Reply::ok("size: 4096 4096"));
        let harness = Harness::new(vm, PARAMS);

        let outcome = harness.run(NAME, virtio_fs_write_same_space).await;
        assert!(
            matches!(
                outcome,
                TestOutcome::Errored(Some(ref msg))
                    if msg.contains("/mnt/virtio_fs_test is still mounted")
            ),
            "{outcome:?}"
        );
        assert!(!harness.vm.issued("rm -rf /mnt/virtio_fs_test"));
    }

    #[tokio::test]
    async fn unmountable_share_fails() {
        let vm = ScriptedVm::new("vm1", GuestOsKind::Linux);
        vm.on("mountpoint -q", Reply::status(1, "")).on(
            "mount -t virtiofs",
            Reply::status(32, "mount: unknown filesystem type"),
        );
        let harness = Harness::new(vm, PARAMS);

        let outcome = harness.run(NAME, virtio_fs_write_same_space).await;
        assert!(
            matches!(
                outcome,
                TestOutcome::Failed(Some(ref msg))
                    if msg.contains("Mount virtiofs target failed")
            ),
            "{outcome:?}"
        );
        assert!(!harness.vm.issued("create_file.py"));
        assert!(!harness.vm.issued("umount"));
    }

    #[tokio::test]
    async fn nfs_backed_share_is_exported_before_boot_and_released() {
        let params = format!(
            r#"{PARAMS}
            setup_local_nfs = "yes"
            start_vm = "no"
            export_dir = "/mnt/virtio_fs_test_nfs"
            nfs_mount_src = "localhost:/mnt/virtio_fs_test_nfs"
            nfs_mount_dir = "/var/tmp/virtio_fs_test"
            "#
        );
        let harness = Harness::new(guest("size: 4096 4096"), &params);

        let outcome = harness.run(NAME, virtio_fs_write_same_space).await;
        assert_eq!(outcome, TestOutcome::Passed);
        assert_eq!(harness.factory.created().len(), 1);
        assert!(harness.vm.events().contains(&GuestEvent::Destroy));

        let host = harness.host.commands();
        let unmount =
            host.iter().position(|c| c == "umount /var/tmp/virtio_fs_test");
        let unexport = host.iter().position(|c| c.starts_with("exportfs -u"));
        assert!(unmount.is_some() && unmount < unexport, "{host:?}");
    }
}
