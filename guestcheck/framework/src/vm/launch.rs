// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Routines and data structures for building QEMU command lines and working
//! with QEMU processes.

use std::{fmt::Debug, process::Stdio};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{info, warn};

use crate::{error::ScriptError, params::Params};

use super::{NicInfo, VirtioFsDevice};

/// Host resources reserved for a VM before QEMU starts.
#[derive(Debug)]
pub(crate) struct VmLayout {
    /// The host TCP port serving the guest's first serial port.
    pub serial_port: u16,

    /// The host port forwarded to the guest's remote shell.
    pub shell_port: u16,
    pub guest_shell_port: u16,

    /// The host port forwarded to the guest's file transfer service.
    pub transfer_port: u16,
    pub guest_transfer_port: u16,

    pub qmp_socket: Utf8PathBuf,

    /// The VM's private copy of the UEFI variable store, if it boots UEFI.
    pub ovmf_vars: Option<Utf8PathBuf>,
    pub virtiofs: Vec<VirtioFsDevice>,
    pub nics: Vec<NicInfo>,
}

/// Resolves `path` against `base` unless it is already absolute.
pub(crate) fn resolve(base: &Utf8Path, path: &str) -> Utf8PathBuf {
    let path = Utf8Path::new(path);
    if path.is_absolute() {
        path.to_owned()
    } else {
        base.join(path)
    }
}

/// Builds the QEMU argument list for VM `name` from its parameters.
pub(crate) fn qemu_args(
    name: &str,
    params: &Params,
    data_dir: &Utf8Path,
    layout: &VmLayout,
) -> Result<Vec<String>, ScriptError> {
    let mut args: Vec<String> = Vec::new();
    let mut push = |a: &str, b: String| {
        args.push(a.to_owned());
        args.push(b);
    };

    let mem = params.numeric_or::<u64>("mem", 4096)?;
    let smp = params.numeric_or::<u32>("smp", 2)?;
    let uefi = layout.ovmf_vars.is_some();
    let mut machine = format!(
        "{},accel=kvm",
        params.get_or("machine_type", "q35")
    );
    if uefi {
        machine.push_str(",smm=on");
    }

    push("-name", name.to_owned());
    push("-machine", machine);
    push("-cpu", params.get_or("cpu_model", "host"));
    push("-m", format!("{mem}M"));
    push("-smp", smp.to_string());
    push("-nodefaults", String::new());
    push("-vga", params.get_or("vga", "std"));

    if let Some(vars) = &layout.ovmf_vars {
        let ovmf_dir = params.get_or("ovmf_path", "/usr/share/OVMF");
        let code = resolve(
            Utf8Path::new(&ovmf_dir),
            &params.get_or("ovmf_code_filename", "OVMF_CODE.secboot.fd"),
        );
        push("-global", "driver=cfi.pflash01,property=secure,value=on".into());
        push(
            "-drive",
            format!("if=pflash,format=raw,unit=0,readonly=on,file={code}"),
        );
        push("-drive", format!("if=pflash,format=raw,unit=1,file={vars}"));
    }

    // virtio-fs needs guest memory the daemons can map.
    if !layout.virtiofs.is_empty() || params.get_bool("setup_hugepages") {
        let mem_path = if params.get_bool("setup_hugepages") {
            "/dev/hugepages"
        } else {
            "/dev/shm"
        };
        push(
            "-object",
            format!(
                "memory-backend-file,id=mem,size={mem}M,mem-path={mem_path},\
                 share=on"
            ),
        );
        push("-numa", "node,memdev=mem".into());
    }

    let image = params.require("image_name")?;
    let format = params.get_or("image_format", "qcow2");
    let image_path = resolve(data_dir, &format!("{image}.{format}"));
    let snapshot =
        if params.get_bool("image_snapshot") { ",snapshot=on" } else { "" };
    push(
        "-drive",
        format!(
            "file={image_path},if=none,id=drive_image1,format={format}\
             {snapshot}"
        ),
    );
    push("-device", "virtio-blk-pci,drive=drive_image1,bootindex=0".into());

    for cdrom in params.objects("cdroms") {
        let cd_params = params.object_params(&cdrom);
        let Some(iso) = cd_params.get("cdrom") else {
            continue;
        };
        let iso = resolve(data_dir, &iso);
        push(
            "-drive",
            format!(
                "file={iso},if=none,id=drive_{cdrom},media=cdrom,\
                 readonly=on,format=raw"
            ),
        );
        push("-device", format!("ide-cd,id=cd_{cdrom},drive=drive_{cdrom}"));
    }

    for (i, nic) in layout.nics.iter().enumerate() {
        let mut netdev = format!("user,id=net_{}", nic.name);
        if i == 0 {
            netdev.push_str(&format!(
                ",hostfwd=tcp:127.0.0.1:{}-:{},hostfwd=tcp:127.0.0.1:{}-:{}",
                layout.shell_port,
                layout.guest_shell_port,
                layout.transfer_port,
                layout.guest_transfer_port,
            ));
        }
        push("-netdev", netdev);
        push(
            "-device",
            format!(
                "{},id={},netdev=net_{},mac={}",
                nic.model, nic.name, nic.name, nic.mac
            ),
        );
    }

    for fs in &layout.virtiofs {
        push(
            "-chardev",
            format!("socket,id=char_{},path={}", fs.name, fs.socket),
        );
        push(
            "-device",
            format!(
                "vhost-user-fs-pci,id={},queue-size=1024,chardev=char_{},\
                 tag={}",
                fs.name, fs.name, fs.target
            ),
        );
    }

    push(
        "-serial",
        format!("tcp:127.0.0.1:{},server=on,wait=on", layout.serial_port),
    );
    push("-qmp", format!("unix:{},server=on,wait=off", layout.qmp_socket));
    push("-display", "none".into());

    if let Some(extra) = params.get("qemu_extra_params") {
        args.extend(extra.split_whitespace().map(str::to_owned));
    }

    // Flags pushed with an empty value take no argument.
    args.retain(|a| !a.is_empty());
    Ok(args)
}

/// A launched QEMU process. The process is killed when this is dropped.
pub(crate) struct QemuProcess {
    child: std::process::Child,
    name: String,
}

impl QemuProcess {
    pub(crate) fn new<T: Into<Stdio> + Debug>(
        qemu_path: &str,
        name: &str,
        args: &[String],
        stdout: T,
        stderr: T,
    ) -> Result<Self> {
        info!(qemu_path, name, ?args, "Launching QEMU");
        let child = std::process::Command::new(qemu_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .with_context(|| format!("launching {qemu_path}"))?;

        info!(name, "Launched QEMU with pid {}", child.id());
        Ok(Self { child, name: name.to_owned() })
    }

    /// Returns true if the process has exited.
    pub(crate) fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }
}

impl Drop for QemuProcess {
    fn drop(&mut self) {
        let pid = self.child.id();
        if self.has_exited() {
            return;
        }

        info!(pid, name = %self.name, "Killing QEMU process that was dropped");
        if let Err(e) = self.child.kill() {
            warn!(pid, %e, "failed to kill QEMU");
            return;
        }
        match self.child.wait() {
            Ok(status) => info!(pid, %status, "QEMU exited"),
            Err(e) => warn!(pid, %e, "failed to wait for QEMU"),
        }
    }
}
