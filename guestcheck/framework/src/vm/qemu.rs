// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VMs run by a local QEMU process.
//!
//! Each VM gets a private run directory under the framework's temporary
//! directory holding its QMP socket, its serial console log, its copy of the
//! UEFI variable store and the sockets and logs of its `virtiofsd` daemons.
//! The guest's first serial port is exported over TCP and connected as soon
//! as QEMU starts, so the console log covers the whole boot.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::json;
use tokio::{net::UnixStream, process::Command};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    error::{HostCommandFailed, ScriptError},
    guest_os::{get_guest_os_adapter, Credentials, GuestOsKind},
    log_config::OutputMode,
    params::Params,
    port_allocator::PortAllocator,
    serial::Console,
    session::{
        run_login_sequence, BootEpoch, ConsoleSession, GuestSession,
        LoginTransport,
    },
    wait::wait_for,
};

use super::{
    launch::{qemu_args, resolve, QemuProcess, VmLayout},
    qmp::{send_key_arguments, QmpClient},
    virtiofsd::{device_for, VirtiofsDaemon},
    NicInfo, RebootMethod, VirtioFsDevice, VmFactory, VmHandle, VmStateError,
};

/// How long to wait for a freshly launched QEMU to accept connections.
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

/// The longest a single network login attempt may take before it is retried.
const LOGIN_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);

/// How long `destroy` waits for QEMU to honor `quit` before killing it.
const QUIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a [`QemuFactory`] puts things and which host ports it may use.
#[derive(Clone, Debug)]
pub struct QemuFactoryConfig {
    /// Parent of the per-VM run directories.
    pub tmp_directory: Utf8PathBuf,

    /// Relative image, ISO and share paths are resolved against this.
    pub data_directory: Utf8PathBuf,

    /// Where QEMU's own stdout/stderr go.
    pub output_mode: OutputMode,

    /// Host ports handed out for serial consoles and forwarded services.
    pub port_range: std::ops::Range<u16>,
}

/// Launches QEMU VMs.
pub struct QemuFactory {
    config: QemuFactoryConfig,
    ports: PortAllocator,
}

impl QemuFactory {
    pub fn new(config: QemuFactoryConfig) -> Self {
        let ports = PortAllocator::new(config.port_range.clone());
        Self { config, ports }
    }
}

/// Generates a locally administered MAC in QEMU's `52:54:00` range.
fn random_mac() -> String {
    let bytes = uuid::Uuid::new_v4();
    let b = bytes.as_bytes();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", b[0], b[1], b[2])
}

fn nics_for(params: &Params) -> Vec<NicInfo> {
    let mut names = params.objects("nics");
    if names.is_empty() {
        names.push("nic1".to_owned());
    }
    names
        .into_iter()
        .map(|name| {
            let nic_params = params.object_params(&name);
            NicInfo {
                model: nic_params.get_or("nic_model", "virtio-net-pci"),
                mac: nic_params.get("mac").unwrap_or_else(random_mac),
                name,
            }
        })
        .collect()
}

/// Copies the UEFI variable template named by `ovmf_vars_filename` into the
/// VM's run directory, so that variables a guest writes don't leak into
/// other VMs. Returns `None` for BIOS guests.
fn private_ovmf_vars(
    name: &str,
    params: &Params,
    run_dir: &Utf8Path,
) -> Result<Option<Utf8PathBuf>> {
    let Some(vars) = params.get("ovmf_vars_filename") else {
        return Ok(None);
    };
    let ovmf_dir = params.get_or("ovmf_path", "/usr/share/OVMF");
    let template = resolve(Utf8Path::new(&ovmf_dir), &vars);
    let copy = run_dir.join(format!("{name}_VARS.fd"));
    std::fs::copy(&template, &copy)
        .with_context(|| format!("copying {template} to {copy}"))?;
    Ok(Some(copy))
}

#[async_trait]
impl VmFactory for QemuFactory {
    async fn create_vm(
        &self,
        name: &str,
        params: &Params,
    ) -> Result<Arc<dyn VmHandle>> {
        let span = info_span!("vm", name);
        let vm = QemuVm::launch(&self.config, &self.ports, name, params)
            .instrument(span.clone())
            .await?;
        Ok(Arc::new(vm))
    }

    /// Makes every host port available again.
    fn reset(&self) {
        self.ports.reset();
    }
}

/// A VM backed by a QEMU process on this host.
pub struct QemuVm {
    name: String,
    kind: GuestOsKind,
    params: Params,
    span: tracing::Span,
    epoch: BootEpoch,
    layout: VmLayout,
    run_dir: Utf8PathBuf,

    serial: Arc<Console>,

    /// The boot in which the serial console was last logged in. A serial
    /// login within the same boot reuses the existing shell.
    serial_login: Mutex<Option<u64>>,

    qmp: tokio::sync::Mutex<Option<QmpClient<UnixStream>>>,
    process: Mutex<Option<QemuProcess>>,
    daemons: Mutex<Vec<VirtiofsDaemon>>,
    destroyed: AtomicBool,
}

impl QemuVm {
    async fn launch(
        config: &QemuFactoryConfig,
        ports: &PortAllocator,
        name: &str,
        params: &Params,
    ) -> Result<Self> {
        let kind = GuestOsKind::from_params(params)?;
        let run_dir = config.tmp_directory.join(name);
        std::fs::create_dir_all(&run_dir)
            .with_context(|| format!("creating run directory {run_dir}"))?;

        let mut daemons = Vec::new();
        let mut virtiofs = Vec::new();
        let fs_binary =
            params.get_or("virtiofsd_path", "/usr/libexec/virtiofsd");
        for fs in params.objects("filesystems") {
            let fs_params = params.object_params(&fs);
            if fs_params.get_or("fs_driver", "virtio-fs") != "virtio-fs" {
                debug!(fs, "skipping non-virtio-fs filesystem");
                continue;
            }
            let device = device_for(
                name,
                &fs,
                &fs_params,
                &config.data_directory,
                &run_dir,
            )?;
            let daemon =
                VirtiofsDaemon::start(&fs_binary, device, &fs_params).await?;
            virtiofs.push(daemon.device().clone());
            daemons.push(daemon);
        }

        let default_guest_shell = if kind.is_windows() { 10022 } else { 22 };
        let layout = VmLayout {
            serial_port: ports.next()?,
            shell_port: ports.next()?,
            guest_shell_port: params
                .numeric_or("guest_shell_port", default_guest_shell)?,
            transfer_port: ports.next()?,
            guest_transfer_port: params.numeric_or("file_transfer_port", 22)?,
            qmp_socket: run_dir.join(format!("{name}.qmp")),
            ovmf_vars: private_ovmf_vars(name, params, &run_dir)?,
            virtiofs,
            nics: nics_for(params),
        };

        let args = qemu_args(name, params, &config.data_directory, &layout)?;
        let (stdout, stderr) =
            config.output_mode.get_handles(&run_dir, &format!("{name}.qemu"))?;
        let qemu_binary = params.get_or("qemu_binary", "qemu-system-x86_64");
        let mut process =
            QemuProcess::new(&qemu_binary, name, &args, stdout, stderr)?;

        let serial_addr =
            SocketAddr::from((Ipv4Addr::LOCALHOST, layout.serial_port));
        let serial_log = run_dir.join(format!("{name}.serial.log"));
        let serial = wait_for(LAUNCH_TIMEOUT, Duration::from_millis(100), || {
            let exited = process.has_exited();
            let serial_log = serial_log.clone();
            async move {
                if exited {
                    return Err(anyhow!("QEMU exited during startup"));
                }
                let log = Some(serial_log.as_path());
                match Console::connect_tcp(serial_addr, log).await {
                    Ok(console) => Ok(Some(console)),
                    Err(e) => {
                        debug!(%e, "serial console not ready yet");
                        Ok(None)
                    }
                }
            }
        })
        .await?
        .ok_or_else(|| {
            ScriptError::environment(format!(
                "could not connect to the serial console of {name}"
            ))
        })?;

        let qmp_socket = layout.qmp_socket.clone();
        let qmp = wait_for(LAUNCH_TIMEOUT, Duration::from_millis(100), || {
            let exited = process.has_exited();
            let qmp_socket = qmp_socket.clone();
            async move {
                if exited {
                    return Err(anyhow!("QEMU exited during startup"));
                }
                match QmpClient::connect(&qmp_socket).await {
                    Ok(client) => Ok(Some(client)),
                    Err(e) => {
                        debug!(%e, "QMP socket not ready yet");
                        Ok(None)
                    }
                }
            }
        })
        .await?
        .ok_or_else(|| {
            ScriptError::environment(format!(
                "could not connect to the QMP socket of {name}"
            ))
        })?;

        info!(?layout, "VM launched");
        Ok(Self {
            name: name.to_owned(),
            kind,
            params: params.clone(),
            span: tracing::Span::current(),
            epoch: BootEpoch::new(),
            layout,
            run_dir,
            serial: Arc::new(serial),
            serial_login: Mutex::new(None),
            qmp: tokio::sync::Mutex::new(Some(qmp)),
            process: Mutex::new(Some(process)),
            daemons: Mutex::new(daemons),
            destroyed: AtomicBool::new(false),
        })
    }

    fn ensure_live(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(VmStateError::Destroyed(self.name.clone()).into())
        } else {
            Ok(())
        }
    }

    fn credentials(&self) -> Credentials {
        Credentials::from_params(&self.params, self.kind)
    }

    async fn qmp_execute(
        &self,
        command: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        self.ensure_live()?;
        let mut guard = self.qmp.lock().await;
        let qmp = guard
            .as_mut()
            .ok_or_else(|| VmStateError::Destroyed(self.name.clone()))?;
        Ok(qmp.execute(command, arguments).await?)
    }

    /// Opens a fresh console to the guest's remote shell and logs in.
    async fn network_console(&self, timeout: Duration) -> Result<Console> {
        let creds = self.credentials();
        let log = self.run_dir.join(format!("{}.net.log", self.name));
        let console = match self.kind {
            GuestOsKind::Linux => {
                let args: Vec<String> = vec![
                    "-p".into(),
                    creds.password.clone(),
                    "ssh".into(),
                    "-tt".into(),
                    "-o".into(),
                    "StrictHostKeyChecking=no".into(),
                    "-o".into(),
                    "UserKnownHostsFile=/dev/null".into(),
                    "-p".into(),
                    self.layout.shell_port.to_string(),
                    format!("{}@127.0.0.1", creds.username),
                ];
                Console::spawn_process("sshpass", &args, Some(log.as_path()))?
            }
            GuestOsKind::Windows => {
                let addr = SocketAddr::from((
                    Ipv4Addr::LOCALHOST,
                    self.layout.shell_port,
                ));
                Console::connect_tcp(addr, Some(log.as_path())).await?
            }
        };

        let sequence = get_guest_os_adapter(self.kind).network_login_sequence();
        run_login_sequence(&console, self.kind, sequence, timeout).await?;
        Ok(console)
    }

    /// Copies with `scp` through the forwarded file transfer port.
    async fn scp(&self, from: &str, to: &str, timeout: Duration) -> Result<()> {
        self.ensure_live()?;
        let creds = self.credentials();
        let port = self.layout.transfer_port.to_string();
        let args = [
            "-p",
            creds.password.as_str(),
            "scp",
            "-r",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-P",
            port.as_str(),
            from,
            to,
        ];
        info!(from, to, "copying files");
        let output = tokio::time::timeout(
            timeout,
            Command::new("sshpass").args(args).kill_on_drop(true).output(),
        )
        .await
        .with_context(|| format!("copying {from} to {to} timed out"))?
        .context("launching scp")?;

        if !output.status.success() {
            return Err(HostCommandFailed {
                command: format!("scp {from} {to}"),
                status: output.status.code().unwrap_or(128),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
            .into());
        }
        Ok(())
    }

    fn guest_location(&self, guest_path: &str) -> String {
        format!("{}@127.0.0.1:{guest_path}", self.credentials().username)
    }
}

#[async_trait]
impl VmHandle for QemuVm {
    fn name(&self) -> &str {
        &self.name
    }

    fn os(&self) -> GuestOsKind {
        self.kind
    }

    fn epoch(&self) -> &BootEpoch {
        &self.epoch
    }

    fn virtiofs_devices(&self) -> &[VirtioFsDevice] {
        &self.layout.virtiofs
    }

    fn nics(&self) -> &[NicInfo] {
        &self.layout.nics
    }

    async fn is_alive(&self) -> bool {
        let running = {
            let mut guard = self.process.lock().unwrap();
            guard.as_mut().map(|p| !p.has_exited()).unwrap_or(false)
        };
        running && self.qmp_execute("query-status", None).await.is_ok()
    }

    async fn wait_for_login(
        &self,
        timeout: Duration,
    ) -> Result<Box<dyn GuestSession>> {
        self.ensure_live()?;
        let attempt = timeout.min(LOGIN_ATTEMPT_TIMEOUT);
        info!(?timeout, "waiting for network login");
        let console = wait_for(timeout, Duration::from_secs(5), || async {
            match self.network_console(attempt).await {
                Ok(console) => Ok(Some(console)),
                Err(e) => {
                    debug!(%e, "network login attempt failed");
                    Ok(None)
                }
            }
        })
        .instrument(self.span.clone())
        .await?
        .ok_or_else(|| {
            ScriptError::environment(format!(
                "could not log into {} over the network within {timeout:?}",
                self.name
            ))
        })?;

        Ok(Box::new(ConsoleSession::new(
            format!("{}-net", self.name),
            self.kind,
            LoginTransport::Network,
            Arc::new(console),
            self.epoch.clone(),
        )))
    }

    async fn wait_for_serial_login(
        &self,
        timeout: Duration,
    ) -> Result<Box<dyn GuestSession>> {
        self.ensure_live()?;
        let guest_os = get_guest_os_adapter(self.kind);
        let current = self.epoch.current();
        let logged_in = *self.serial_login.lock().unwrap() == Some(current);

        if logged_in {
            // The shell from an earlier login in this boot is still there;
            // resynchronize with its prompt.
            self.serial.send_str(guest_os.line_ending()).await?;
            self.serial
                .wait_for(guest_os.shell_prompt(), timeout)
                .await
                .context("serial shell stopped responding")?;
            self.serial.clear();
        } else {
            info!(?timeout, "waiting for serial login");
            let sequence = guest_os.serial_login_sequence(&self.credentials());
            run_login_sequence(&self.serial, self.kind, sequence, timeout)
                .instrument(self.span.clone())
                .await?;
            *self.serial_login.lock().unwrap() = Some(current);
        }

        Ok(Box::new(ConsoleSession::new(
            format!("{}-serial", self.name),
            self.kind,
            LoginTransport::Serial,
            self.serial.clone(),
            self.epoch.clone(),
        )))
    }

    async fn reboot(
        &self,
        session: Box<dyn GuestSession>,
        method: RebootMethod,
        timeout: Duration,
    ) -> Result<Box<dyn GuestSession>> {
        self.ensure_live()?;
        let transport = session.transport();
        info!(?method, ?transport, "rebooting guest");

        // Output from before the reboot must not satisfy the next login.
        self.serial.clear();
        match method {
            RebootMethod::Shell => {
                let guest_os = get_guest_os_adapter(self.kind);
                session.sendline(guest_os.reboot_command()).await?;
                if transport == LoginTransport::Network {
                    let down = wait_for(timeout, Duration::from_secs(1), || {
                        let session = &session;
                        async move {
                            Ok((!session.is_connected().await).then_some(()))
                        }
                    })
                    .await?;
                    if down.is_none() {
                        return Err(ScriptError::environment(format!(
                            "{} did not shut down within {timeout:?}",
                            self.name
                        ))
                        .into());
                    }
                }
            }
            RebootMethod::SystemReset => {
                self.qmp_execute("system_reset", None).await?;
            }
        }

        session.close().await?;
        let epoch = self.epoch.advance();
        *self.serial_login.lock().unwrap() = None;
        info!(epoch, "guest is rebooting");

        match transport {
            LoginTransport::Serial => self.wait_for_serial_login(timeout).await,
            LoginTransport::Network => self.wait_for_login(timeout).await,
        }
    }

    async fn copy_files_to(
        &self,
        host_path: &Utf8Path,
        guest_path: &str,
        timeout: Duration,
    ) -> Result<()> {
        self.scp(host_path.as_str(), &self.guest_location(guest_path), timeout)
            .await
    }

    async fn copy_files_from(
        &self,
        guest_path: &str,
        host_path: &Utf8Path,
        timeout: Duration,
    ) -> Result<()> {
        self.scp(&self.guest_location(guest_path), host_path.as_str(), timeout)
            .await
    }

    async fn change_media(&self, drive: &str, image: &Utf8Path) -> Result<()> {
        let id = drive
            .strip_prefix("drive_")
            .map(|cd| format!("cd_{cd}"))
            .ok_or_else(|| VmStateError::NoSuchDevice {
                name: self.name.clone(),
                device: drive.to_owned(),
            })?;
        info!(drive, %image, "changing removable media");
        self.qmp_execute(
            "blockdev-change-medium",
            Some(json!({ "id": id, "filename": image.as_str() })),
        )
        .await?;
        Ok(())
    }

    async fn send_key(&self, keys: &str) -> Result<()> {
        self.qmp_execute("send-key", Some(send_key_arguments(keys))).await?;
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shut_down().instrument(self.span.clone()).await
    }
}

impl QemuVm {
    async fn shut_down(&self) -> Result<()> {
        info!("destroying VM");

        if let Some(mut qmp) = self.qmp.lock().await.take() {
            if let Err(e) = qmp.execute("quit", None).await {
                debug!(%e, "QMP quit failed");
            }
        }

        let exited = wait_for(QUIT_TIMEOUT, Duration::from_millis(200), || {
            let exited = self
                .process
                .lock()
                .unwrap()
                .as_mut()
                .map(|p| p.has_exited())
                .unwrap_or(true);
            async move { Ok(exited.then_some(())) }
        })
        .await?;
        if exited.is_none() {
            warn!("QEMU did not quit in time, killing it");
        }

        // Dropping these kills whatever is still running.
        self.process.lock().unwrap().take();
        self.daemons.lock().unwrap().clear();
        Ok(())
    }
}
