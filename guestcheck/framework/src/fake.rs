// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory stand-ins for guests and the host, for exercising test flows
//! without QEMU.
//!
//! A [`ScriptedVm`] answers guest commands from a [`Script`] and records
//! everything that happens to it as [`GuestEvent`]s. Its sessions honor
//! boot epochs like real ones, so a flow that keeps using a session across a
//! reboot fails the same way it would against a real guest.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};

use crate::{
    error::{GuestCommandFailed, ScriptError},
    guest_os::GuestOsKind,
    host::{HostOutput, HostShell},
    params::Params,
    session::{BootEpoch, GuestSession, LoginTransport},
    vm::{NicInfo, RebootMethod, VirtioFsDevice, VmFactory, VmHandle},
};

/// A canned answer to a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub status: i32,
    pub output: String,

    /// The command never finishes; the caller sees a timeout.
    pub hang: bool,
}

impl Reply {
    pub fn ok(output: impl Into<String>) -> Self {
        Self { status: 0, output: output.into(), hang: false }
    }

    pub fn status(status: i32, output: impl Into<String>) -> Self {
        Self { status, output: output.into(), hang: false }
    }

    pub fn hang() -> Self {
        Self { status: 0, output: String::new(), hang: true }
    }
}

#[derive(Debug)]
struct Rule {
    needle: String,
    replies: VecDeque<Reply>,
}

/// Replies to commands by substring match.
///
/// The rule with the longest needle contained in the command wins. A rule
/// given several replies hands them out in order and then keeps repeating
/// the last one. Unmatched commands succeed with no output.
#[derive(Debug, Default)]
pub struct Script {
    rules: Vec<Rule>,
}

impl Script {
    pub fn on(&mut self, needle: impl Into<String>, reply: Reply) -> &mut Self {
        let needle = needle.into();
        match self.rules.iter_mut().find(|r| r.needle == needle) {
            Some(rule) => rule.replies.push_back(reply),
            None => self
                .rules
                .push(Rule { needle, replies: VecDeque::from([reply]) }),
        }
        self
    }

    fn answer(&mut self, command: &str) -> Reply {
        let rule = self
            .rules
            .iter_mut()
            .filter(|r| command.contains(r.needle.as_str()))
            .max_by_key(|r| r.needle.len());
        match rule {
            Some(rule) if rule.replies.len() > 1 => {
                rule.replies.pop_front().unwrap_or_else(|| Reply::ok(""))
            }
            Some(rule) => {
                rule.replies.front().cloned().unwrap_or_else(|| Reply::ok(""))
            }
            None => Reply::ok(""),
        }
    }
}

/// Something a test did to a [`ScriptedVm`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuestEvent {
    Command { session: String, boot: u64, command: String },
    Line { session: String, text: String },
    Login { session: String, transport: LoginTransport },
    Reboot { method: RebootMethod },
    CopyTo { host: Utf8PathBuf, guest: String },
    CopyFrom { guest: String, host: Utf8PathBuf },
    ChangeMedia { drive: String, image: Utf8PathBuf },
    SendKey(String),
    Destroy,
}

#[derive(Debug, Default)]
struct Shared {
    script: Mutex<Script>,
    events: Mutex<Vec<GuestEvent>>,
}

impl Shared {
    fn record(&self, event: GuestEvent) {
        self.events.lock().unwrap().push(event);
    }
}

struct ScriptedSession {
    name: String,
    os: GuestOsKind,
    transport: LoginTransport,
    shared: Arc<Shared>,
    epoch: BootEpoch,
    opened_at: u64,
    closed: AtomicBool,
}

#[async_trait]
impl GuestSession for ScriptedSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn os(&self) -> GuestOsKind {
        self.os
    }

    fn transport(&self) -> LoginTransport {
        self.transport
    }

    async fn cmd_status_output(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<(i32, String)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow!("session {} is closed", self.name));
        }
        self.epoch.check(&self.name, self.opened_at)?;
        self.shared.record(GuestEvent::Command {
            session: self.name.clone(),
            boot: self.opened_at,
            command: cmd.to_owned(),
        });

        let reply = self.shared.script.lock().unwrap().answer(cmd);
        if reply.hang {
            return Err(GuestCommandFailed {
                command: cmd.to_owned(),
                timeout,
                status: None,
                output: "timed out".to_owned(),
            }
            .into());
        }
        Ok((reply.status, reply.output))
    }

    async fn sendline(&self, text: &str) -> Result<()> {
        self.epoch.check(&self.name, self.opened_at)?;
        self.shared.record(GuestEvent::Line {
            session: self.name.clone(),
            text: text.to_owned(),
        });
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Scripts are matched and recorded in clear text rather than encoded.
    async fn powershell(
        &self,
        script: &str,
        timeout: Duration,
    ) -> Result<(i32, String)> {
        self.cmd_status_output(script, timeout).await
    }
}

/// A guest whose behavior is a [`Script`].
pub struct ScriptedVm {
    name: String,
    os: GuestOsKind,
    epoch: BootEpoch,
    shared: Arc<Shared>,
    devices: Vec<VirtioFsDevice>,
    nics: Vec<NicInfo>,
    alive: AtomicBool,
    sessions: AtomicU64,
}

impl ScriptedVm {
    pub fn new(name: impl Into<String>, os: GuestOsKind) -> Self {
        Self {
            name: name.into(),
            os,
            epoch: BootEpoch::new(),
            shared: Arc::default(),
            devices: Vec::new(),
            nics: Vec::new(),
            alive: AtomicBool::new(true),
            sessions: AtomicU64::new(0),
        }
    }

    pub fn with_virtiofs(mut self, device: VirtioFsDevice) -> Self {
        self.devices.push(device);
        self
    }

    pub fn with_nic(mut self, nic: NicInfo) -> Self {
        self.nics.push(nic);
        self
    }

    /// Adds a reply for commands containing `needle`.
    pub fn on(&self, needle: impl Into<String>, reply: Reply) -> &Self {
        self.shared.script.lock().unwrap().on(needle, reply);
        self
    }

    pub fn events(&self) -> Vec<GuestEvent> {
        self.shared.events.lock().unwrap().clone()
    }

    /// Every command run in any session, in order.
    pub fn commands(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                GuestEvent::Command { command, .. } => Some(command),
                _ => None,
            })
            .collect()
    }

    /// Returns how many commands contained `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(needle)).count()
    }

    pub fn issued(&self, needle: &str) -> bool {
        self.count(needle) > 0
    }

    pub fn reboots(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, GuestEvent::Reboot { .. }))
            .count()
    }

    fn open_session(
        &self,
        transport: LoginTransport,
    ) -> Result<Box<dyn GuestSession>> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(ScriptError::environment(format!(
                "VM {} is not running",
                self.name
            ))
            .into());
        }
        let n = self.sessions.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}-session{n}", self.name);
        self.shared
            .record(GuestEvent::Login { session: name.clone(), transport });
        Ok(Box::new(ScriptedSession {
            name,
            os: self.os,
            transport,
            shared: self.shared.clone(),
            epoch: self.epoch.clone(),
            opened_at: self.epoch.current(),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl VmHandle for ScriptedVm {
    fn name(&self) -> &str {
        &self.name
    }

    fn os(&self) -> GuestOsKind {
        self.os
    }

    fn epoch(&self) -> &BootEpoch {
        &self.epoch
    }

    fn virtiofs_devices(&self) -> &[VirtioFsDevice] {
        &self.devices
    }

    fn nics(&self) -> &[NicInfo] {
        &self.nics
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn wait_for_login(
        &self,
        _timeout: Duration,
    ) -> Result<Box<dyn GuestSession>> {
        self.open_session(LoginTransport::Network)
    }

    async fn wait_for_serial_login(
        &self,
        _timeout: Duration,
    ) -> Result<Box<dyn GuestSession>> {
        self.open_session(LoginTransport::Serial)
    }

    async fn reboot(
        &self,
        session: Box<dyn GuestSession>,
        method: RebootMethod,
        _timeout: Duration,
    ) -> Result<Box<dyn GuestSession>> {
        let transport = session.transport();
        session.close().await?;
        self.shared.record(GuestEvent::Reboot { method });
        self.epoch.advance();
        self.open_session(transport)
    }

    async fn copy_files_to(
        &self,
        host_path: &Utf8Path,
        guest_path: &str,
        _timeout: Duration,
    ) -> Result<()> {
        self.shared.record(GuestEvent::CopyTo {
            host: host_path.to_owned(),
            guest: guest_path.to_owned(),
        });
        Ok(())
    }

    async fn copy_files_from(
        &self,
        guest_path: &str,
        host_path: &Utf8Path,
        _timeout: Duration,
    ) -> Result<()> {
        self.shared.record(GuestEvent::CopyFrom {
            guest: guest_path.to_owned(),
            host: host_path.to_owned(),
        });
        Ok(())
    }

    async fn change_media(&self, drive: &str, image: &Utf8Path) -> Result<()> {
        self.shared.record(GuestEvent::ChangeMedia {
            drive: drive.to_owned(),
            image: image.to_owned(),
        });
        Ok(())
    }

    async fn send_key(&self, keys: &str) -> Result<()> {
        self.shared.record(GuestEvent::SendKey(keys.to_owned()));
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.shared.record(GuestEvent::Destroy);
        }
        Ok(())
    }
}

/// A host shell driven by a [`Script`]. Replies go to stdout.
#[derive(Debug, Default)]
pub struct FakeHost {
    script: Mutex<Script>,
    commands: Mutex<Vec<String>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, needle: impl Into<String>, reply: Reply) -> &Self {
        self.script.lock().unwrap().on(needle, reply);
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn issued(&self, needle: &str) -> bool {
        self.commands().iter().any(|c| c.contains(needle))
    }
}

#[async_trait]
impl HostShell for FakeHost {
    async fn run(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<HostOutput> {
        self.commands.lock().unwrap().push(command.to_owned());
        let reply = self.script.lock().unwrap().answer(command);
        if reply.hang {
            return Err(anyhow!(
                "host command `{command}` timed out after {timeout:?}"
            ));
        }
        Ok(HostOutput {
            status: reply.status,
            stdout: reply.output,
            stderr: String::new(),
        })
    }
}

/// Hands out prepared [`ScriptedVm`]s by name.
#[derive(Default)]
pub struct FakeFactory {
    vms: Mutex<BTreeMap<String, Arc<ScriptedVm>>>,
    created: Mutex<Vec<(String, Params)>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, vm: Arc<ScriptedVm>) {
        self.vms.lock().unwrap().insert(vm.name.clone(), vm);
    }

    /// The params each VM was created with, in creation order.
    pub fn created(&self) -> Vec<(String, Params)> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl VmFactory for FakeFactory {
    async fn create_vm(
        &self,
        name: &str,
        params: &Params,
    ) -> Result<Arc<dyn VmHandle>> {
        let vm = self.vms.lock().unwrap().get(name).cloned().ok_or_else(|| {
            ScriptError::environment(format!("no scripted VM named {name}"))
        })?;
        vm.alive.store(true, Ordering::SeqCst);
        self.created.lock().unwrap().push((name.to_owned(), params.clone()));
        Ok(vm)
    }
}
