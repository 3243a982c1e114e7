// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The live-environment registry: the VMs that exist while a test runs.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use tracing::{info, warn};

use crate::{
    error::ScriptError,
    params::Params,
    vm::{VmFactory, VmHandle},
};

/// Returns the names of the VMs a test's params describe: the `vms` list,
/// or `main_vm` (default `vm1`) when there is none.
pub fn vm_names(params: &Params) -> Vec<String> {
    let vms = params.objects("vms");
    if vms.is_empty() {
        vec![main_vm_name(params)]
    } else {
        vms
    }
}

pub fn main_vm_name(params: &Params) -> String {
    params.get_or("main_vm", "vm1")
}

pub struct Env {
    factory: Arc<dyn VmFactory>,
    vms: Mutex<BTreeMap<String, Arc<dyn VmHandle>>>,
}

impl Env {
    pub fn new(factory: Arc<dyn VmFactory>) -> Self {
        Self { factory, vms: Mutex::new(BTreeMap::new()) }
    }

    /// Boots every VM the params ask for. A VM whose `start_vm` parameter is
    /// `no` is left for the test to start itself through
    /// [`Env::preprocess_vm`].
    pub async fn preprocess(&self, params: &Params) -> Result<()> {
        for name in vm_names(params) {
            let vm_params = params.object_params(&name);
            if vm_params.get_or("start_vm", "yes") == "no" {
                info!(vm = %name, "start_vm is off, not booting");
                continue;
            }
            self.preprocess_vm(params, &name).await?;
        }
        Ok(())
    }

    /// Boots VM `name` from `params`, replacing any VM of that name.
    pub async fn preprocess_vm(
        &self,
        params: &Params,
        name: &str,
    ) -> Result<Arc<dyn VmHandle>> {
        let old = self.vms.lock().unwrap().remove(name);
        if let Some(old) = old {
            info!(vm = name, "replacing existing VM");
            old.destroy().await?;
        }

        let vm =
            self.factory.create_vm(name, &params.object_params(name)).await?;
        self.register(name, vm.clone());
        Ok(vm)
    }

    pub fn register(&self, name: &str, vm: Arc<dyn VmHandle>) {
        self.vms.lock().unwrap().insert(name.to_owned(), vm);
    }

    pub fn get_vm(&self, name: &str) -> Result<Arc<dyn VmHandle>, ScriptError> {
        self.vms.lock().unwrap().get(name).cloned().ok_or_else(|| {
            ScriptError::environment(format!("no VM named {name} is running"))
        })
    }

    /// Destroys every registered VM, continuing past failures. Returns the
    /// first failure.
    pub async fn destroy_all(&self) -> Result<()> {
        let vms: Vec<_> = std::mem::take(&mut *self.vms.lock().unwrap())
            .into_iter()
            .collect();
        let mut first_err = None;
        for (name, vm) in vms {
            if let Err(e) = vm.destroy().await {
                warn!(vm = %name, %e, "failed to destroy VM");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
