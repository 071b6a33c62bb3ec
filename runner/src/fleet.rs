//! A fleet of VMs launched and torn down together.
//!
//! `Fleet::launch` acquires everything in a fixed order: network leases and taps for every VM,
//! then the VMs themselves, then waits for every guest to boot. The returned `Fleet` owns all of
//! it. Dropping it (or calling `teardown`) releases everything in the reverse order: all VMs
//! first, last one first, then the network. A failure anywhere during `launch` drops the
//! half-built fleet, so nothing acquired before the failure survives it.

use log::{info, warn};

use serde::{Deserialize, Serialize};

use crate::config::HostConfig;
use crate::cpu::{AffinityMode, CpuAffinityCycler};
use crate::error::TeardownError;
use crate::host::{Host, ProcessOutput};
use crate::net::NetworkProvisioner;
use crate::poll::CancelToken;
use crate::remote::{wait_for_boot, Guest, RemoteExec};
use crate::vm::{VmConfig, VmHandle, VmSpec};

/// The shape of a fleet: `num` identical VMs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetOptions {
    pub num: usize,
    pub ncpus: usize,
    pub memory: u64,
    pub dram_ratio: f64,
    pub memory_mode: bool,
    pub affinity_mode: AffinityMode,
}

impl FleetOptions {
    pub fn specs(&self) -> Vec<VmSpec> {
        (0..self.num)
            .map(|id| VmSpec {
                id,
                ncpus: self.ncpus,
                memory: self.memory,
                dram_ratio: self.dram_ratio,
                memory_mode: self.memory_mode,
                affinity_mode: self.affinity_mode,
            })
            .collect()
    }

    /// The same fleet with a different VM count and DRAM ratio, as run by a sweep.
    pub fn reshaped(&self, num: usize, dram_ratio: f64) -> Self {
        FleetOptions {
            num,
            dram_ratio,
            ..self.clone()
        }
    }
}

pub struct Fleet<'h> {
    net: NetworkProvisioner<'h>,
    /// Every VM whose networking we attempted to create, in creation order.
    leased: Vec<VmConfig>,
    /// Launched VMs, in launch order.
    vms: Vec<VmHandle>,
}

impl<'h> Fleet<'h> {
    /// Bring up one VM per spec and wait until all of them answer over SSH.
    ///
    /// CPU pinnings are drawn from `cycler` in VM-id order before anything is started.
    pub fn launch(
        host: &'h dyn Host,
        remote: &dyn RemoteExec,
        cfg: &HostConfig,
        specs: &[VmSpec],
        cycler: &CpuAffinityCycler,
        cancel: &CancelToken,
    ) -> Result<Self, failure::Error> {
        let configs = specs
            .iter()
            .map(|spec| VmConfig::derive(spec, cfg, cycler))
            .collect::<Result<Vec<_>, _>>()?;

        let mut fleet = Fleet {
            net: NetworkProvisioner::connect(host, cfg)?,
            leased: vec![],
            vms: vec![],
        };

        // Record each VM before its networking is created so that a half-done create is also
        // removed on the way out.
        let leased = &mut fleet.leased;
        fleet
            .net
            .create_all(&configs, |vm| leased.push(vm.clone()))?;
        info!("network ready for {} vms", configs.len());

        for config in configs {
            let vm = VmHandle::launch(host, config, cfg.settle)?;
            fleet.vms.push(vm);
        }
        info!("{} vms launched", fleet.vms.len());

        for guest in fleet.guests() {
            wait_for_boot(remote, &guest, &cfg.boot_poll, cancel)?;
        }
        info!("all vms booted");

        Ok(fleet)
    }

    pub fn vms(&self) -> &[VmHandle] {
        &self.vms
    }

    pub fn len(&self) -> usize {
        self.vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }

    /// The guests, in VM-id order.
    pub fn guests(&self) -> Vec<Guest> {
        self.vms.iter().map(|vm| vm.config().guest()).collect()
    }

    /// Block until every hypervisor exits by itself, e.g. after `pkill cloud-hypervisor`.
    pub fn wait_all(&mut self) -> Result<Vec<ProcessOutput>, failure::Error> {
        info!("waiting for manual termination of {} vms", self.vms.len());
        self.vms.iter_mut().map(VmHandle::wait).collect()
    }

    /// Kill every VM (last launched first), then remove all networking. Every step is attempted;
    /// failures are logged and returned. Tearing down an already torn-down fleet does nothing.
    pub fn teardown(&mut self) -> Vec<TeardownError> {
        let mut errors = vec![];

        while let Some(mut vm) = self.vms.pop() {
            errors.extend(vm.kill());
        }

        if !self.leased.is_empty() {
            errors.extend(self.net.remove_all(&self.leased));
            self.leased.clear();
        }

        for e in &errors {
            warn!("{}", e);
        }

        errors
    }
}

impl Drop for Fleet<'_> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn vm_cpu_cycler(cfg: &HostConfig) -> Result<CpuAffinityCycler, failure::Error> {
    match &cfg.vm_cpus {
        Some(cpus) if cpus.is_empty() => failure::bail!("`vm_cpus` is empty"),
        Some(cpus) => Ok(CpuAffinityCycler::new(cfg.vm_cpu_node, cpus.clone())),
        None => CpuAffinityCycler::for_node(cfg.vm_cpu_node),
    }
}

/// Launch a fleet, hand it to `f`, and tear it down afterwards whether or not `f` succeeded.
pub fn with_fleet<T, F>(
    host: &dyn Host,
    remote: &dyn RemoteExec,
    cfg: &HostConfig,
    opts: &FleetOptions,
    cancel: &CancelToken,
    f: F,
) -> Result<T, failure::Error>
where
    F: FnOnce(&mut Fleet<'_>) -> Result<T, failure::Error>,
{
    let cycler = vm_cpu_cycler(cfg)?;
    let mut fleet = Fleet::launch(host, remote, cfg, &opts.specs(), &cycler, cancel)?;

    let result = f(&mut fleet);

    let errors = fleet.teardown();
    if !errors.is_empty() {
        warn!("fleet teardown finished with {} errors", errors.len());
    }

    result
}
