//! A single VM: the file-share daemons and the hypervisor that make it up, plus everything
//! derived from its identity (addresses, pinning, memory split, argument lists).

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};

use serde::{Deserialize, Serialize};

use crate::config::{HostConfig, IP_OFFSET, MAC_OFFSET, MAX_VMS};
use crate::cpu::{AffinityAssignment, AffinityMode, CpuAffinityCycler};
use crate::error::{SetupError, TeardownError};
use crate::host::{Host, HostCommand, Process, ProcessOutput};
use crate::remote::Guest;

/// Sockets created in the VM's working directory.
pub const FS_SOCKET: &str = "virtiofsd.socket";
pub const FS_OUTPUT_SOCKET: &str = "virtiofsd-output.socket";
pub const API_SOCKET: &str = "cloud-hypervisor.socket";

/// Names of the member processes of a VM.
pub const FS_DAEMON: &str = "virtiofsd";
pub const FS_OUTPUT_DAEMON: &str = "virtiofsd-output";
pub const HYPERVISOR: &str = "cloud-hypervisor";

/// What the user asked for, per VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSpec {
    pub id: usize,
    pub ncpus: usize,
    /// Total guest memory in bytes.
    pub memory: u64,
    /// Fraction of `memory` initially on the fast node.
    pub dram_ratio: f64,
    /// Back the slow zone by the fast node too (tiering baseline).
    pub memory_mode: bool,
    pub affinity_mode: AffinityMode,
}

impl VmSpec {
    pub fn validate(&self) -> Result<(), failure::Error> {
        if self.id >= MAX_VMS {
            failure::bail!(
                "vm{}: at most {} VMs fit in the subnet (ids 0..={})",
                self.id,
                MAX_VMS,
                MAX_VMS - 1
            );
        }
        if self.ncpus < 1 {
            failure::bail!("vm{} needs at least one vCPU", self.id);
        }
        if !(0.0..=1.0).contains(&self.dram_ratio) {
            failure::bail!(
                "vm{}: DRAM ratio {} is not within [0, 1]",
                self.id,
                self.dram_ratio
            );
        }
        Ok(())
    }
}

/// `base.(166 + id)`.
pub fn vm_ip(subnet_base: Ipv4Addr, id: usize) -> Ipv4Addr {
    let [a, b, c, _] = subnet_base.octets();
    Ipv4Addr::new(a, b, c, (IP_OFFSET + id) as u8)
}

/// `prefix:(0x48 + id)`.
pub fn vm_mac(prefix: &str, id: usize) -> String {
    format!("{}:{:02x}", prefix, MAC_OFFSET + id)
}

/// Split `memory` into `(dram, slow)` bytes. `dram` is `floor(memory * ratio)`.
pub fn split_memory(memory: u64, dram_ratio: f64) -> (u64, u64) {
    let dram = ((memory as f64) * dram_ratio).floor() as u64;
    let dram = std::cmp::min(dram, memory);
    (dram, memory - dram)
}

/// Everything needed to start one VM. Computed once; in particular the CPU pinning is drawn
/// from the cycler exactly once and never recomputed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    pub id: usize,
    pub ncpus: usize,
    pub memory: u64,
    pub ip: Ipv4Addr,
    pub mac: String,
    pub tap: String,
    /// The VM's working directory on the host (holds its sockets).
    pub cwd: PathBuf,
    /// Host directory exported to the guest as the `Output` tag.
    pub output_dir: PathBuf,
    pub dram_bytes: u64,
    pub slow_bytes: u64,
    pub affinity: AffinityAssignment,
    pub fs_args: Vec<String>,
    pub fs_output_args: Vec<String>,
    pub hypervisor_args: Vec<String>,
}

impl VmConfig {
    pub fn derive(
        spec: &VmSpec,
        cfg: &HostConfig,
        cycler: &CpuAffinityCycler,
    ) -> Result<Self, failure::Error> {
        spec.validate()?;

        let id = spec.id;
        let (dram_bytes, slow_bytes) = split_memory(spec.memory, spec.dram_ratio);
        let affinity = AffinityAssignment::assign(spec.affinity_mode, spec.ncpus, cycler);
        let mac = vm_mac(&cfg.mac_prefix, id);
        let tap = format!("{}{}", cfg.tap_prefix, id);
        let output_dir = cfg.output_root.join(id.to_string());

        let fs_args = vec![
            cfg.file_share_daemon_path.display().to_string(),
            "--cache=never".into(),
            format!("--socket-path={}", FS_SOCKET),
            format!("--shared-dir={}", cfg.shared_dir.display()),
        ];
        let fs_output_args = vec![
            cfg.file_share_daemon_path.display().to_string(),
            "--cache=never".into(),
            format!("--socket-path={}", FS_OUTPUT_SOCKET),
            format!("--shared-dir={}", output_dir.display()),
        ];

        let hypervisor_args = vec![
            cfg.hypervisor_path.display().to_string(),
            "--api-socket".into(),
            format!("path={}", API_SOCKET),
            "--kernel".into(),
            cfg.kernel.clone(),
            "--cmdline".into(),
            cfg.cmdline.clone(),
            "--fs".into(),
            format!("tag=Projects,socket={}", FS_SOCKET),
            format!("tag=Output,socket={}", FS_OUTPUT_SOCKET),
            "--disk".into(),
            format!("path={}", cfg.image),
            "--cpus".into(),
            format!("boot={},affinity=[{}]", spec.ncpus, affinity.to_arg()),
            "--net".into(),
            format!("tap={},mac={}", tap, mac),
            "--balloon".into(),
            format!(
                "size=[{},{}],statistics=on,heterogeneous_memory=on",
                slow_bytes, dram_bytes
            ),
            "--memory".into(),
            "size=0,shared=on".into(),
            "--memory-zone".into(),
            format!(
                "size={},shared=on,host_numa_node={},id=fast",
                spec.memory, cfg.fast_node
            ),
            format!(
                "size={},shared=on,host_numa_node={},id=slow",
                spec.memory,
                cfg.slow_zone_node(spec.memory_mode)
            ),
            "--numa".into(),
            format!(
                "guest_numa_id=0,cpus=0-{},memory_zones=fast",
                spec.ncpus - 1
            ),
            "guest_numa_id=1,memory_zones=slow".into(),
        ];

        Ok(VmConfig {
            id,
            ncpus: spec.ncpus,
            memory: spec.memory,
            ip: vm_ip(cfg.subnet_base, id),
            mac,
            tap,
            cwd: cfg.project_dir.join(format!("vm{}", id)),
            output_dir,
            dram_bytes,
            slow_bytes,
            affinity,
            fs_args,
            fs_output_args,
            hypervisor_args,
        })
    }

    pub fn guest(&self) -> Guest {
        Guest {
            id: self.id,
            ip: self.ip,
        }
    }

    pub fn sockets(&self) -> Vec<PathBuf> {
        [FS_SOCKET, FS_OUTPUT_SOCKET, API_SOCKET]
            .iter()
            .map(|s| self.cwd.join(s))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn for_test(id: usize) -> Self {
        let spec = VmSpec {
            id,
            ncpus: 2,
            memory: 8 << 30,
            dram_ratio: 0.2,
            memory_mode: false,
            affinity_mode: AffinityMode::PerCore,
        };
        let cycler = CpuAffinityCycler::new(1, (0..16).collect());
        VmConfig::derive(&spec, &HostConfig::default(), &cycler).unwrap()
    }
}

/// An ordered set of owned child processes, released together.
///
/// Members are torn down in reverse order of addition. Each member is signalled and then
/// reaped before the next one is touched. Failures are collected, never raised, and every member
/// is attempted. Dropping the group tears it down.
#[derive(Default)]
pub struct ProcessGroup {
    members: Vec<(String, Box<dyn Process>)>,
}

impl ProcessGroup {
    pub fn new() -> Self {
        ProcessGroup { members: vec![] }
    }

    pub fn push(&mut self, name: &str, process: Box<dyn Process>) {
        self.members.push((name.into(), process));
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Wait for the named member to exit on its own.
    pub fn wait_for(&mut self, name: &str) -> Result<ProcessOutput, failure::Error> {
        match self.members.iter_mut().find(|(n, _)| n == name) {
            Some((_, p)) => p.wait(),
            None => Err(failure::format_err!("no process named {}", name)),
        }
    }

    /// Wait for every member to exit on its own, in order of addition, and release them all.
    /// One member failing to be reaped does not stop the others from being waited for.
    pub fn join(&mut self) -> Vec<(String, Result<ProcessOutput, failure::Error>)> {
        self.members
            .drain(..)
            .map(|(name, mut process)| {
                let out = process.wait();
                (name, out)
            })
            .collect()
    }

    /// Terminate and reap every member. Returns the output of each member (in teardown order) and
    /// any failures.
    pub fn teardown(&mut self) -> (Vec<(String, ProcessOutput)>, Vec<TeardownError>) {
        let mut outputs = vec![];
        let mut errors = vec![];

        while let Some((name, mut process)) = self.members.pop() {
            debug!("terminating {} (pid {})", name, process.id());

            if let Err(e) = process.terminate() {
                errors.push(TeardownError::new(&name, e));
            }

            match process.wait() {
                Ok(out) => outputs.push((name, out)),
                Err(e) => errors.push(TeardownError::new(&name, e)),
            }
        }

        (outputs, errors)
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        let (_, errors) = self.teardown();
        for e in errors {
            warn!("{}", e);
        }
    }
}

/// A running VM. Owns its processes exclusively; `kill` (or dropping the handle) releases them.
pub struct VmHandle {
    config: VmConfig,
    group: ProcessGroup,
    live: bool,
}

impl VmHandle {
    /// Start the file-share daemons, give them `settle` to create their sockets, then start the
    /// hypervisor. On failure, whatever was already started is torn down before returning.
    pub fn launch(
        host: &dyn Host,
        config: VmConfig,
        settle: Duration,
    ) -> Result<Self, failure::Error> {
        let id = config.id;
        let setup_err = |step: String, cause: String| SetupError {
            vm: id,
            step,
            cause,
        };

        // From here on, an early return drops `vm`, which kills whatever is already running.
        let mut vm = VmHandle {
            config,
            group: ProcessGroup::new(),
            live: true,
        };

        for dir in &[vm.config.cwd.clone(), vm.config.output_dir.clone()] {
            std::fs::create_dir_all(dir)
                .map_err(|e| setup_err(format!("creating {}", dir.display()), e.to_string()))?;
        }

        let daemons = vec![
            (FS_DAEMON, vm.config.fs_args.clone()),
            (FS_OUTPUT_DAEMON, vm.config.fs_output_args.clone()),
        ];
        for (name, args) in daemons {
            let process = host
                .spawn(&HostCommand::from_argv(args.as_slice()).cwd(&vm.config.cwd))
                .map_err(|e| setup_err(format!("starting {}", name), e.to_string()))?;
            vm.group.push(name, process);
        }

        std::thread::sleep(settle);

        let cmd = HostCommand::from_argv(vm.config.hypervisor_args.as_slice()).cwd(&vm.config.cwd);
        let hypervisor = host
            .spawn(&cmd)
            .map_err(|e| setup_err(format!("starting {}", HYPERVISOR), e.to_string()))?;
        info!(
            "vm{}: {} started (pid {}), vCPUs pinned to {}",
            id,
            HYPERVISOR,
            hypervisor.id(),
            vm.config.affinity.to_arg()
        );
        vm.group.push(HYPERVISOR, hypervisor);

        Ok(vm)
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Block until the hypervisor exits by itself (e.g. the guest shut down or someone killed
    /// it).
    pub fn wait(&mut self) -> Result<ProcessOutput, failure::Error> {
        self.group.wait_for(HYPERVISOR)
    }

    /// Stop the hypervisor, then the file-share daemons, then clean up sockets and the output
    /// directory. Every step is attempted; failures are returned, not raised. Killing a dead VM
    /// is a no-op.
    pub fn kill(&mut self) -> Vec<TeardownError> {
        if !self.live {
            return vec![];
        }
        self.live = false;

        let id = self.config.id;
        let (outputs, mut errors) = self.group.teardown();

        for (name, out) in outputs {
            if name == HYPERVISOR {
                info!(
                    "vm{} {} args:\n{:?}",
                    id, HYPERVISOR, self.config.hypervisor_args
                );
                info!(
                    "vm{} {} stdout:\n{}\nvm{} {} stderr:\n{}",
                    id, HYPERVISOR, out.stdout, id, HYPERVISOR, out.stderr
                );
            } else {
                debug!("vm{} {} exited with {:?}", id, name, out.code);
            }
        }

        for socket in self.config.sockets() {
            if let Err(e) = remove_if_exists(&socket, false) {
                errors.push(TeardownError::new(socket.display().to_string(), e));
            }
        }

        if let Err(e) = remove_if_exists(&self.config.output_dir, true) {
            errors.push(TeardownError::new(
                self.config.output_dir.display().to_string(),
                e,
            ));
        }

        // The output root is shared between VMs; only the last one out removes it.
        if let Some(root) = self.config.output_dir.parent() {
            let _ = std::fs::remove_dir(root);
        }

        info!("vm{} cleaned up", id);
        errors
    }
}

impl Drop for VmHandle {
    fn drop(&mut self) {
        for e in self.kill() {
            warn!("{}", e);
        }
    }
}

/// Remove a file (or a directory tree). A missing path is fine: it was never created or is
/// already gone.
fn remove_if_exists(path: &Path, dir: bool) -> std::io::Result<()> {
    let res = if dir {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };

    match res {
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
