//! One-time preparation of the host before a batch of runs.

use bitflags::bitflags;

use log::info;

use crate::config::HostConfig;
use crate::host::{Host, HostCommand};

bitflags! {
    pub struct HostPrep: u32 {
        /// Online the persistent memory devices as system RAM (the slow NUMA node).
        const PMEM = 1;
        /// Start libvirtd so the virtual network exists.
        const NETWORK = 1 << 1;
        /// Cap the CPU frequency so runs are comparable.
        const FREQ = 1 << 2;
        /// Disable automatic NUMA balancing on the host.
        const NUMA = 1 << 3;
        /// Turn off all swap devices.
        const SWAP = 1 << 4;
        /// Remove stale sockets left in the project dir by an earlier crash.
        const CLEAN = 1 << 5;
    }
}

impl HostPrep {
    const NAMES: &'static [(&'static str, HostPrep)] = &[
        ("pmem", HostPrep::PMEM),
        ("network", HostPrep::NETWORK),
        ("freq", HostPrep::FREQ),
        ("numa", HostPrep::NUMA),
        ("swap", HostPrep::SWAP),
        ("clean", HostPrep::CLEAN),
    ];

    /// Parse a comma-separated list of step names, e.g. `freq,swap`.
    pub fn from_names(names: &str) -> Result<Self, failure::Error> {
        let mut steps = HostPrep::empty();
        for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            match HostPrep::NAMES.iter().find(|(n, _)| *n == name) {
                Some((_, step)) => steps |= *step,
                None => failure::bail!("Unknown host preparation step `{}`", name),
            }
        }
        Ok(steps)
    }

    /// The shell command implementing a single step.
    fn script(self, cfg: &HostConfig) -> String {
        match self {
            HostPrep::PMEM => "sudo daxctl reconfigure-device --human --mode=system-ram all".into(),
            HostPrep::NETWORK => "sudo systemctl --no-pager --full start libvirtd".into(),
            HostPrep::FREQ => {
                "echo 3000000 | sudo tee /sys/devices/system/cpu/cpu*/cpufreq/scaling_max_freq"
                    .into()
            }
            HostPrep::NUMA => "sudo sysctl -w kernel.numa_balancing=0".into(),
            HostPrep::SWAP => {
                "sudo swapon --noheadings --show=NAME | xargs -r -n1 sudo swapoff || true".into()
            }
            HostPrep::CLEAN => format!(
                "find '{}' -name '*.socket' -delete",
                cfg.project_dir.display()
            ),
            _ => unreachable!("not a single step"),
        }
    }
}

/// Run the selected preparation steps in a fixed order. Any failing step aborts.
pub fn prepare_host(host: &dyn Host, cfg: &HostConfig, steps: HostPrep) -> Result<(), failure::Error> {
    for (name, step) in HostPrep::NAMES {
        if steps.contains(*step) {
            info!("host prep: {}", name);
            host.run(&HostCommand::new("bash").args(&["-c", &step.script(cfg)]))?;
        }
    }
    Ok(())
}
