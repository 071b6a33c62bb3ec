//! Launch fleets of VMs with tiered (fast/slow NUMA) memory on a single host and drive
//! benchmarks across them.
//!
//! The pieces, roughly bottom up:
//!
//! - `cpu`: the CPU cycler handing out disjoint vCPU pinnings.
//! - `net`: DHCP leases and tap devices per VM.
//! - `vm`: one VM, i.e. two file-share daemons and a hypervisor, owned as a process group.
//! - `fleet`: N VMs plus their networking as a single scoped resource.
//! - `remote`: commands inside the guests over SSH.
//! - `bench`: the benchmarks run on a ready fleet.

// Must be imported first because the other submodules use the macros defined therein.
#[macro_use]
mod macros;

#[macro_use]
pub mod output;

pub mod bench;
pub mod cli;
pub mod config;
pub mod cpu;
pub mod driver;
pub mod error;
pub mod fleet;
pub mod guest;
pub mod host;
pub mod hostprep;
pub mod net;
pub mod poll;
pub mod remote;
pub mod vm;
pub mod workloads;

/// Given an array of timings, generate a human-readable string.
pub fn timings_str(timings: &[(&str, std::time::Duration)]) -> String {
    let mut s = String::new();
    for (label, d) in timings.iter() {
        s.push_str(&format!("{}: {:?}\n", label, d));
    }
    s
}
