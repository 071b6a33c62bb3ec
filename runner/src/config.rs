//! Host layout and tunables.
//!
//! Everything that used to be a module-level constant in the experiment scripts lives in
//! `HostConfig`, which is built once (defaults, optionally overlaid by a JSON file) and passed by
//! reference to whoever needs it.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use failure::ResultExt;

use serde::{Deserialize, Serialize};

use crate::poll::PollPolicy;
use crate::workloads::{default_workload_parameter_sets, WorkloadParams, YcsbWorkload};

/// Kernel command line of the guest image.
pub const DEFAULT_CMDLINE: &[&str] = &[
    "psi=1",
    "root=/dev/vda2",
    "rw",
    "rootfstype=ext4,btrfs,xfs,f2fs",
    "console=hvc0",
    "console=ttyS0,115200n8",
    "console=tty0",
    "module.sig_enforce=0",
    "mitigations=off",
    "cryptomgr.notests",
    "quiet",
    "init=/usr/lib/systemd/systemd-bootchart",
    "no_timer_check",
    "tsc=reliable",
    "noreplace-smp",
    "page_alloc.shuffle=1",
];

/// The last octet of vm0's address. VM `i` gets `IP_OFFSET + i`.
pub const IP_OFFSET: usize = 166;

/// The last byte of vm0's MAC. VM `i` gets `MAC_OFFSET + i`.
pub const MAC_OFFSET: usize = 0x48;

/// VM ids must leave the last address octet below the broadcast address (`IP_OFFSET + id <= 254`),
/// which also keeps the last MAC byte within two hex digits.
pub const MAX_VMS: usize = 255 - IP_OFFSET;

/// Port the key-value server listens on inside each guest.
pub const KV_SERVER_PORT: u16 = 6379;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Shared with the guests as the `Projects` tag; holds per-VM working dirs and datasets.
    pub project_dir: PathBuf,
    /// The directory exported by the file-share daemon.
    pub shared_dir: PathBuf,
    /// Per-VM output directories (exported as the `Output` tag) are created under here.
    pub output_root: PathBuf,

    pub hypervisor_path: PathBuf,
    pub file_share_daemon_path: PathBuf,
    pub ycsb_client_path: PathBuf,

    /// Kernel and disk image, relative to each VM's working dir.
    pub kernel: String,
    pub image: String,
    pub cmdline: String,

    /// The user we log into the guests as.
    pub guest_user: String,
    /// Mount the shared directories in the guests after boot, for images that don't do it
    /// themselves.
    pub mount_shared: bool,
    /// Give up on reaching a guest's SSH port after this long. Keeps a single boot or preload
    /// query from outliving the poll deadline it runs under.
    pub ssh_connect_timeout: Duration,

    /// libvirt network providing DHCP to the guests, and its bridge.
    pub network_name: String,
    pub bridge: String,
    /// The /24 the guests live in; only the first three octets are used.
    pub subnet_base: Ipv4Addr,
    /// First five bytes of every guest MAC.
    pub mac_prefix: String,
    pub tap_prefix: String,

    /// Host NUMA node running the vCPUs.
    pub vm_cpu_node: usize,
    /// The CPUs of `vm_cpu_node` to pin vCPUs to. Read from sysfs if unset.
    pub vm_cpus: Option<Vec<usize>>,
    /// Host NUMA node running the benchmark clients.
    pub client_cpu_node: usize,
    /// Host NUMA node backing the `fast` memory zone.
    pub fast_node: usize,
    /// Host NUMA node backing the `slow` memory zone.
    pub slow_node: usize,

    pub ycsb_record_count: usize,
    pub ycsb_operation_count: usize,
    /// Preloaded dataset file in `project_dir`. Defaults to `ycsb-<records>.rdb`.
    pub ycsb_preloaded: Option<String>,
    pub workload_parameter_sets: BTreeMap<YcsbWorkload, WorkloadParams>,

    /// GAP benchmark suite directory and input graph, as seen from the guest.
    pub gap_dir: PathBuf,
    pub gap_graph: String,

    /// Delay between starting the file-share daemons and the hypervisor.
    pub settle: Duration,
    /// Delay before the first preload query; loading takes a while anyway.
    pub preload_settle: Duration,

    pub boot_poll: PollPolicy,
    pub preload_poll: PollPolicy,
    pub graph_poll: PollPolicy,
}

impl Default for HostConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".into());
        let project_dir = PathBuf::from(&home).join("Projects/ch-test");
        let shared_dir = project_dir.join("..");

        HostConfig {
            hypervisor_path: shared_dir.join("cloud-hypervisor/target/release/cloud-hypervisor"),
            file_share_daemon_path: project_dir.join("base/virtiofsd"),
            ycsb_client_path: project_dir.join("base/go-ycsb"),
            gap_dir: shared_dir.join("gapbs"),
            project_dir,
            shared_dir,
            output_root: PathBuf::from("/tmp/ch-out"),

            kernel: "vmlinux.bin".into(),
            image: "clr.img".into(),
            cmdline: DEFAULT_CMDLINE.join(" "),

            guest_user: std::env::var("USER").unwrap_or_else(|_| "root".into()),
            mount_shared: false,
            ssh_connect_timeout: Duration::from_secs(1),

            network_name: "default".into(),
            bridge: "virbr0".into(),
            subnet_base: Ipv4Addr::new(192, 168, 122, 0),
            mac_prefix: "2e:89:a8:e4:b9".into(),
            tap_prefix: "ich".into(),

            vm_cpu_node: 1,
            vm_cpus: None,
            client_cpu_node: 0,
            fast_node: 1,
            slow_node: 2,

            ycsb_record_count: 3_000_000,
            ycsb_operation_count: 5_000_000,
            ycsb_preloaded: None,
            workload_parameter_sets: default_workload_parameter_sets(),

            gap_graph: "kronecker-s25d24.sg".into(),

            settle: Duration::from_secs(1),
            preload_settle: Duration::from_secs(15),

            boot_poll: PollPolicy::new(Duration::from_secs(1), Some(Duration::from_secs(600))),
            preload_poll: PollPolicy::new(Duration::from_secs(1), Some(Duration::from_secs(1800))),
            graph_poll: PollPolicy::new(Duration::from_secs(5), Some(Duration::from_secs(7200))),
        }
    }
}

impl HostConfig {
    /// Load defaults overlaid with the JSON file at `path`.
    pub fn load(path: &Path) -> Result<Self, failure::Error> {
        let contents = std::fs::read_to_string(path)
            .with_context(|_| format!("reading config {}", path.display()))?;
        let cfg = serde_json::from_str(&contents)
            .with_context(|_| format!("parsing config {}", path.display()))?;
        Ok(cfg)
    }

    /// The preloaded dataset the key-value server starts from.
    pub fn ycsb_preloaded(&self) -> String {
        self.ycsb_preloaded
            .clone()
            .unwrap_or_else(|| format!("ycsb-{}.rdb", self.ycsb_record_count))
    }

    /// The request mix for `workload`.
    pub fn workload_params(&self, workload: YcsbWorkload) -> Result<&WorkloadParams, failure::Error> {
        self.workload_parameter_sets
            .get(&workload)
            .ok_or_else(|| failure::format_err!("No parameters for YCSB workload {}", workload))
    }

    /// Host node backing the `slow` zone. In memory mode both zones sit on the fast node, which
    /// gives the A/B baseline for the tiering feature.
    pub fn slow_zone_node(&self, memory_mode: bool) -> usize {
        if memory_mode {
            self.fast_node
        } else {
            self.slow_node
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_overlays_defaults() {
        let cfg: HostConfig =
            serde_json::from_str(r#"{ "vm_cpu_node": 3, "ycsb_record_count": 10 }"#).unwrap();
        assert_eq!(cfg.vm_cpu_node, 3);
        assert_eq!(cfg.ycsb_record_count, 10);
        assert_eq!(cfg.ycsb_preloaded(), "ycsb-10.rdb");
        assert_eq!(cfg.fast_node, HostConfig::default().fast_node);
        assert_eq!(cfg.workload_parameter_sets.len(), 6);
    }

    #[test]
    fn unbounded_deadline_from_json() {
        let cfg: HostConfig = serde_json::from_str(
            r#"{ "boot_poll": { "interval": { "secs": 2, "nanos": 0 }, "deadline": null } }"#,
        )
        .unwrap();
        assert_eq!(cfg.boot_poll.interval, Duration::from_secs(2));
        assert_eq!(cfg.boot_poll.deadline, None);
    }

    #[test]
    fn connect_timeout_defaults_to_a_second() {
        assert_eq!(
            HostConfig::default().ssh_connect_timeout,
            Duration::from_secs(1)
        );
        let cfg: HostConfig = serde_json::from_str(
            r#"{ "ssh_connect_timeout": { "secs": 0, "nanos": 250000000 } }"#,
        )
        .unwrap();
        assert_eq!(cfg.ssh_connect_timeout, Duration::from_millis(250));
    }

    #[test]
    fn memory_mode_swaps_slow_node() {
        let cfg = HostConfig::default();
        assert_eq!(cfg.slow_zone_node(false), cfg.slow_node);
        assert_eq!(cfg.slow_zone_node(true), cfg.fast_node);
    }
}
