//! Host CPU topology and vCPU pinning.

use std::sync::{Arc, Mutex};

use failure::ResultExt;

use log::warn;

use serde::{Deserialize, Serialize};

/// Where the kernel publishes the CPUs of each NUMA node.
const SYSFS_NODE_DIR: &str = "/sys/devices/system/node";

/// Parse a kernel cpulist (e.g. `0-3,8,10-11`) into a list of CPU ids, in order.
pub fn parse_cpulist(list: &str) -> Result<Vec<usize>, failure::Error> {
    let mut cpus = vec![];

    for range in list.trim().split(',').filter(|r| !r.is_empty()) {
        let mut ends = range.splitn(2, '-');
        let start = ends
            .next()
            .unwrap()
            .trim()
            .parse::<usize>()
            .with_context(|_| format!("parsing cpulist `{}`", list))?;
        let end = match ends.next() {
            Some(end) => end
                .trim()
                .parse::<usize>()
                .with_context(|_| format!("parsing cpulist `{}`", list))?,
            None => start,
        };

        if end < start {
            failure::bail!("Invalid cpulist range `{}`", range);
        }

        cpus.extend(start..=end);
    }

    Ok(cpus)
}

/// Returns the host CPUs of the given NUMA node.
pub fn node_to_cpus(node: usize) -> Result<Vec<usize>, failure::Error> {
    let path = format!("{}/node{}/cpulist", SYSFS_NODE_DIR, node);
    let list = std::fs::read_to_string(&path).with_context(|_| format!("reading {}", path))?;
    let cpus = parse_cpulist(&list)?;

    if cpus.is_empty() {
        failure::bail!("NUMA node {} has no CPUs", node);
    }

    Ok(cpus)
}

/// Format a list of CPUs the way `numactl --physcpubind` wants it.
pub fn cpus_to_string(cpus: &[usize]) -> String {
    cpus.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// How guest vCPUs are pinned to host CPUs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AffinityMode {
    /// Each vCPU gets its own host CPU, drawn from the shared cycler.
    PerCore,
    /// Every vCPU may run on any CPU of the VM node. Oversubscribed; used for baselines.
    WholeNode,
}

impl std::str::FromStr for AffinityMode {
    type Err = failure::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "core" | "percore" => Ok(AffinityMode::PerCore),
            "node" | "wholenode" => Ok(AffinityMode::WholeNode),
            _ => Err(failure::format_err!("Unknown affinity mode `{}`", s)),
        }
    }
}

#[derive(Debug)]
struct CyclerState {
    /// The CPUs of the node, in visiting order.
    cpus: Vec<usize>,
    /// Number of CPUs handed out so far.
    drawn: usize,
    /// Whether we already warned about reusing CPUs.
    warned: bool,
}

/// An endless round-robin over the CPUs of one NUMA node.
///
/// Clones share the same position, so VMs drawing from clones of one cycler get disjoint CPUs
/// until the node is used up. After that, ids repeat and a warning is logged once.
#[derive(Debug, Clone)]
pub struct CpuAffinityCycler {
    node: usize,
    state: Arc<Mutex<CyclerState>>,
}

impl CpuAffinityCycler {
    /// Create a cycler over the given CPUs of `node`.
    ///
    /// # Panics
    ///
    /// If `cpus` is empty. `for_node` reports an empty node as an error instead.
    pub fn new(node: usize, cpus: Vec<usize>) -> Self {
        assert!(!cpus.is_empty());
        CpuAffinityCycler {
            node,
            state: Arc::new(Mutex::new(CyclerState {
                cpus,
                drawn: 0,
                warned: false,
            })),
        }
    }

    /// Create a cycler over the CPUs the host reports for `node`.
    pub fn for_node(node: usize) -> Result<Self, failure::Error> {
        Ok(Self::new(node, node_to_cpus(node)?))
    }

    pub fn node(&self) -> usize {
        self.node
    }

    /// All CPUs of the node, in visiting order.
    pub fn node_cpus(&self) -> Vec<usize> {
        self.state.lock().unwrap().cpus.clone()
    }

    /// Consume exactly the next `k` CPUs. The draw is atomic with respect to other holders.
    pub fn take(&self, k: usize) -> Vec<usize> {
        let mut state = self.state.lock().unwrap();
        let ncpus = state.cpus.len();

        let taken: Vec<_> = (state.drawn..state.drawn + k)
            .map(|i| state.cpus[i % ncpus])
            .collect();
        state.drawn += k;

        if state.drawn > ncpus && !state.warned {
            state.warned = true;
            warn!(
                "{} vCPUs pinned to node {} which only has {} CPUs; host CPUs are now shared",
                state.drawn, self.node, ncpus
            );
        }

        taken
    }
}

/// The host CPUs each vCPU may run on, indexed by vCPU. Computed once per VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityAssignment(Vec<Vec<usize>>);

impl AffinityAssignment {
    /// Pin `ncpus` vCPUs according to `mode`. Only `PerCore` advances the cycler.
    pub fn assign(mode: AffinityMode, ncpus: usize, cycler: &CpuAffinityCycler) -> Self {
        match mode {
            AffinityMode::PerCore => {
                AffinityAssignment(cycler.take(ncpus).into_iter().map(|c| vec![c]).collect())
            }
            AffinityMode::WholeNode => {
                let node = cycler.node_cpus();
                AffinityAssignment((0..ncpus).map(|_| node.clone()).collect())
            }
        }
    }

    pub fn vcpus(&self) -> &[Vec<usize>] {
        &self.0
    }

    /// The union of all host CPUs used.
    pub fn host_cpus(&self) -> Vec<usize> {
        let mut all: Vec<_> = self.0.iter().flatten().cloned().collect();
        all.sort_unstable();
        all.dedup();
        all
    }

    /// Render as the hypervisor expects: `0@[4],1@[5]`.
    pub fn to_arg(&self) -> String {
        self.0
            .iter()
            .enumerate()
            .map(|(vcpu, host)| format!("{}@[{}]", vcpu, cpus_to_string(host)))
            .collect::<Vec<_>>()
            .join(",")
    }
}
