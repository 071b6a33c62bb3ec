//! The key-value benchmark: a redis server in every guest, preloaded from a dataset file, driven
//! by one YCSB client per VM running on the host.
//!
//! The run goes through `RunState`s strictly in order. No client is started before every server
//! reports the full dataset, and results are collected in VM order no matter which client
//! finishes first.

use std::time::Instant;

use log::{debug, info, warn};

use crate::bench::{BenchContext, Benchmark, BenchmarkRun, ClientResult, RunState};
use crate::config::{HostConfig, KV_SERVER_PORT};
use crate::cpu::cpus_to_string;
use crate::error::SetupError;
use crate::fleet::Fleet;
use crate::host::HostCommand;
use crate::poll::poll_until;
use crate::remote::{Guest, RemoteExec};
use crate::vm::{ProcessGroup, VmConfig};
use crate::workloads::YcsbWorkload;

/// Name of the detached guest session running the server.
pub const SERVER_SESSION: &str = "kv-server";

/// Where `perf record` writes its samples, relative to the guest user's home.
const PERF_DATA: &str = "perf.data";

pub struct KvBenchmark {
    workload: YcsbWorkload,
    /// Client threads per VM.
    threads: usize,
    memory_mode: bool,
    /// If set, the server runs under `perf record -e <event>`.
    perf_event: Option<String>,
    /// Host CPUs the clients are pinned to.
    client_cpus: Vec<usize>,
    state: RunState,
}

impl KvBenchmark {
    pub fn new(
        workload: YcsbWorkload,
        threads: usize,
        memory_mode: bool,
        perf_event: Option<String>,
        client_cpus: Vec<usize>,
    ) -> Self {
        KvBenchmark {
            workload,
            threads,
            memory_mode,
            perf_event,
            client_cpus,
            state: RunState::NotStarted,
        }
    }

    /// The same benchmark, not yet started. Used to run it again on another fleet.
    pub fn fresh(&self) -> Self {
        KvBenchmark::new(
            self.workload,
            self.threads,
            self.memory_mode,
            self.perf_event.clone(),
            self.client_cpus.clone(),
        )
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, to: RunState) {
        debug_assert!(to > self.state);
        info!("{}: {:?} -> {:?}", self.name(), self.state, to);
        self.state = to;
    }

    /// The server command line, run in the guest.
    pub fn server_argv(&self, cfg: &HostConfig) -> Vec<String> {
        let mut argv = vec![];

        if let Some(event) = &self.perf_event {
            argv.extend(argv![
                "sudo",
                "perf",
                "record",
                "--all-user",
                "--phys-data",
                "--data",
                "-z",
                "-vv",
                "-e",
                event,
                "-o",
                PERF_DATA,
                "--"
            ]);
        }

        argv.extend(argv![
            "redis-server",
            "--save",
            "",
            "--appendonly",
            "no",
            "--protected-mode",
            "no",
            "--dbfilename",
            cfg.ycsb_preloaded(),
            "--dir",
            cfg.project_dir.display()
        ]);

        argv
    }

    /// The client for one VM, run on the host: pinned to the client CPUs, with memory on the node
    /// backing the VM's slow zone.
    pub fn client_command(
        &self,
        cfg: &HostConfig,
        vm: &VmConfig,
    ) -> Result<HostCommand, failure::Error> {
        let params = cfg.workload_params(self.workload)?;

        let cmd = HostCommand::new("numactl")
            .arg(format!("--physcpubind={}", cpus_to_string(&self.client_cpus)))
            .arg(format!("--membind={}", cfg.slow_zone_node(self.memory_mode)))
            .arg("--")
            .arg(cfg.ycsb_client_path.display().to_string())
            .args(&["run", "redis"])
            .args(&["-p", &format!("recordcount={}", cfg.ycsb_record_count)])
            .args(&["-p", &format!("operationcount={}", cfg.ycsb_operation_count)])
            .args(&["-p", &format!("threadcount={}", self.threads)])
            .args(&params.to_client_args())
            .args(&["-p", &format!("redis.addr={}", target(vm))])
            .cwd(&vm.cwd);

        Ok(cmd)
    }

    /// True if every server reports exactly `expected` records. Unreachable servers and garbage
    /// answers count as not loaded yet.
    fn preloaded(remote: &dyn RemoteExec, guests: &[Guest], expected: usize) -> bool {
        guests.iter().all(|guest| {
            match remote.run(guest, &argv!["redis-cli", "dbsize"], false) {
                Ok(out) => {
                    let loaded = out.trim().parse::<usize>().ok();
                    debug!("vm{}: {:?}/{} records", guest.id, loaded, expected);
                    loaded == Some(expected)
                }
                Err(e) => {
                    debug!("{}", e);
                    false
                }
            }
        })
    }

    /// Stop the servers and collect `perf script` from every guest. Best effort: failures are
    /// logged and leave an empty entry.
    fn collect_perf(remote: &dyn RemoteExec, guests: &[Guest]) -> Vec<String> {
        for guest in guests {
            if let Err(e) = remote.run(guest, &argv!["sudo", "pkill", "redis-server"], true) {
                warn!("{}", e);
            }
        }

        let perf_script = argv![
            "sudo",
            "perf",
            "--no-pager",
            "script",
            "--header",
            format!("--input={}", PERF_DATA)
        ];
        guests
            .iter()
            .map(|guest| {
                remote.run(guest, &perf_script, true).unwrap_or_else(|e| {
                    warn!("{}", e);
                    String::new()
                })
            })
            .collect()
    }
}

fn target(vm: &VmConfig) -> String {
    format!("{}:{}", vm.ip, KV_SERVER_PORT)
}

impl Benchmark for KvBenchmark {
    fn name(&self) -> String {
        format!("redis-ycsb-{}", self.workload)
    }

    fn run(
        &mut self,
        ctx: &BenchContext<'_>,
        fleet: &mut Fleet<'_>,
    ) -> Result<BenchmarkRun, failure::Error> {
        let cfg = ctx.cfg;
        let guests = fleet.guests();
        let vms: Vec<VmConfig> = fleet.vms().iter().map(|vm| vm.config().clone()).collect();

        let mut run = BenchmarkRun::new(self.workload.to_string());
        run.targets = vms.iter().map(target).collect();
        run.record_count = Some(cfg.ycsb_record_count);
        run.operation_count = Some(cfg.ycsb_operation_count);
        let mut timings = vec![];

        // Start every server. There is no confirmation that a server actually came up; that is
        // what the preload wait is for.
        self.transition(RunState::ServerStarting);
        let server = self.server_argv(cfg);
        for guest in &guests {
            ctx.remote
                .run_detached(guest, SERVER_SESSION, &server, None)
                .map_err(|e| SetupError {
                    vm: guest.id,
                    step: "starting the key-value server".into(),
                    cause: e.to_string(),
                })?;
        }
        info!("all servers started");

        self.transition(RunState::WaitingPreload);
        time!(timings, "preload", {
            // Loading takes a while; no point in asking right away.
            std::thread::sleep(cfg.preload_settle);
            poll_until(&cfg.preload_poll, ctx.cancel, "dataset preload", || {
                Ok(Self::preloaded(ctx.remote, &guests, cfg.ycsb_record_count))
            })?
        });
        info!("ycsb preload complete");

        self.transition(RunState::ClientsRunning);
        let mut clients = ProcessGroup::new();
        for vm in &vms {
            let cmd = self.client_command(cfg, vm)?;
            let client = ctx.host.spawn(&cmd).map_err(|e| SetupError {
                vm: vm.id,
                step: "starting the ycsb client".into(),
                cause: e.to_string(),
            })?;
            info!("vm{}: client pid {} -> {}", vm.id, client.id(), target(vm));
            clients.push(&format!("vm{}", vm.id), client);
        }

        let start = Instant::now();
        let outputs = clients.join();
        timings.push(("clients", start.elapsed()));

        self.transition(RunState::Collected);
        for (vm, (name, out)) in vms.iter().zip(outputs) {
            let out = out.map_err(|e| failure::format_err!("reaping client {}: {}", name, e))?;
            let result = ClientResult::new(vm.id, out);
            if let Some(e) = &result.error {
                warn!("{}", e);
            }
            run.results.push(result);
        }

        if self.perf_event.is_some() {
            let perf = time!(timings, "perf", Self::collect_perf(ctx.remote, &guests));
            run.sections.push(("perf script".into(), perf));
        }

        run.timings = timings;
        info!("{} workload complete", self.name());
        Ok(run)
    }
}
