//! GAP betweenness centrality (`bc`) in every guest.

use log::info;

use crate::bench::{BenchContext, Benchmark, BenchmarkRun};
use crate::config::HostConfig;
use crate::error::SetupError;
use crate::fleet::Fleet;
use crate::poll::poll_until;
use crate::remote::{run_all, session_running};

const SESSION: &str = "gap_bc";
const OUTPUT: &str = "/tmp/gap_bc";

/// One iteration of one trial takes about 40s on the default graph.
pub struct GraphBenchmark {
    ntrials: usize,
    niters: usize,
}

impl GraphBenchmark {
    pub fn new(ntrials: usize, niters: usize) -> Self {
        GraphBenchmark { ntrials, niters }
    }

    /// The benchmark command line, run in the guest under `/bin/time -v`.
    pub fn bc_argv(&self, cfg: &HostConfig) -> Vec<String> {
        argv![
            "/bin/time",
            "-v",
            "--",
            cfg.gap_dir.join("bc").display(),
            "-n",
            self.ntrials,
            "-i",
            self.niters,
            "-f",
            cfg.gap_dir.join(&cfg.gap_graph).display()
        ]
    }
}

impl Benchmark for GraphBenchmark {
    fn name(&self) -> String {
        "gap-bc".into()
    }

    fn run(
        &mut self,
        ctx: &BenchContext<'_>,
        fleet: &mut Fleet<'_>,
    ) -> Result<BenchmarkRun, failure::Error> {
        let guests = fleet.guests();
        let mut run = BenchmarkRun::new(self.name());
        run.targets = guests.iter().map(|g| g.ip.to_string()).collect();
        let mut timings = vec![];

        let argv = self.bc_argv(ctx.cfg);
        for guest in &guests {
            ctx.remote
                .run_detached(guest, SESSION, &argv, Some(OUTPUT))
                .map_err(|e| SetupError {
                    vm: guest.id,
                    step: "starting gap bc".into(),
                    cause: e.to_string(),
                })?;
        }
        info!("gap bc started in {} vms", guests.len());

        time!(
            timings,
            "bc",
            poll_until(&ctx.cfg.graph_poll, ctx.cancel, "gap bc to finish", || {
                Ok(!guests
                    .iter()
                    .any(|guest| session_running(ctx.remote, guest, SESSION)))
            })?
        );

        let outputs = run_all(ctx.remote, &guests, &argv!["cat", OUTPUT], true)?;
        run.sections.push((SESSION.into(), outputs));

        let dmesg = run_all(ctx.remote, &guests, &argv!["sudo", "dmesg"], true)?;
        run.sections.push(("dmesg".into(), dmesg));

        run.timings = timings;
        info!("gap bc workload complete");
        Ok(run)
    }
}
