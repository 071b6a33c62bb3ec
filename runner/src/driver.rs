//! Running benchmarks end to end: fleet up, guests prepared, benchmark, results on disk, fleet
//! down.

use std::path::{Path, PathBuf};

use log::{error, info, warn};

use crate::bench::{BenchContext, Benchmark};
use crate::fleet::{with_fleet, FleetOptions};
use crate::guest::{mount_shared_dirs, set_guest_numa_balancing};

/// Run `bench` once on a fresh fleet shaped by `opts`, and write its report into `out_dir`.
///
/// The log is named after the run's settings, with a `.params` file next to it. If the run fails,
/// both are removed again so that only complete results are left behind.
pub fn run_benchmark(
    ctx: &BenchContext<'_>,
    opts: &FleetOptions,
    bench: &mut dyn Benchmark,
    out_dir: &Path,
) -> Result<PathBuf, failure::Error> {
    let settings = settings! {
        * bench: bench.name(),
        * num: opts.num,
        ncpus: opts.ncpus,
        * memory: opts.memory,
        * dram_ratio: opts.dram_ratio,
        memory_mode: opts.memory_mode,
        bind: opts.affinity_mode,
        host: ctx.cfg,
    };
    let log = settings.create_files(out_dir)?;
    let params = out_dir.join(settings.gen_file_name("params"));

    info!("running {} on {} vms, results in {}", bench.name(), opts.num, log.display());

    let result = with_fleet(ctx.host, ctx.remote, ctx.cfg, opts, ctx.cancel, |fleet| {
        let guests = fleet.guests();
        if ctx.cfg.mount_shared {
            mount_shared_dirs(ctx.remote, &guests, &ctx.cfg.guest_user);
        }
        set_guest_numa_balancing(ctx.remote, &guests, false)?;

        info!("benchmark to run: {}", bench.name());
        let run = bench.run(ctx, fleet)?;
        info!("benchmark finished: {}", bench.name());
        Ok(run)
    });

    let run = match result {
        Ok(run) => run,
        Err(e) => {
            for f in &[&log, &params] {
                let _ = std::fs::remove_file(f);
            }
            return Err(e);
        }
    };

    for e in run.failed_clients() {
        warn!("{}", e);
    }

    std::fs::write(&log, run.report())?;
    Ok(log)
}

/// Run a fresh benchmark for every combination of VM count and DRAM ratio. A failing combination
/// is reported and skipped. Returns the combinations that failed.
pub fn sweep<F>(
    ctx: &BenchContext<'_>,
    base: &FleetOptions,
    nums: &[usize],
    ratios: &[f64],
    mut make_bench: F,
    out_dir: &Path,
) -> Vec<(usize, f64)>
where
    F: FnMut() -> Box<dyn Benchmark>,
{
    let mut failed = vec![];

    for &num in nums {
        for &dram_ratio in ratios {
            if ctx.cancel.is_cancelled() {
                warn!("sweep cancelled before num {} dram ratio {}", num, dram_ratio);
                failed.push((num, dram_ratio));
                continue;
            }

            let opts = base.reshaped(num, dram_ratio);
            let mut bench = make_bench();

            if let Err(e) = run_benchmark(ctx, &opts, bench.as_mut(), out_dir) {
                error!("failed case: num {} dram ratio {}: {}", num, dram_ratio, e);
                failed.push((num, dram_ratio));
            }
        }
    }

    failed
}
